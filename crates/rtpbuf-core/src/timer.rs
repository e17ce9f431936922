//! Shared deadline timer set
//!
//! One ordered set carries every pending deadline of the engine: the initial
//! buffering deadline, per-seqnum retransmission timers and per-seqnum loss
//! timers. Firing strictly in `(deadline, seqnum)` order is what makes the
//! engine's output deterministic, so all three kinds live in the same queue.
//!
//! A timer with `fire == None` is due immediately and sorts before every
//! scheduled deadline. At most one timer exists per sequence number.

use std::collections::{BTreeSet, HashMap};

use crate::{ClockTime, RtpSequenceNumber};

/// What a timer does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Initial buffering deadline for the very first packet
    Deadline,

    /// A missing packet that should be requested for retransmission
    Expected,

    /// A missing packet (or span) to declare lost
    Lost,
}

/// One pending deadline
#[derive(Debug, Clone)]
pub struct Timer {
    /// Action when the timer fires
    pub kind: TimerKind,

    /// First sequence number the timer covers
    pub seqnum: RtpSequenceNumber,

    /// Number of consecutive sequence numbers covered (1 except for
    /// coalesced lost spans)
    pub count: u16,

    /// Expected running time of the (first) covered slot
    pub base: ClockTime,

    /// Absolute fire time; `None` fires on the next clock advance
    pub fire: Option<ClockTime>,

    /// Estimated duration of the covered slots
    pub duration: ClockTime,

    /// Time the most recent retransmission request was sent
    pub rtx_last: Option<ClockTime>,

    /// Number of retransmission requests sent so far
    pub rtx_retry: u32,

    /// Number of retransmitted deliveries received so far
    pub rtx_received: u32,
}

impl Timer {
    /// Initial buffering deadline for the first observed packet
    pub fn deadline(seqnum: RtpSequenceNumber, base: ClockTime, fire: ClockTime) -> Self {
        Self::new(TimerKind::Deadline, seqnum, 1, base, Some(fire), 0)
    }

    /// Retransmission timer for one missing sequence number
    pub fn expected(
        seqnum: RtpSequenceNumber,
        base: ClockTime,
        fire: Option<ClockTime>,
        duration: ClockTime,
    ) -> Self {
        Self::new(TimerKind::Expected, seqnum, 1, base, fire, duration)
    }

    /// Loss timer covering `count` consecutive sequence numbers
    pub fn lost(
        seqnum: RtpSequenceNumber,
        count: u16,
        base: ClockTime,
        fire: Option<ClockTime>,
        duration: ClockTime,
    ) -> Self {
        Self::new(TimerKind::Lost, seqnum, count, base, fire, duration)
    }

    fn new(
        kind: TimerKind,
        seqnum: RtpSequenceNumber,
        count: u16,
        base: ClockTime,
        fire: Option<ClockTime>,
        duration: ClockTime,
    ) -> Self {
        Self {
            kind,
            seqnum,
            count,
            base,
            fire,
            duration,
            rtx_last: None,
            rtx_retry: 0,
            rtx_received: 0,
        }
    }
}

/// Deadline-ordered timer set, at most one timer per sequence number
#[derive(Debug, Default)]
pub struct TimerQueue {
    by_seq: HashMap<RtpSequenceNumber, Timer>,
    // `None` < `Some(_)`, so immediately-due timers sort first; ties break
    // by ascending seqnum
    order: BTreeSet<(Option<ClockTime>, RtpSequenceNumber)>,
}

impl TimerQueue {
    /// Create an empty timer set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a timer, replacing any existing timer for the same seqnum
    pub fn insert(&mut self, timer: Timer) {
        if let Some(old) = self.by_seq.remove(&timer.seqnum) {
            self.order.remove(&(old.fire, old.seqnum));
        }
        self.order.insert((timer.fire, timer.seqnum));
        self.by_seq.insert(timer.seqnum, timer);
    }

    /// Find the timer for a sequence number
    pub fn find(&self, seqnum: RtpSequenceNumber) -> Option<&Timer> {
        self.by_seq.get(&seqnum)
    }

    /// Mutable access to a timer
    ///
    /// The fire time must not be changed through this; use
    /// [`reschedule`](Self::reschedule) so the ordering stays intact.
    pub fn find_mut(&mut self, seqnum: RtpSequenceNumber) -> Option<&mut Timer> {
        self.by_seq.get_mut(&seqnum)
    }

    /// Move a timer to a new fire time; `None` makes it due immediately
    pub fn reschedule(&mut self, seqnum: RtpSequenceNumber, fire: Option<ClockTime>) -> bool {
        match self.by_seq.get_mut(&seqnum) {
            Some(timer) => {
                self.order.remove(&(timer.fire, seqnum));
                timer.fire = fire;
                self.order.insert((fire, seqnum));
                true
            }
            None => false,
        }
    }

    /// Remove and return the timer for a sequence number
    pub fn remove(&mut self, seqnum: RtpSequenceNumber) -> Option<Timer> {
        let timer = self.by_seq.remove(&seqnum)?;
        self.order.remove(&(timer.fire, seqnum));
        Some(timer)
    }

    /// Look at the earliest timer that is due at `now`
    pub fn peek_due(&self, now: ClockTime) -> Option<&Timer> {
        let (fire, seqnum) = self.order.first()?;
        if fire.map_or(true, |f| f <= now) {
            self.by_seq.get(seqnum)
        } else {
            None
        }
    }

    /// Remove and return the earliest timer that is due at `now`
    pub fn pop_due(&mut self, now: ClockTime) -> Option<Timer> {
        let seqnum = {
            let (fire, seqnum) = self.order.first()?;
            if fire.map_or(false, |f| f > now) {
                return None;
            }
            *seqnum
        };
        self.remove(seqnum)
    }

    /// Drop every timer that is due at `now`
    pub fn remove_due(&mut self, now: ClockTime) {
        while self.pop_due(now).is_some() {}
    }

    /// Earliest pending fire time; inner `None` means due immediately
    pub fn next_fire(&self) -> Option<Option<ClockTime>> {
        self.order.first().map(|(fire, _)| *fire)
    }

    /// Iterate over all pending timers in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &Timer> {
        self.by_seq.values()
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    /// Whether no timers are pending
    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    /// Cancel all pending timers
    pub fn clear(&mut self) {
        self.by_seq.clear();
        self.order.clear();
    }
}
