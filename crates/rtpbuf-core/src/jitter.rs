//! The jitter buffer engine
//!
//! [`JitterBuffer`] owns the whole per-stream state: the timeline mapping,
//! the ordered packet queue, the shared timer set and the retransmission
//! tracker. It is a plain synchronous state machine: [`push`] accepts a
//! packet and (re)arms timers, [`advance`] fires every deadline that is due
//! and returns the resulting output events in deterministic order. Nothing
//! blocks and nothing touches a real clock; see [`crate::session`] for a
//! driver that runs the engine against tokio time.
//!
//! [`push`]: JitterBuffer::push
//! [`advance`]: JitterBuffer::advance

use tracing::{debug, trace, warn};

use crate::buffer::{InsertResult, PacketQueue, QueuedPacket};
use crate::config::JitterBufferConfig;
use crate::packet::{compare_seqnum, Packet};
use crate::rtx::RtxTracker;
use crate::timeline::RtpTimeline;
use crate::timer::{Timer, TimerKind, TimerQueue};
use crate::{ClockTime, Error, Result, RtpSequenceNumber, MILLISECOND};

/// Fallback forward-jump tolerance in packets while spacing is unknown
const FALLBACK_MAX_DROPOUT: i32 = 3000;

/// Fallback backward-jump tolerance in packets while spacing is unknown
const FALLBACK_MAX_MISORDER: i32 = 100;

/// Outcome of pushing one packet into the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// The packet was accepted and is (or will be) part of the output
    Queued,

    /// The packet arrived after release had already moved past it
    Late,

    /// A packet with this sequence number is already queued or was released
    Duplicate,

    /// A retransmission nobody asked for
    Unsolicited,

    /// The packet was so far outside the current sequence domain that the
    /// buffer reset itself to the packet's domain
    Reset,
}

/// A packet released downstream
#[derive(Debug, Clone)]
pub struct ReleasedPacket {
    /// The packet as it arrived
    pub packet: Packet,

    /// Presentation running time (timestamp offset applied)
    pub pts: ClockTime,

    /// Not contiguous with the previously released packet
    pub discont: bool,
}

/// Notification that a span of sequence numbers was declared lost
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostEvent {
    /// First lost sequence number
    pub seqnum: RtpSequenceNumber,

    /// Number of consecutive sequence numbers the event covers
    pub count: u16,

    /// Expected presentation time of the first lost packet
    pub timestamp: ClockTime,

    /// Stream time covered by the lost span (0 when spacing is unknown)
    pub duration: ClockTime,

    /// Retransmission requests that were sent for the first covered seqnum
    pub retry: u32,
}

/// Upstream request to retransmit one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtxRequest {
    /// The missing sequence number
    pub seqnum: RtpSequenceNumber,

    /// Expected running time of the missing packet
    pub running_time: ClockTime,

    /// How late the packet currently is, in milliseconds
    pub delay_ms: u32,

    /// Requests already sent before this one
    pub retry: u32,

    /// Interval at which requests repeat, in milliseconds
    pub frequency_ms: u32,

    /// Total time requests will be sent, in milliseconds
    pub period_ms: u32,

    /// Deadline the answer has to meet, in milliseconds
    pub deadline_ms: u32,

    /// Current packet-spacing estimate in nanoseconds
    pub packet_spacing: ClockTime,

    /// Smoothed retransmission round-trip time, in milliseconds
    pub avg_rtt_ms: u32,
}

/// Everything the engine can emit from a clock advance
#[derive(Debug, Clone)]
pub enum JitterBufferEvent {
    /// An in-order packet for downstream
    Released(ReleasedPacket),

    /// A loss notification for downstream
    Lost(LostEvent),

    /// A retransmission request for upstream
    RtxRequested(RtxRequest),
}

/// Statistics snapshot, consistent as of the last processed event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JitterBufferStats {
    /// Packets released downstream
    pub num_pushed: u64,

    /// Sequence numbers declared lost
    pub num_lost: u64,

    /// Packets that arrived after release had passed them
    pub num_late: u64,

    /// Duplicate deliveries
    pub num_duplicates: u64,

    /// Retransmission requests sent
    pub rtx_count: u64,

    /// Requested packets that arrived as retransmissions in time
    pub rtx_success_count: u64,

    /// Requests without a usable answer
    pub rtx_failed_count: u64,

    /// Average requests per requested packet
    pub rtx_per_packet: f64,

    /// Smoothed retransmission round-trip time in nanoseconds
    pub rtx_rtt: ClockTime,
}

/// RTP jitter buffer with retransmission and loss recovery
///
/// All times are nanoseconds on one running-time axis shared with the
/// caller's clock. `push` never blocks; all output comes out of `advance`.
#[derive(Debug)]
pub struct JitterBuffer {
    config: JitterBufferConfig,

    timeline: RtpTimeline,
    queue: PacketQueue,
    timers: TimerQueue,

    /// Resolved rtx timers kept around to attribute late retransmissions
    rtx_stats_timers: TimerQueue,
    rtx: RtxTracker,

    /// Next sequence number expected to arrive
    next_in_seqnum: Option<RtpSequenceNumber>,

    /// Next sequence number to release; locked in by the initial deadline
    next_out_seqnum: Option<RtpSequenceNumber>,

    /// Sequence number of the most recently released packet
    last_released: Option<RtpSequenceNumber>,

    /// Running time of the latest in-order arrival
    last_in_pts: ClockTime,

    num_pushed: u64,
    num_lost: u64,
    num_late: u64,
    num_duplicates: u64,
}

impl JitterBuffer {
    /// Create a jitter buffer for one stream
    pub fn new(config: JitterBufferConfig) -> Result<Self> {
        if config.clock_rate == 0 {
            return Err(Error::InvalidConfig(
                "clock-rate must be non-zero".to_string(),
            ));
        }

        Ok(Self {
            timeline: RtpTimeline::new(config.clock_rate),
            queue: PacketQueue::new(),
            timers: TimerQueue::new(),
            rtx_stats_timers: TimerQueue::new(),
            rtx: RtxTracker::new(),
            next_in_seqnum: None,
            next_out_seqnum: None,
            last_released: None,
            last_in_pts: 0,
            num_pushed: 0,
            num_lost: 0,
            num_late: 0,
            num_duplicates: 0,
            config,
        })
    }

    /// Accept one packet from the transport
    ///
    /// Non-blocking: the packet is mapped onto the timeline, inserted into
    /// the ordered queue and timers are (re)armed. Call
    /// [`advance`](Self::advance) to collect the resulting output.
    pub fn push(&mut self, packet: Packet) -> PushResult {
        let seqnum = packet.seqnum;
        let rtptime = packet.rtptime;
        let arrival = packet.arrival;
        let is_rtx = packet.is_rtx;

        trace!(seqnum, rtptime, arrival, is_rtx, "push");

        if is_rtx && !self.config.do_retransmission {
            debug!(seqnum, "dropping unsolicited rtx packet");
            return PushResult::Unsolicited;
        }

        if !is_rtx {
            self.timeline.update_jitter(rtptime, arrival);
        }

        if is_rtx {
            let known = self.timers.find(seqnum).is_some()
                || self.rtx_stats_timers.find(seqnum).is_some();
            if !known || self.next_in_seqnum.is_none() {
                debug!(seqnum, "rtx packet without a matching request");
                return PushResult::Unsolicited;
            }
        }

        let mut do_next = false;
        let pts;

        match self.next_in_seqnum {
            None => {
                pts = self.timeline.pts(rtptime, arrival);
                // hold the first packet for the full latency window; an
                // earlier seqnum may still show up
                self.timers
                    .insert(Timer::deadline(seqnum, pts, self.deadline_for(pts)));
                self.timeline.update_spacing(rtptime, pts);
                do_next = true;
                debug!(seqnum, pts, "first packet, deadline armed");
            }
            Some(expected) => {
                let gap = compare_seqnum(expected, seqnum);

                if !is_rtx && gap != 0 {
                    if gap > 0 {
                        if let Some(max_dropout) = self.max_dropout_packets() {
                            if gap >= max_dropout {
                                warn!(
                                    expected,
                                    seqnum, gap, "sequence jumped ahead, resetting to new domain"
                                );
                                self.reset_stream();
                                let _ = self.push(packet);
                                return PushResult::Reset;
                            }
                        }
                    } else if let Some(max_misorder) = self.max_misorder_packets() {
                        if gap < -max_misorder {
                            debug!(expected, seqnum, gap, "packet from a stale domain");
                            self.num_late += 1;
                            return PushResult::Late;
                        }
                    }
                }

                pts = self.timeline.pts(rtptime, arrival);

                if gap == 0 {
                    self.timeline.update_spacing(rtptime, pts);
                    do_next = true;
                } else if gap > 0 {
                    debug!(expected, seqnum, gap, "gap detected");
                    self.handle_missing(expected, seqnum, pts, gap as u16, arrival);
                    do_next = true;
                    self.timeline.break_spacing_run();
                } else {
                    // an out-of-order arrival before its loss timer fires
                    // must not report loss
                    if !is_rtx
                        && self.timers.find(seqnum).map(|t| t.kind) == Some(TimerKind::Lost)
                    {
                        self.timers.remove(seqnum);
                        trace!(seqnum, "cancelled lost timer for late arrival");
                    }
                    self.timeline.break_spacing_run();
                }
            }
        }

        if do_next {
            self.last_in_pts = pts;
            self.next_in_seqnum = Some(seqnum.wrapping_add(1));
        }

        if is_rtx {
            if let Some(t) = self.timers.find_mut(seqnum) {
                t.rtx_received += 1;
            } else if let Some(t) = self.rtx_stats_timers.find_mut(seqnum) {
                t.rtx_received += 1;
            }
        }

        // only packets ahead of the last released one are still playable
        if let Some(last) = self.last_released {
            if compare_seqnum(last, seqnum) <= 0 {
                return self.on_too_late(seqnum, arrival, is_rtx);
            }
        }

        match self.queue.insert(QueuedPacket { packet, pts }) {
            InsertResult::Duplicate => {
                self.num_duplicates += 1;
                if is_rtx {
                    if let Some(timer) = self.resolved_timer(seqnum) {
                        self.rtx.record_response(&timer, arrival, false);
                    }
                }
                trace!(seqnum, "duplicate discarded");
                return PushResult::Duplicate;
            }
            InsertResult::Inserted { head } => {
                trace!(seqnum, pts, head, queued = self.queue.len(), "queued");
            }
        }

        if self.config.do_retransmission {
            self.update_rtx_timers(seqnum, pts, arrival, do_next, is_rtx);
        } else if let Some(timer) = self.timers.find(seqnum) {
            if timer.kind != TimerKind::Deadline {
                self.timers.remove(seqnum);
            }
        }

        PushResult::Queued
    }

    /// Fire every deadline due at `now` and return the output events
    ///
    /// Events come out in one global ascending-deadline order, ties broken
    /// by sequence number, with releasable packets interleaved at the exact
    /// point they become releasable.
    pub fn advance(&mut self, now: ClockTime) -> Vec<JitterBufferEvent> {
        let mut events = Vec::new();

        self.rtx_stats_timers.remove_due(now);
        self.drain(&mut events);

        while let Some(timer) = self.timers.pop_due(now) {
            match timer.kind {
                TimerKind::Deadline => self.on_deadline(timer),
                TimerKind::Expected => self.on_expected(timer, now, &mut events),
                TimerKind::Lost => self.on_lost(timer, now, &mut events),
            }
            self.drain(&mut events);
        }

        events
    }

    /// Earliest pending deadline, if any; 0 means "due immediately"
    pub fn next_wakeup(&self) -> Option<ClockTime> {
        self.timers.next_fire().map(|fire| fire.unwrap_or(0))
    }

    /// Statistics as of the last processed packet or timer
    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            num_pushed: self.num_pushed,
            num_lost: self.num_lost,
            num_late: self.num_late,
            num_duplicates: self.num_duplicates,
            rtx_count: self.rtx.requests(),
            rtx_success_count: self.rtx.successes(),
            rtx_failed_count: self.rtx.failures(),
            rtx_per_packet: self.rtx.avg_per_packet(),
            rtx_rtt: self.rtx.rtt(),
        }
    }

    /// Current configuration
    pub fn config(&self) -> &JitterBufferConfig {
        &self.config
    }

    /// Number of packets currently buffered
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    /// Shift all deadlines and outgoing timestamps
    ///
    /// Pending deadlines are rescheduled; already-fired ones are history.
    pub fn set_ts_offset(&mut self, offset: i64) {
        if self.config.ts_offset == offset {
            return;
        }
        debug!(offset, "timestamp offset changed");
        self.config.ts_offset = offset;
        self.reschedule_deadlines();
    }

    /// Change the latency window, rescheduling pending deadlines
    pub fn set_latency_ms(&mut self, latency_ms: u32) {
        if self.config.latency_ms == latency_ms {
            return;
        }
        debug!(latency_ms, "latency changed");
        self.config.latency_ms = latency_ms;
        self.reschedule_deadlines();
    }

    /// Drop all buffered state and zero the statistics
    pub fn flush(&mut self) {
        debug!("flush");
        self.reset_stream();
        self.num_pushed = 0;
        self.num_lost = 0;
        self.num_late = 0;
        self.num_duplicates = 0;
        self.rtx.reset();
    }

    // Clear per-stream state, keeping statistics (used by flush and by the
    // big-gap domain switch).
    fn reset_stream(&mut self) {
        self.queue.clear();
        self.timers.clear();
        self.rtx_stats_timers.clear();
        self.timeline.reset();
        self.next_in_seqnum = None;
        self.next_out_seqnum = None;
        self.last_released = None;
        self.last_in_pts = 0;
    }

    // Release every queued packet that is at or behind the release pointer.
    fn drain(&mut self, events: &mut Vec<JitterBufferEvent>) {
        let Some(mut next_out) = self.next_out_seqnum else {
            return;
        };

        while let Some(head) = self.queue.peek() {
            let d = compare_seqnum(next_out, head.packet.seqnum);
            if d > 0 {
                break;
            }

            let queued = self.queue.pop().expect("peeked entry exists");
            let seqnum = queued.packet.seqnum;
            let discont = self
                .last_released
                .map_or(true, |last| last.wrapping_add(1) != seqnum);

            self.last_released = Some(seqnum);
            if d == 0 {
                next_out = seqnum.wrapping_add(1);
            }
            self.num_pushed += 1;

            trace!(seqnum, discont, "released");
            events.push(JitterBufferEvent::Released(ReleasedPacket {
                pts: self.apply_ts_offset(queued.pts),
                packet: queued.packet,
                discont,
            }));
        }

        self.next_out_seqnum = Some(next_out);
    }

    fn on_deadline(&mut self, timer: Timer) {
        debug!(seqnum = timer.seqnum, "initial deadline reached");
        if self.next_out_seqnum.is_none() {
            self.next_out_seqnum = Some(timer.seqnum);
        }
    }

    fn on_lost(&mut self, mut timer: Timer, now: ClockTime, events: &mut Vec<JitterBufferEvent>) {
        let mut abandoned_retries = timer.rtx_retry;

        // adjacent per-seqnum timers expiring in the same advance collapse
        // into one span; spans without a known duration stay separate so the
        // notification still identifies each slot
        if timer.count == 1 && timer.duration > 0 {
            while let Some(next) = self.timers.peek_due(now) {
                if next.kind != TimerKind::Lost
                    || next.count != 1
                    || next.duration == 0
                    || next.seqnum != timer.seqnum.wrapping_add(timer.count)
                {
                    break;
                }
                let merged = self.timers.pop_due(now).expect("peeked timer exists");
                timer.count += 1;
                timer.duration += merged.duration;
                abandoned_retries += merged.rtx_retry;
            }
        }

        self.num_lost += timer.count as u64;
        self.rtx.record_abandoned(abandoned_retries);

        let end = timer.seqnum.wrapping_add(timer.count);

        // only accept newer sequence numbers from here on
        match self.next_in_seqnum {
            Some(next_in) if compare_seqnum(next_in, end) <= 0 => {}
            _ => {
                self.next_in_seqnum = Some(end);
                self.last_in_pts = timer.base;
            }
        }
        match self.next_out_seqnum {
            Some(next_out) if compare_seqnum(next_out, end) <= 0 => {}
            _ => self.next_out_seqnum = Some(end),
        }

        debug!(
            seqnum = timer.seqnum,
            count = timer.count,
            timestamp = timer.base,
            duration = timer.duration,
            "declared lost"
        );

        // a late retransmission may still arrive; keep the request
        // bookkeeping for the statistics
        if timer.rtx_last.is_some() {
            let mut stats = timer.clone();
            stats.fire = Some(now + self.config.rtx_stats_timeout_ms as ClockTime * MILLISECOND);
            self.rtx_stats_timers.insert(stats);
        }

        if self.config.do_lost {
            events.push(JitterBufferEvent::Lost(LostEvent {
                seqnum: timer.seqnum,
                count: timer.count,
                timestamp: self.apply_ts_offset(timer.base),
                duration: timer.duration,
                retry: timer.rtx_retry,
            }));
        }
    }

    fn on_expected(
        &mut self,
        mut timer: Timer,
        now: ClockTime,
        events: &mut Vec<JitterBufferEvent>,
    ) {
        let spacing = self.timeline.packet_spacing();
        let jitter = self.timeline.avg_jitter();
        let retry_timeout = self.rtx.retry_timeout(&self.config, spacing, jitter);
        let retry_period = self.rtx.retry_period(&self.config, retry_timeout);

        events.push(JitterBufferEvent::RtxRequested(RtxRequest {
            seqnum: timer.seqnum,
            running_time: timer.base,
            delay_ms: (now.saturating_sub(timer.base) / MILLISECOND) as u32,
            retry: timer.rtx_retry,
            frequency_ms: (retry_timeout / MILLISECOND) as u32,
            period_ms: (retry_period / MILLISECOND) as u32,
            deadline_ms: self.config.rtx_deadline_ms.unwrap_or(self.config.latency_ms),
            packet_spacing: spacing,
            avg_rtt_ms: (self.rtx.rtt() / MILLISECOND) as u32,
        }));

        self.rtx.record_request();
        timer.rtx_retry += 1;
        timer.rtx_last = Some(now);

        let timeout = now + retry_timeout;
        let max_reached = self
            .config
            .rtx_max_retries
            .map_or(false, |max| timer.rtx_retry >= max);

        if max_reached || timeout > timer.base + retry_period {
            // give up requesting; the seqnum goes back to loss tracking
            debug!(
                seqnum = timer.seqnum,
                retries = timer.rtx_retry,
                "retry ceiling reached"
            );
            timer.kind = TimerKind::Lost;
            timer.fire = Some(self.deadline_for(timer.base));
        } else {
            trace!(
                seqnum = timer.seqnum,
                retry = timer.rtx_retry,
                timeout,
                "rtx retry scheduled"
            );
            timer.fire = Some(timeout);
        }
        self.timers.insert(timer);
    }

    // A packet arrived behind the release pointer.
    fn on_too_late(
        &mut self,
        seqnum: RtpSequenceNumber,
        arrival: ClockTime,
        is_rtx: bool,
    ) -> PushResult {
        if is_rtx {
            if let Some(timer) = self.resolved_timer(seqnum) {
                self.rtx.record_response(&timer, arrival, false);
                // only count it late if it had actually been declared lost;
                // otherwise the original simply won the race
                if timer.kind != TimerKind::Lost {
                    self.num_duplicates += 1;
                    return PushResult::Duplicate;
                }
            }
        }
        debug!(seqnum, "packet arrived too late");
        self.num_late += 1;
        PushResult::Late
    }

    fn resolved_timer(&self, seqnum: RtpSequenceNumber) -> Option<Timer> {
        self.timers
            .find(seqnum)
            .cloned()
            .or_else(|| self.rtx_stats_timers.find(seqnum).cloned())
    }

    // A gap [expected, current) was revealed by the arrival of `current`.
    // Declare the hopeless prefix lost right away and give every remaining
    // missing seqnum its own timer.
    fn handle_missing(
        &mut self,
        expected: RtpSequenceNumber,
        current: RtpSequenceNumber,
        pts: ClockTime,
        gap: u16,
        now: ClockTime,
    ) {
        let equidistant = self.timeline.is_equidistant();
        let spacing = self.timeline.packet_spacing();
        let offset = self.timeout_offset();
        let rtx_delay =
            self.rtx
                .request_delay(&self.config, spacing, self.timeline.avg_jitter());

        let mut missing = expected;
        let mut est_pts;
        let est_dur;

        if equidistant {
            let total = pts.saturating_sub(self.last_in_pts);
            let mut dur = total / (gap as ClockTime + 1);
            if total > 0 && spacing > 0 {
                dur = spacing;
            }
            est_dur = dur;
            est_pts = self.last_in_pts + est_dur;

            let too_late = (now as i64) > est_pts as i64 + offset;
            if too_late {
                // declare everything that can no longer be saved lost in one
                // span, due on the next advance
                let gap_time = pts.saturating_sub(est_pts);
                let max_saveable = if est_dur > 0 && offset > 0 {
                    offset as u64 / est_dur
                } else {
                    0
                };
                let lost = (gap as i64 - max_saveable as i64).max(1) as u64;
                let saveable = gap as u64 - lost;
                let saveable_dur = (saveable * est_dur).min(gap_time);
                let lost_dur = gap_time - saveable_dur;

                debug!(
                    first = missing,
                    count = lost,
                    duration = lost_dur,
                    "gap prefix is beyond saving"
                );
                self.timers
                    .insert(Timer::lost(missing, lost as u16, est_pts, None, lost_dur));

                missing = missing.wrapping_add(lost as u16);
                est_pts += lost_dur;
            }
        } else {
            // without equidistant spacing all we know is that the missing
            // packets were due no later than the packet that revealed them
            est_dur = 0;
            est_pts = pts;
        }

        let remaining = compare_seqnum(missing, current);
        if remaining <= 0 {
            return;
        }

        let remaining = remaining as u64;
        let remaining_dur = pts.saturating_sub(est_pts);
        // keep durations in whole packets; the first slot absorbs the rest
        let remainder = remaining_dur.saturating_sub(est_dur * remaining);

        for i in 0..remaining {
            let mut duration = est_dur;
            if i == 0 {
                duration += remainder;
            }
            duration = duration.min(pts.saturating_sub(est_pts));

            if self.config.do_retransmission {
                match self.timers.find(missing).map(|t| (t.kind, t.fire, t.rtx_retry)) {
                    Some((TimerKind::Expected, fire, retry)) => {
                        if let Some(t) = self.timers.find_mut(missing) {
                            t.duration = duration;
                        }
                        // a pre-armed timer may sit too far in the future now
                        // that we know the packet is really missing
                        if retry == 0 && fire.map_or(false, |f| f > est_pts + rtx_delay) {
                            if let Some(t) = self.timers.find_mut(missing) {
                                t.base = est_pts;
                            }
                            self.timers.reschedule(missing, Some(est_pts + rtx_delay));
                        }
                    }
                    Some(_) => {}
                    None => {
                        self.timers.insert(Timer::expected(
                            missing,
                            est_pts,
                            Some(est_pts + rtx_delay),
                            duration,
                        ));
                    }
                }
            } else {
                self.timers.insert(Timer::lost(
                    missing,
                    1,
                    est_pts,
                    Some(add_offset(est_pts, offset)),
                    duration,
                ));
            }

            missing = missing.wrapping_add(1);
            est_pts += duration;
        }
    }

    fn update_rtx_timers(
        &mut self,
        seqnum: RtpSequenceNumber,
        pts: ClockTime,
        arrival: ClockTime,
        do_next: bool,
        is_rtx: bool,
    ) {
        // a pending request overtaken by newer arrivals is clearly not plain
        // reordering; make it due right away
        if self.config.rtx_delay_reorder > 0 {
            let reorder = self.config.rtx_delay_reorder as i32;
            let overtaken: Vec<RtpSequenceNumber> = self
                .timers
                .iter()
                .filter(|t| {
                    t.kind == TimerKind::Expected
                        && t.rtx_retry == 0
                        && compare_seqnum(t.seqnum, seqnum) > reorder
                })
                .map(|t| t.seqnum)
                .collect();
            for s in overtaken {
                trace!(seqnum = s, "expected timer overtaken by reordering");
                self.timers.reschedule(s, None);
            }
        }

        let mut do_next =
            do_next && self.timeline.packet_spacing() > 0 && self.config.rtx_next_seqnum;

        // the arrival resolves this seqnum's own timer
        let resolved = match self.timers.find(seqnum).map(|t| t.kind) {
            Some(TimerKind::Deadline) | None => None,
            Some(_) => self.timers.remove(seqnum),
        };
        let from_stats = resolved.is_none();
        let resolved = resolved.or_else(|| self.rtx_stats_timers.find(seqnum).cloned());

        if let Some(timer) = &resolved {
            if timer.rtx_retry > 0 {
                if is_rtx {
                    self.rtx.record_response(timer, arrival, true);
                    // a retransmitted delivery says nothing about the
                    // arrival cadence of the next original packet
                    do_next = false;
                }
                if !from_stats && (!is_rtx || timer.rtx_retry > 1) {
                    // more (duplicate) retransmissions may still arrive;
                    // keep the request bookkeeping around for them
                    let mut stats = timer.clone();
                    stats.fire =
                        Some(pts + self.config.rtx_stats_timeout_ms as ClockTime * MILLISECOND);
                    self.rtx_stats_timers.insert(stats);
                }
            }
        }

        if do_next {
            let next = self
                .next_in_seqnum
                .expect("in-order arrival sets next_in_seqnum");
            let spacing = self.timeline.packet_spacing();
            let delay =
                self.rtx
                    .request_delay(&self.config, spacing, self.timeline.avg_jitter());
            let base = pts + spacing;

            match self.timers.find(next).map(|t| (t.kind, t.rtx_retry)) {
                Some((TimerKind::Expected, retry)) if retry > 0 => {}
                _ => {
                    trace!(seqnum = next, base, "pre-armed rtx timer for next seqnum");
                    self.timers
                        .insert(Timer::expected(next, base, Some(base + delay), spacing));
                }
            }
        }
    }

    // Forward jump tolerance in packets; None disables the check.
    fn max_dropout_packets(&self) -> Option<i32> {
        if self.config.max_dropout_time_ms == 0 {
            return None;
        }
        Some(self.gap_packets(self.config.max_dropout_time_ms, FALLBACK_MAX_DROPOUT))
    }

    // Backward jump tolerance in packets; None disables the check.
    fn max_misorder_packets(&self) -> Option<i32> {
        if self.config.max_misorder_time_ms == 0 {
            return None;
        }
        Some(self.gap_packets(self.config.max_misorder_time_ms, FALLBACK_MAX_MISORDER))
    }

    fn gap_packets(&self, time_ms: u32, fallback: i32) -> i32 {
        let spacing = self.timeline.packet_spacing();
        if spacing == 0 {
            return fallback;
        }
        let packets = (time_ms as u64 * MILLISECOND) / spacing;
        packets.clamp(100, i16::MAX as u64) as i32
    }

    // Fire time for a slot: its expected running time plus the latency
    // window and the timestamp offset.
    fn deadline_for(&self, base: ClockTime) -> ClockTime {
        add_offset(base, self.timeout_offset())
    }

    fn timeout_offset(&self) -> i64 {
        self.config.ts_offset + self.config.latency_ms as i64 * MILLISECOND as i64
    }

    fn apply_ts_offset(&self, t: ClockTime) -> ClockTime {
        add_offset(t, self.config.ts_offset)
    }

    // Recompute pending deadline and lost timers after a configuration
    // change; immediately-due timers stay due.
    fn reschedule_deadlines(&mut self) {
        let pending: Vec<(RtpSequenceNumber, ClockTime)> = self
            .timers
            .iter()
            .filter(|t| {
                (t.kind == TimerKind::Deadline || t.kind == TimerKind::Lost) && t.fire.is_some()
            })
            .map(|t| (t.seqnum, t.base))
            .collect();
        for (seqnum, base) in pending {
            let fire = self.deadline_for(base);
            self.timers.reschedule(seqnum, Some(fire));
        }
    }
}

fn add_offset(t: ClockTime, offset: i64) -> ClockTime {
    (t as i64).saturating_add(offset).max(0) as ClockTime
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::SECOND;

    const LATENCY_MS: u32 = 100;
    const FRAME_MS: ClockTime = 20;
    const FRAME_NS: ClockTime = FRAME_MS * MILLISECOND;
    const FRAME_RTP: u32 = 160;

    fn make_buffer(config: JitterBufferConfig) -> JitterBuffer {
        JitterBuffer::new(config).expect("valid config")
    }

    fn default_buffer() -> JitterBuffer {
        make_buffer(JitterBufferConfig {
            latency_ms: LATENCY_MS,
            do_lost: true,
            ..Default::default()
        })
    }

    fn test_packet(seqnum: u16) -> Packet {
        Packet::new(
            seqnum,
            (seqnum as u32).wrapping_mul(FRAME_RTP),
            seqnum as ClockTime * FRAME_NS,
            Bytes::from_static(b"test"),
        )
    }

    fn packet_at(seqnum: u16, rtptime: u32, arrival: ClockTime) -> Packet {
        Packet::new(seqnum, rtptime, arrival, Bytes::from_static(b"test"))
    }

    fn released_seqnums(events: &[JitterBufferEvent]) -> Vec<u16> {
        events
            .iter()
            .filter_map(|e| match e {
                JitterBufferEvent::Released(r) => Some(r.packet.seqnum),
                _ => None,
            })
            .collect()
    }

    fn lost_events(events: &[JitterBufferEvent]) -> Vec<LostEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                JitterBufferEvent::Lost(l) => Some(l.clone()),
                _ => None,
            })
            .collect()
    }

    /// Push packets 0..n at their nominal times and release them by
    /// advancing to the latency deadline. Returns the next expected seqnum.
    fn warmed_up(jb: &mut JitterBuffer, latency_ms: u32) -> u16 {
        let next = (latency_ms as u64 / FRAME_MS + 1) as u16;
        for seqnum in 0..next {
            assert_eq!(jb.push(test_packet(seqnum)), PushResult::Queued);
        }
        let events = jb.advance(latency_ms as ClockTime * MILLISECOND);
        let released = released_seqnums(&events);
        assert_eq!(released, (0..next).collect::<Vec<_>>());
        next
    }

    #[test]
    fn test_rejects_zero_clock_rate() {
        let config = JitterBufferConfig {
            clock_rate: 0,
            ..Default::default()
        };
        assert!(JitterBuffer::new(config).is_err());
    }

    #[test]
    fn test_first_packet_released_at_latency() {
        let mut jb = default_buffer();
        jb.push(test_packet(0));

        assert!(jb.advance(99 * MILLISECOND).is_empty(), "deadline not due");
        assert_eq!(jb.next_wakeup(), Some(100 * MILLISECOND));

        let events = jb.advance(100 * MILLISECOND);
        assert_eq!(released_seqnums(&events), vec![0]);
        match &events[0] {
            JitterBufferEvent::Released(r) => {
                assert_eq!(r.pts, 0);
                assert!(r.discont, "stream start is discontinuous");
            }
            other => panic!("expected release, got {:?}", other),
        }
    }

    #[test]
    fn test_in_order_released_in_order() {
        let mut jb = default_buffer();
        let next = warmed_up(&mut jb, LATENCY_MS);

        // once the window is established packets flow through
        jb.push(test_packet(next));
        let events = jb.advance(next as ClockTime * FRAME_NS);
        assert_eq!(released_seqnums(&events), vec![next]);
        assert_eq!(jb.stats().num_pushed, next as u64 + 1);
    }

    #[test]
    fn test_reordered_released_in_order() {
        let mut jb = default_buffer();
        jb.push(test_packet(0));
        jb.push(test_packet(2));
        jb.push(test_packet(1));
        jb.push(test_packet(3));

        let events = jb.advance(SECOND);
        assert_eq!(released_seqnums(&events), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_duplicate_discarded() {
        let mut jb = default_buffer();
        jb.push(test_packet(0));
        assert_eq!(jb.push(test_packet(0)), PushResult::Duplicate);
        assert_eq!(jb.stats().num_duplicates, 1);

        let events = jb.advance(SECOND);
        assert_eq!(released_seqnums(&events), vec![0]);
    }

    #[test]
    fn test_lost_event_for_single_gap() {
        let mut jb = default_buffer();
        let next = warmed_up(&mut jb, LATENCY_MS);

        // skip one seqnum
        let missing = next;
        let arrived = next + 1;
        jb.push(test_packet(arrived));

        // nothing may come out before the missing packet's deadline
        let events = jb.advance(arrived as ClockTime * FRAME_NS);
        assert!(events.is_empty());

        let deadline = missing as ClockTime * FRAME_NS + LATENCY_MS as ClockTime * MILLISECOND;
        assert_eq!(jb.next_wakeup(), Some(deadline));

        let events = jb.advance(deadline);
        let lost = lost_events(&events);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].seqnum, missing);
        assert_eq!(lost[0].timestamp, missing as ClockTime * FRAME_NS);
        assert_eq!(lost[0].duration, FRAME_NS);
        assert_eq!(released_seqnums(&events), vec![arrived]);
        assert_eq!(jb.stats().num_lost, 1);
    }

    #[test]
    fn test_lost_packet_count_without_do_lost() {
        let mut jb = make_buffer(JitterBufferConfig {
            latency_ms: LATENCY_MS,
            do_lost: false,
            ..Default::default()
        });
        let next = warmed_up(&mut jb, LATENCY_MS);

        jb.push(test_packet(next + 1));
        let events = jb.advance(SECOND);
        // no notification, but the packet still counts as lost and the
        // stream continues
        assert!(lost_events(&events).is_empty());
        assert_eq!(released_seqnums(&events), vec![next + 1]);
        assert_eq!(jb.stats().num_lost, 1);
    }

    #[test]
    fn test_released_after_loss_is_discont() {
        let mut jb = default_buffer();
        let next = warmed_up(&mut jb, LATENCY_MS);

        jb.push(test_packet(next + 1));
        let events = jb.advance(SECOND);
        match events.last().unwrap() {
            JitterBufferEvent::Released(r) => {
                assert_eq!(r.packet.seqnum, next + 1);
                assert!(r.discont);
            }
            other => panic!("expected release, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_order_arrival_cancels_loss() {
        let mut jb = default_buffer();
        let next = warmed_up(&mut jb, LATENCY_MS);

        let late = next + 1;
        jb.push(test_packet(next));
        jb.push(test_packet(next + 2));

        // the straggler arrives before its deadline
        jb.push(test_packet(late));

        let events = jb.advance(late as ClockTime * FRAME_NS + LATENCY_MS as ClockTime * MILLISECOND);
        assert!(lost_events(&events).is_empty(), "no loss may be reported");
        assert_eq!(released_seqnums(&events), vec![next, late, next + 2]);
        assert_eq!(jb.stats().num_lost, 0);
    }

    #[test]
    fn test_two_lost_one_arrives_in_time() {
        let mut jb = default_buffer();
        let next = warmed_up(&mut jb, LATENCY_MS);

        let first_missing = next;
        let second_missing = next + 1;
        let arrived = next + 2;
        jb.push(test_packet(arrived));

        // the first missing packet expires
        let deadline = first_missing as ClockTime * FRAME_NS + LATENCY_MS as ClockTime * MILLISECOND;
        assert_eq!(jb.next_wakeup(), Some(deadline));
        let events = jb.advance(deadline);
        let lost = lost_events(&events);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].seqnum, first_missing);
        assert!(released_seqnums(&events).is_empty());

        // the second missing packet arrives just in time
        assert_eq!(jb.push(test_packet(second_missing)), PushResult::Queued);
        let events = jb.advance(deadline);
        let released = released_seqnums(&events);
        assert_eq!(released, vec![second_missing, arrived]);
        match &events[0] {
            JitterBufferEvent::Released(r) => assert!(r.discont),
            other => panic!("expected release, got {:?}", other),
        }
        match &events[1] {
            JitterBufferEvent::Released(r) => assert!(!r.discont),
            other => panic!("expected release, got {:?}", other),
        }
        assert_eq!(jb.stats().num_lost, 1);
    }

    #[test]
    fn test_late_arrival_after_lost_still_released() {
        let mut jb = default_buffer();
        let next = warmed_up(&mut jb, LATENCY_MS);

        // a two-packet gap; only the first deadline expires
        jb.push(test_packet(next + 2));
        let deadline = next as ClockTime * FRAME_NS + LATENCY_MS as ClockTime * MILLISECOND;
        let events = jb.advance(deadline);
        assert_eq!(lost_events(&events).len(), 1);
        assert!(released_seqnums(&events).is_empty());

        // the declared-lost packet shows up anyway, before release moved
        // past its slot: it still plays out, and loss stats stay put
        let mut late = test_packet(next);
        late.arrival = deadline;
        assert_eq!(jb.push(late), PushResult::Queued);
        let events = jb.advance(deadline);
        assert_eq!(released_seqnums(&events), vec![next]);
        assert_eq!(jb.stats().num_lost, 1);
        assert_eq!(jb.stats().num_late, 0);
    }

    #[test]
    fn test_late_after_release_counts_late() {
        let mut jb = default_buffer();
        let next = warmed_up(&mut jb, LATENCY_MS);

        jb.push(test_packet(next + 1));
        let events = jb.advance(SECOND);
        assert_eq!(released_seqnums(&events), vec![next + 1]);

        // release moved past the missing seqnum: the straggler is dropped
        let mut late = test_packet(next);
        late.arrival = SECOND;
        assert_eq!(jb.push(late), PushResult::Late);
        assert_eq!(jb.stats().num_late, 1);
        assert!(jb.advance(SECOND + SECOND).is_empty());
    }

    #[test]
    fn test_big_gap_resets_domain() {
        let mut jb = default_buffer();
        let next = warmed_up(&mut jb, LATENCY_MS);

        // spacing is 20ms, dropout tolerance 60s: 3000 packets
        let far = next.wrapping_add(20_000);
        let mut packet = test_packet(far);
        packet.arrival = SECOND;
        packet.rtptime = 0;
        assert_eq!(jb.push(packet), PushResult::Reset);

        // no loss is declared for the abandoned range; the new domain plays
        // from its own deadline
        let events = jb.advance(SECOND + LATENCY_MS as ClockTime * MILLISECOND);
        assert!(lost_events(&events).is_empty());
        assert_eq!(released_seqnums(&events), vec![far]);
        match &events[0] {
            JitterBufferEvent::Released(r) => assert!(r.discont),
            other => panic!("expected release, got {:?}", other),
        }
        assert_eq!(jb.stats().num_lost, 0);
    }

    #[test]
    fn test_stale_domain_packet_dropped() {
        let mut jb = default_buffer();
        let next = warmed_up(&mut jb, LATENCY_MS);

        // far behind the current domain (misorder tolerance is 100 packets
        // at 20ms spacing)
        let stale = next.wrapping_sub(5000);
        let mut packet = test_packet(stale);
        packet.arrival = next as ClockTime * FRAME_NS;
        assert_eq!(jb.push(packet), PushResult::Late);
        assert_eq!(jb.stats().num_late, 1);
    }

    #[test]
    fn test_ts_offset_shifts_deadline_and_pts() {
        let mut jb = default_buffer();
        jb.push(test_packet(0));
        jb.set_ts_offset(50 * MILLISECOND as i64);

        assert_eq!(jb.next_wakeup(), Some(150 * MILLISECOND));
        assert!(jb.advance(100 * MILLISECOND).is_empty());

        let events = jb.advance(150 * MILLISECOND);
        match &events[0] {
            JitterBufferEvent::Released(r) => assert_eq!(r.pts, 50 * MILLISECOND),
            other => panic!("expected release, got {:?}", other),
        }
    }

    #[test]
    fn test_latency_change_reschedules() {
        let mut jb = default_buffer();
        jb.push(test_packet(0));
        assert_eq!(jb.next_wakeup(), Some(100 * MILLISECOND));

        jb.set_latency_ms(40);
        assert_eq!(jb.next_wakeup(), Some(40 * MILLISECOND));
    }

    #[test]
    fn test_flush_clears_state_and_stats() {
        let mut jb = default_buffer();
        let next = warmed_up(&mut jb, LATENCY_MS);
        jb.push(test_packet(next + 1));
        jb.advance(SECOND);
        assert!(jb.stats().num_pushed > 0);

        jb.flush();
        assert_eq!(jb.stats(), JitterBufferStats::default());
        assert_eq!(jb.buffered(), 0);
        assert_eq!(jb.next_wakeup(), None);

        // a fresh stream starts over with its own deadline
        let mut packet = test_packet(40_000);
        packet.arrival = 2 * SECOND;
        assert_eq!(jb.push(packet), PushResult::Queued);
        assert_eq!(
            jb.next_wakeup(),
            Some(2 * SECOND + LATENCY_MS as ClockTime * MILLISECOND)
        );
    }

    #[test]
    fn test_all_packets_timestamped_zero() {
        let mut jb = default_buffer();

        for seqnum in 0..3 {
            jb.push(packet_at(seqnum, 0, 0));
        }
        let events = jb.advance(LATENCY_MS as ClockTime * MILLISECOND);
        assert_eq!(released_seqnums(&events), vec![0, 1, 2]);

        // a gap in a spacing-less stream: zero-duration losses, reported
        // per seqnum
        jb.push(packet_at(5, 0, 0));
        let events = jb.advance(LATENCY_MS as ClockTime * MILLISECOND);
        let lost = lost_events(&events);
        assert_eq!(lost.len(), 2);
        assert_eq!((lost[0].seqnum, lost[0].timestamp, lost[0].duration), (3, 0, 0));
        assert_eq!((lost[1].seqnum, lost[1].timestamp, lost[1].duration), (4, 0, 0));
        assert_eq!(released_seqnums(&events), vec![5]);
    }

    #[test]
    fn test_adjacent_losses_coalesce_in_one_advance() {
        let mut jb = default_buffer();
        let next = warmed_up(&mut jb, LATENCY_MS);

        // gap of two, then advance past both deadlines at once
        jb.push(test_packet(next + 2));
        let events = jb.advance(SECOND);
        let lost = lost_events(&events);
        assert_eq!(lost.len(), 1, "one event covers the whole span");
        assert_eq!(lost[0].seqnum, next);
        assert_eq!(lost[0].count, 2);
        assert_eq!(lost[0].timestamp, next as ClockTime * FRAME_NS);
        assert_eq!(lost[0].duration, 2 * FRAME_NS);
        assert_eq!(jb.stats().num_lost, 2);
    }

    #[test]
    fn test_seqnum_wraparound_stream() {
        let mut jb = default_buffer();

        let start = 65530u16;
        for i in 0..10u16 {
            let seqnum = start.wrapping_add(i);
            let packet = packet_at(
                seqnum,
                i as u32 * FRAME_RTP,
                i as ClockTime * FRAME_NS,
            );
            assert_eq!(jb.push(packet), PushResult::Queued, "seqnum {}", seqnum);
        }

        let events = jb.advance(SECOND);
        let released = released_seqnums(&events);
        let expected: Vec<u16> = (0..10u16).map(|i| start.wrapping_add(i)).collect();
        assert_eq!(released, expected);
    }

    #[test]
    fn test_backwards_rtptime_gap_gets_zero_duration() {
        let mut jb = make_buffer(JitterBufferConfig {
            latency_ms: 40,
            do_lost: true,
            ..Default::default()
        });
        let next = warmed_up(&mut jb, 40);
        assert_eq!(next, 3);

        // seqnum 3 at its nominal spot
        jb.push(test_packet(3));
        // seqnum 4 arrives late, with a larger rtptime
        jb.push(packet_at(4, 5 * FRAME_RTP, 5 * FRAME_NS));
        // seqnum 6 arrives with rtptime *behind* seqnum 4 (B-frame pattern),
        // leaving seqnum 5 missing
        jb.push(packet_at(6, 4 * FRAME_RTP, 5 * FRAME_NS));
        jb.push(packet_at(7, 6 * FRAME_RTP, 6 * FRAME_NS));

        let events = jb.advance(SECOND);
        let lost = lost_events(&events);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].seqnum, 5);
        // the optimistic estimate: same pts as the packet before it, no
        // duration
        assert_eq!(lost[0].timestamp, 5 * FRAME_NS);
        assert_eq!(lost[0].duration, 0);
    }
}
