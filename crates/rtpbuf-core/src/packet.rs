//! Arrived-packet representation and sequence number arithmetic
//!
//! Sequence numbers are 16 bits and wrap; all comparisons in this crate go
//! through [`compare_seqnum`], which interprets the difference as the signed
//! minimal forward distance.

use bytes::Bytes;

use crate::{ClockTime, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// One packet as handed to the jitter buffer by the transport
#[derive(Debug, Clone)]
pub struct Packet {
    /// RTP sequence number
    pub seqnum: RtpSequenceNumber,

    /// RTP timestamp in clock-rate units
    pub rtptime: RtpTimestamp,

    /// Synchronization source of the stream
    pub ssrc: RtpSsrc,

    /// Running time at which the transport received the packet
    pub arrival: ClockTime,

    /// Payload bytes
    pub payload: Bytes,

    /// RTP marker bit
    pub marker: bool,

    /// The transport flagged this delivery as discontinuous
    pub discont: bool,

    /// The transport flagged this delivery as a retransmission
    pub is_rtx: bool,
}

impl Packet {
    /// Create a packet with the given sequence number, RTP timestamp and
    /// arrival time
    pub fn new(
        seqnum: RtpSequenceNumber,
        rtptime: RtpTimestamp,
        arrival: ClockTime,
        payload: Bytes,
    ) -> Self {
        Self {
            seqnum,
            rtptime,
            ssrc: 0,
            arrival,
            payload,
            marker: false,
            discont: false,
            is_rtx: false,
        }
    }

    /// Mark this packet as a retransmitted delivery
    pub fn with_rtx(mut self) -> Self {
        self.is_rtx = true;
        self
    }
}

/// Compare two sequence numbers with wraparound
///
/// Returns the signed forward distance from `s1` to `s2`: positive when `s2`
/// is ahead of `s1`, negative when it is behind, 0 when equal. The result is
/// in `-32768..=32767`.
pub fn compare_seqnum(s1: RtpSequenceNumber, s2: RtpSequenceNumber) -> i32 {
    s2.wrapping_sub(s1) as i16 as i32
}

/// Unwrap a wrapping counter into a monotonic 64-bit value
///
/// Each call interprets the new value as the representative closest to the
/// previously returned one, so reordered input stays nearby instead of
/// jumping a full period.
#[derive(Debug, Clone)]
pub struct Unwrapper {
    last: Option<u64>,
    bits: u32,
}

impl Unwrapper {
    /// Unwrapper for a counter of the given bit width (16 for seqnums, 32
    /// for RTP timestamps)
    pub fn new(bits: u32) -> Self {
        Self { last: None, bits }
    }

    /// Extend `value` relative to the previously seen value
    pub fn unwrap(&mut self, value: u64) -> u64 {
        let period = 1u64 << self.bits;
        let half = period >> 1;

        let ext = match self.last {
            None => value + period,
            Some(last) => {
                let base = last & !(period - 1);
                let candidate = base + value;
                let prev_low = last & (period - 1);
                if value >= prev_low {
                    if value - prev_low > half {
                        candidate.saturating_sub(period)
                    } else {
                        candidate
                    }
                } else if prev_low - value > half {
                    candidate + period
                } else {
                    candidate
                }
            }
        };

        self.last = Some(ext);
        ext
    }

    /// Forget all state
    pub fn reset(&mut self) {
        self.last = None;
    }
}
