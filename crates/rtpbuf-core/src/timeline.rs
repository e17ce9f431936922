//! RTP timestamp to running-time mapping
//!
//! The first packet anchors the stream: its arrival time becomes the base of
//! the running-time axis, and every later packet is placed relative to it by
//! its (wrap-unwrapped) RTP timestamp delta. On top of the mapping this
//! module keeps the two adaptive estimates the rest of the engine depends
//! on: the inter-packet spacing and the arrival jitter.

use tracing::{debug, trace};

use crate::packet::Unwrapper;
use crate::{ClockTime, RtpTimestamp, SECOND};

/// Saturation bounds for the equidistant-spacing heuristic
const EQUIDISTANT_MIN: i32 = -7;
const EQUIDISTANT_MAX: i32 = 7;

/// Maps RTP timestamps onto the running-time axis and tracks packet spacing
/// and jitter
#[derive(Debug, Clone)]
pub struct RtpTimeline {
    /// RTP clock rate in Hz
    clock_rate: u32,

    /// Unwrap state for the 32-bit RTP timestamp
    unwrapper: Unwrapper,

    /// Running time assigned to the reference timestamp
    base_pts: Option<ClockTime>,

    /// Extended RTP timestamp of the reference packet
    base_ext_rtptime: Option<u64>,

    /// Arrival time of the previous packet, for the jitter estimate
    last_arrival: Option<ClockTime>,

    /// RTP timestamp of the previous packet
    last_rtptime: Option<RtpTimestamp>,

    /// Smoothed arrival jitter in nanoseconds
    avg_jitter: ClockTime,

    /// Saturating counter deciding whether the stream is equidistant
    equidistant: i32,

    /// RTP timestamp of the start of the current consecutive run
    ips_rtptime: Option<RtpTimestamp>,

    /// Running time of the start of the current consecutive run
    ips_pts: Option<ClockTime>,

    /// Smoothed inter-packet spacing in nanoseconds
    packet_spacing: ClockTime,
}

impl RtpTimeline {
    /// Create a timeline for the given clock rate
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            unwrapper: Unwrapper::new(32),
            base_pts: None,
            base_ext_rtptime: None,
            last_arrival: None,
            last_rtptime: None,
            avg_jitter: 0,
            equidistant: 0,
            ips_rtptime: None,
            ips_pts: None,
            packet_spacing: 0,
        }
    }

    /// Compute the running time of a packet from its RTP timestamp
    ///
    /// The first call anchors the timeline at `arrival`; later calls place
    /// the packet by its timestamp delta, choosing the wraparound
    /// interpretation with the smaller magnitude. Deltas that reach before
    /// the base saturate at 0.
    pub fn pts(&mut self, rtptime: RtpTimestamp, arrival: ClockTime) -> ClockTime {
        let ext = self.unwrapper.unwrap(rtptime as u64);

        let (base_pts, base_ext) = match (self.base_pts, self.base_ext_rtptime) {
            (Some(p), Some(e)) => (p, e),
            _ => {
                self.base_pts = Some(arrival);
                self.base_ext_rtptime = Some(ext);
                debug!(rtptime, arrival, "timeline anchored");
                return arrival;
            }
        };

        if ext >= base_ext {
            base_pts.saturating_add(rtp_to_ns(ext - base_ext, self.clock_rate))
        } else {
            base_pts.saturating_sub(rtp_to_ns(base_ext - ext, self.clock_rate))
        }
    }

    /// Update the jitter estimate and the equidistant heuristic from one
    /// arrival
    ///
    /// Call for every original (non-retransmitted) packet, in whatever order
    /// they arrive.
    pub fn update_jitter(&mut self, rtptime: RtpTimestamp, arrival: ClockTime) {
        let dtsdiff = match self.last_arrival {
            Some(last) => arrival as i64 - last as i64,
            None => 0,
        };
        let rtpdiff = match self.last_rtptime {
            Some(last) => rtptime.wrapping_sub(last) as i32,
            None => 0,
        };

        // streams that repeat timestamps (fragments of one frame) are not
        // equidistant
        if self.last_rtptime == Some(rtptime) {
            self.equidistant -= 2;
        } else {
            self.equidistant += 1;
        }
        self.equidistant = self.equidistant.clamp(EQUIDISTANT_MIN, EQUIDISTANT_MAX);

        self.last_arrival = Some(arrival);
        self.last_rtptime = Some(rtptime);

        let rtpdiffns = if rtpdiff >= 0 {
            rtp_to_ns(rtpdiff as u64, self.clock_rate) as i64
        } else {
            -(rtp_to_ns((-(rtpdiff as i64)) as u64, self.clock_rate) as i64)
        };

        let diff = (dtsdiff - rtpdiffns).unsigned_abs();
        self.avg_jitter = (diff + 15 * self.avg_jitter) >> 4;

        trace!(
            dtsdiff,
            rtpdiffns,
            jitter = self.avg_jitter,
            equidistant = self.equidistant,
            "jitter updated"
        );
    }

    /// Update the packet-spacing estimate from a packet that arrived exactly
    /// in sequence
    ///
    /// Spacing needs consecutive sequence numbers with differing timestamps;
    /// the estimate is biased towards larger spacings so packets that arrive
    /// slightly late do not trigger needless retransmission requests.
    pub fn update_spacing(&mut self, rtptime: RtpTimestamp, pts: ClockTime) {
        if self.ips_rtptime == Some(rtptime) {
            return;
        }

        if let Some(ips_pts) = self.ips_pts {
            if self.ips_rtptime.is_some() && pts > ips_pts {
                let new_spacing = pts - ips_pts;
                let old_spacing = self.packet_spacing;

                self.packet_spacing = if old_spacing > new_spacing {
                    (new_spacing + 3 * old_spacing) / 4
                } else if old_spacing > 0 {
                    (3 * new_spacing + old_spacing) / 4
                } else {
                    new_spacing
                };

                trace!(
                    new_spacing,
                    old_spacing,
                    spacing = self.packet_spacing,
                    "packet spacing updated"
                );
            }
        }
        self.ips_rtptime = Some(rtptime);
        self.ips_pts = Some(pts);
    }

    /// Forget the consecutive-packet run after a sequence gap
    pub fn break_spacing_run(&mut self) {
        self.ips_rtptime = None;
        self.ips_pts = None;
    }

    /// Current packet-spacing estimate in nanoseconds (0 when unknown)
    pub fn packet_spacing(&self) -> ClockTime {
        self.packet_spacing
    }

    /// Current smoothed jitter estimate in nanoseconds
    pub fn avg_jitter(&self) -> ClockTime {
        self.avg_jitter
    }

    /// Whether the stream currently looks equidistantly spaced
    pub fn is_equidistant(&self) -> bool {
        self.equidistant > 0
    }

    /// Forget everything, ready for a new timestamp domain
    pub fn reset(&mut self) {
        let clock_rate = self.clock_rate;
        *self = Self::new(clock_rate);
    }
}

/// Convert RTP clock units to nanoseconds
fn rtp_to_ns(units: u64, clock_rate: u32) -> ClockTime {
    if clock_rate == 0 {
        return 0;
    }
    ((units as u128 * SECOND as u128) / clock_rate as u128) as u64
}
