//! Retransmission timing and statistics
//!
//! Computes when to ask for a missing packet again and keeps the counters
//! that describe how well retransmission is working. Request timing adapts
//! to the observed jitter, packet spacing and retransmission round-trip
//! time so packets that are merely reordered within normal jitter bounds are
//! not requested.

use tracing::debug;

use crate::config::JitterBufferConfig;
use crate::timer::Timer;
use crate::{ClockTime, MILLISECOND};

/// First-request delay when neither jitter nor packet spacing is known yet
pub const AUTO_RTX_DELAY: ClockTime = 20 * MILLISECOND;

/// Retry interval before any round-trip time has been measured
pub const AUTO_RTX_TIMEOUT: ClockTime = 40 * MILLISECOND;

/// Retransmission scheduler state and statistics
#[derive(Debug, Clone, Default)]
pub struct RtxTracker {
    /// Requests sent
    num_requests: u64,

    /// Requested packets that eventually arrived as retransmissions
    num_success: u64,

    /// Requests that produced nothing (or a too-late answer)
    num_failed: u64,

    /// Smoothed number of requests per requested packet
    avg_num: f64,

    /// Smoothed request-to-answer round-trip time in nanoseconds
    avg_rtt: ClockTime,
}

impl RtxTracker {
    /// Create a tracker with no history
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra delay before the first request for a missing packet
    ///
    /// Automatic mode waits out twice the jitter or half a packet spacing,
    /// whichever is larger, capped so a request can still be answered within
    /// the latency window.
    pub fn request_delay(
        &self,
        config: &JitterBufferConfig,
        packet_spacing: ClockTime,
        avg_jitter: ClockTime,
    ) -> ClockTime {
        let latency = config.latency_ms as ClockTime * MILLISECOND;

        let delay = match config.rtx_delay_ms {
            Some(ms) => ms as ClockTime * MILLISECOND,
            None => {
                let delay_max = if latency > self.avg_rtt {
                    latency - self.avg_rtt
                } else {
                    latency
                };
                let delay = if avg_jitter == 0 && packet_spacing == 0 {
                    AUTO_RTX_DELAY
                } else {
                    (avg_jitter * 2).max(packet_spacing / 2)
                };
                delay.min(delay_max)
            }
        };

        delay.max(config.rtx_min_delay_ms as ClockTime * MILLISECOND)
    }

    /// Interval between repeated requests for the same packet
    pub fn retry_timeout(
        &self,
        config: &JitterBufferConfig,
        packet_spacing: ClockTime,
        avg_jitter: ClockTime,
    ) -> ClockTime {
        let timeout = match config.rtx_retry_timeout_ms {
            Some(ms) => ms as ClockTime * MILLISECOND,
            None if self.avg_rtt == 0 => AUTO_RTX_TIMEOUT,
            // wait out a full round-trip plus jitter before asking again
            None => self.avg_rtt + avg_jitter * 2,
        };

        let min_timeout = match config.rtx_min_retry_timeout_ms {
            Some(ms) => ms as ClockTime * MILLISECOND,
            None => packet_spacing,
        };

        // floor keeps a zero interval from busy-looping retries
        timeout.max(min_timeout).max(MILLISECOND)
    }

    /// Total time requests are sent for one packet before giving up
    pub fn retry_period(
        &self,
        config: &JitterBufferConfig,
        retry_timeout: ClockTime,
    ) -> ClockTime {
        match config.rtx_retry_period_ms {
            Some(ms) => ms as ClockTime * MILLISECOND,
            None => {
                let latency = config.latency_ms as ClockTime * MILLISECOND;
                latency.saturating_sub(retry_timeout)
            }
        }
    }

    /// Count one sent request
    pub fn record_request(&mut self) {
        self.num_requests += 1;
    }

    /// Account for a delivery that answers (or fails to answer) a request
    ///
    /// `success` means a retransmitted packet arrived in time to be played.
    /// The round-trip time is only sampled when the delivery answers the
    /// most recent request; an answer to an earlier request would skew it.
    pub fn record_response(&mut self, timer: &Timer, arrival: ClockTime, success: bool) {
        if success {
            self.num_success += 1;
            self.num_failed += timer.rtx_retry.saturating_sub(1) as u64;
        } else {
            self.num_failed += timer.rtx_retry as u64;
        }

        if self.avg_num == 0.0 {
            self.avg_num = timer.rtx_retry as f64;
        } else {
            self.avg_num = (timer.rtx_retry as f64 + 7.0 * self.avg_num) / 8.0;
        }

        if timer.rtx_retry == timer.rtx_received {
            if let Some(last) = timer.rtx_last {
                if arrival > last {
                    self.update_rtt(arrival - last);
                }
            }
        }

        debug!(
            seqnum = timer.seqnum,
            success,
            requests = self.num_requests,
            successes = self.num_success,
            failed = self.num_failed,
            rtt = self.avg_rtt,
            "rtx response recorded"
        );
    }

    /// Account for a packet whose requests were abandoned at the retry
    /// ceiling
    pub fn record_abandoned(&mut self, retries: u32) {
        self.num_failed += retries as u64;
    }

    /// Requests sent so far
    pub fn requests(&self) -> u64 {
        self.num_requests
    }

    /// Requested packets answered in time
    pub fn successes(&self) -> u64 {
        self.num_success
    }

    /// Requests without a usable answer
    pub fn failures(&self) -> u64 {
        self.num_failed
    }

    /// Average number of requests per requested packet
    pub fn avg_per_packet(&self) -> f64 {
        self.avg_num
    }

    /// Smoothed round-trip time in nanoseconds (0 before the first sample)
    pub fn rtt(&self) -> ClockTime {
        self.avg_rtt
    }

    /// Zero all counters and estimates
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    // Weighted round-trip average: growing measurements count 1/8th,
    // shrinking ones 1/16th, outliers beyond 2x the average 1/48th.
    fn update_rtt(&mut self, rtt: ClockTime) {
        if self.avg_rtt == 0 {
            self.avg_rtt = rtt;
            return;
        }

        let weight: u64 = if rtt > 2 * self.avg_rtt {
            48
        } else if rtt > self.avg_rtt {
            8
        } else {
            16
        };

        self.avg_rtt = (rtt + (weight - 1) * self.avg_rtt) / weight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerKind;

    fn config() -> JitterBufferConfig {
        JitterBufferConfig {
            latency_ms: 200,
            ..Default::default()
        }
    }

    fn answered_timer(retry: u32, received: u32, last: ClockTime) -> Timer {
        let mut t = Timer::expected(10, 0, Some(0), 0);
        t.kind = TimerKind::Expected;
        t.rtx_retry = retry;
        t.rtx_received = received;
        t.rtx_last = Some(last);
        t
    }

    #[test]
    fn test_request_delay_auto() {
        let tracker = RtxTracker::new();
        let cfg = config();

        // nothing known yet: fixed default
        assert_eq!(tracker.request_delay(&cfg, 0, 0), AUTO_RTX_DELAY);

        // half the packet spacing wins over zero jitter
        assert_eq!(
            tracker.request_delay(&cfg, 20 * MILLISECOND, 0),
            10 * MILLISECOND
        );

        // twice the jitter wins when it is larger
        assert_eq!(
            tracker.request_delay(&cfg, 20 * MILLISECOND, 30 * MILLISECOND),
            60 * MILLISECOND
        );
    }

    #[test]
    fn test_request_delay_configured() {
        let tracker = RtxTracker::new();
        let mut cfg = config();
        cfg.rtx_delay_ms = Some(15);
        assert_eq!(
            tracker.request_delay(&cfg, 20 * MILLISECOND, 0),
            15 * MILLISECOND
        );

        cfg.rtx_min_delay_ms = 25;
        assert_eq!(
            tracker.request_delay(&cfg, 20 * MILLISECOND, 0),
            25 * MILLISECOND
        );
    }

    #[test]
    fn test_request_delay_capped_by_latency() {
        let tracker = RtxTracker::new();
        let mut cfg = config();
        cfg.latency_ms = 30;
        // enormous jitter must not push the request past the point where an
        // answer could still arrive
        assert_eq!(
            tracker.request_delay(&cfg, 0, 100 * MILLISECOND),
            30 * MILLISECOND
        );
    }

    #[test]
    fn test_retry_timeout() {
        let mut tracker = RtxTracker::new();
        let cfg = config();

        assert_eq!(tracker.retry_timeout(&cfg, 0, 0), AUTO_RTX_TIMEOUT);
        // floored by the packet spacing
        assert_eq!(
            tracker.retry_timeout(&cfg, 60 * MILLISECOND, 0),
            60 * MILLISECOND
        );

        // once a round-trip is known the timeout follows it
        tracker.update_rtt(100 * MILLISECOND);
        assert_eq!(
            tracker.retry_timeout(&cfg, 0, 5 * MILLISECOND),
            110 * MILLISECOND
        );
    }

    #[test]
    fn test_retry_period() {
        let tracker = RtxTracker::new();
        let cfg = config();
        assert_eq!(
            tracker.retry_period(&cfg, 40 * MILLISECOND),
            160 * MILLISECOND
        );

        let mut cfg = config();
        cfg.rtx_retry_period_ms = Some(120);
        assert_eq!(
            tracker.retry_period(&cfg, 40 * MILLISECOND),
            120 * MILLISECOND
        );
    }

    #[test]
    fn test_response_counters() {
        let mut tracker = RtxTracker::new();

        // three requests went out, the third answer made it
        tracker.record_request();
        tracker.record_request();
        tracker.record_request();
        let timer = answered_timer(3, 1, 100 * MILLISECOND);
        tracker.record_response(&timer, 120 * MILLISECOND, true);

        assert_eq!(tracker.requests(), 3);
        assert_eq!(tracker.successes(), 1);
        assert_eq!(tracker.failures(), 2);
        assert_eq!(tracker.avg_per_packet(), 3.0);
        assert_eq!(tracker.rtt(), 0, "answer to an older request has no RTT");
    }

    #[test]
    fn test_rtt_sampled_for_latest_request_only() {
        let mut tracker = RtxTracker::new();
        tracker.record_request();
        let timer = answered_timer(1, 1, 100 * MILLISECOND);
        tracker.record_response(&timer, 130 * MILLISECOND, true);
        assert_eq!(tracker.rtt(), 30 * MILLISECOND);
    }

    #[test]
    fn test_rtt_weighting() {
        let mut tracker = RtxTracker::new();
        tracker.update_rtt(40 * MILLISECOND);
        assert_eq!(tracker.rtt(), 40 * MILLISECOND);

        // larger measurements count 1/8th
        tracker.update_rtt(48 * MILLISECOND);
        assert_eq!(tracker.rtt(), 41 * MILLISECOND);

        // outliers count 1/48th
        let before = tracker.rtt();
        tracker.update_rtt(400 * MILLISECOND);
        let after = tracker.rtt();
        assert!(after > before && after < before + 10 * MILLISECOND);

        // smaller measurements count 1/16th
        let before = tracker.rtt();
        tracker.update_rtt(10 * MILLISECOND);
        assert!(tracker.rtt() < before);
    }

    #[test]
    fn test_reset() {
        let mut tracker = RtxTracker::new();
        tracker.record_request();
        tracker.record_abandoned(1);
        tracker.reset();
        assert_eq!(tracker.requests(), 0);
        assert_eq!(tracker.failures(), 0);
    }
}
