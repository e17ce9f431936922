//! Jitter buffer configuration
//!
//! All timing options are expressed in milliseconds, the way latency is
//! usually negotiated; the engine itself works in nanoseconds on the
//! running-time axis.

/// Default latency window in milliseconds
pub const DEFAULT_LATENCY_MS: u32 = 200;

/// Default for emitting packet-lost notifications
pub const DEFAULT_DO_LOST: bool = false;

/// Default for issuing retransmission requests
pub const DEFAULT_DO_RETRANSMISSION: bool = false;

/// Default for pre-arming a retransmission timer for the next sequence number
pub const DEFAULT_RTX_NEXT_SEQNUM: bool = true;

/// Default reorder distance (in packets) before a retransmission request is
/// sent for a sequence number that is overtaken by newer arrivals
pub const DEFAULT_RTX_DELAY_REORDER: u16 = 3;

/// Default time a resolved retransmission timer is kept around to attribute
/// late retransmitted packets to their requests, in milliseconds
pub const DEFAULT_RTX_STATS_TIMEOUT_MS: u32 = 1000;

/// Default dropout tolerance in milliseconds; a forward sequence jump
/// spanning more than this much stream time resets the buffer
pub const DEFAULT_MAX_DROPOUT_TIME_MS: u32 = 60_000;

/// Default misorder tolerance in milliseconds; packets older than this much
/// stream time are dropped as late
pub const DEFAULT_MAX_MISORDER_TIME_MS: u32 = 2_000;

/// Configuration for a [`JitterBuffer`](crate::JitterBuffer)
///
/// The `rtx_*` options only apply when `do_retransmission` is enabled.
/// Options typed `Option<u32>` are automatic when `None`: the engine derives
/// them from the observed packet spacing, jitter and retransmission
/// round-trip time.
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// RTP clock rate of the stream in Hz
    pub clock_rate: u32,

    /// Latency window in milliseconds; packets are buffered for at most this
    /// long before the missing ones are declared lost
    pub latency_ms: u32,

    /// Shifts all deadlines and outgoing timestamps, in nanoseconds
    pub ts_offset: i64,

    /// Emit packet-lost events for sequence numbers declared lost
    pub do_lost: bool,

    /// Issue retransmission request events for missing sequence numbers
    pub do_retransmission: bool,

    /// Pre-arm a retransmission timer for the next expected sequence number
    /// so its loss is requested without waiting for a later packet
    pub rtx_next_seqnum: bool,

    /// Extra delay before the first retransmission request, in milliseconds
    /// (`None`: adapt to jitter and packet spacing)
    pub rtx_delay_ms: Option<u32>,

    /// Lower bound for the first-request delay, in milliseconds
    pub rtx_min_delay_ms: u32,

    /// Sequence distance tolerated as plain reordering before requesting
    /// retransmission immediately; 0 disables the check
    pub rtx_delay_reorder: u16,

    /// Interval between repeated requests for the same sequence number, in
    /// milliseconds (`None`: adapt to the measured round-trip time)
    pub rtx_retry_timeout_ms: Option<u32>,

    /// Lower bound for the retry interval, in milliseconds (`None`: packet
    /// spacing)
    pub rtx_min_retry_timeout_ms: Option<u32>,

    /// Total time retransmissions are requested for one sequence number, in
    /// milliseconds (`None`: latency minus the retry interval)
    pub rtx_retry_period_ms: Option<u32>,

    /// Maximum number of requests per sequence number (`None`: unlimited
    /// within the retry period)
    pub rtx_max_retries: Option<u32>,

    /// Deadline communicated to the retransmission sender, in milliseconds
    /// (`None`: the latency window)
    pub rtx_deadline_ms: Option<u32>,

    /// How long resolved retransmission timers are kept for late-arrival
    /// statistics, in milliseconds
    pub rtx_stats_timeout_ms: u32,

    /// Forward sequence jump tolerance expressed as stream time in
    /// milliseconds; 0 disables the big-gap reset
    pub max_dropout_time_ms: u32,

    /// Backward sequence jump tolerance expressed as stream time in
    /// milliseconds; 0 disables the check
    pub max_misorder_time_ms: u32,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            clock_rate: 8000,
            latency_ms: DEFAULT_LATENCY_MS,
            ts_offset: 0,
            do_lost: DEFAULT_DO_LOST,
            do_retransmission: DEFAULT_DO_RETRANSMISSION,
            rtx_next_seqnum: DEFAULT_RTX_NEXT_SEQNUM,
            rtx_delay_ms: None,
            rtx_min_delay_ms: 0,
            rtx_delay_reorder: DEFAULT_RTX_DELAY_REORDER,
            rtx_retry_timeout_ms: None,
            rtx_min_retry_timeout_ms: None,
            rtx_retry_period_ms: None,
            rtx_max_retries: None,
            rtx_deadline_ms: None,
            rtx_stats_timeout_ms: DEFAULT_RTX_STATS_TIMEOUT_MS,
            max_dropout_time_ms: DEFAULT_MAX_DROPOUT_TIME_MS,
            max_misorder_time_ms: DEFAULT_MAX_MISORDER_TIME_MS,
        }
    }
}
