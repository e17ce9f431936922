//! RTP jitter buffer core for the RTPBUF project
//!
//! This crate turns a lossy, reorderable stream of RTP packets into an
//! in-order, deadline-scheduled stream with explicit loss notifications and
//! upstream retransmission requests.
//!
//! The library is organized into several modules:
//!
//! - `packet`: the arrived-packet type and sequence number arithmetic
//! - `timeline`: RTP timestamp to running-time mapping, spacing and jitter
//! - `buffer`: the sequence-ordered packet queue
//! - `timer`: the shared deadline timer set
//! - `rtx`: retransmission timing and statistics
//! - `jitter`: the jitter buffer engine tying it all together
//! - `session`: an async driver running the engine against the tokio clock

mod error;

// Main modules
pub mod buffer;
pub mod config;
pub mod jitter;
pub mod packet;
pub mod rtx;
pub mod session;
pub mod timeline;
pub mod timer;

// Re-export core types
pub use error::Error;

pub use config::JitterBufferConfig;
pub use jitter::{
    JitterBuffer, JitterBufferEvent, JitterBufferStats, LostEvent, PushResult, ReleasedPacket,
    RtxRequest,
};
pub use packet::Packet;
pub use session::JitterSession;

/// Typedef for RTP timestamp values
pub type RtpTimestamp = u32;

/// Typedef for RTP sequence numbers
pub type RtpSequenceNumber = u16;

/// Typedef for RTP synchronization source identifier
pub type RtpSsrc = u32;

/// Engine time in nanoseconds on the shared running-time axis
pub type ClockTime = u64;

/// One millisecond of engine time
pub const MILLISECOND: ClockTime = 1_000_000;

/// One second of engine time
pub const SECOND: ClockTime = 1_000_000_000;

/// Result type for jitter buffer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        ClockTime, Error, JitterBuffer, JitterBufferConfig, JitterBufferEvent, JitterBufferStats,
        Packet, PushResult, Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp,
    };
}
