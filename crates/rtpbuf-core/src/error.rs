use thiserror::Error;

/// Error type for jitter buffer operations
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Session error
    #[error("Jitter session error: {0}")]
    SessionError(String),
}
