//! Error types for the slow-query pipeline.

use thiserror::Error;

/// Errors that can occur while reading, parsing or shipping slow-query logs.
#[derive(Debug, Error)]
pub enum LogError {
    /// The line source ended and no buffered record remains.
    #[error("the log has ended")]
    EndOfLog,

    /// A flushed record did not carry the duration markers.
    #[error("could not derive query or plan info from the log record")]
    InvalidRecord,

    /// The line source failed while reading.
    #[error("line source failed: {0}")]
    Source(String),

    /// The line source subprocess could not be started.
    #[error("failed to start line source: {0}")]
    Spawn(String),

    /// The forwarding queue is full and the payload was dropped.
    #[error("forwarding queue capacity exceeded")]
    QueueFull,

    /// The forwarding writer is no longer running.
    #[error("forwarding sink closed")]
    SinkClosed,

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LogError {
    /// Returns true for conditions the pipeline logs and skips.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidRecord | Self::QueueFull | Self::Serialization(_)
        )
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, LogError>;
