use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Transport, timeout and IO failures inside a running request are caught by
/// the scheduler's retry loop and only reach the caller once the retry budget
/// is exhausted. Validation errors are raised immediately from constructors
/// and are never retried.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network or connection failure during a request or body read.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with a non-success status code.
    #[error("server returned HTTP {0}")]
    HttpStatus(StatusCode),

    /// The per-request timeout elapsed before the transfer finished.
    #[error("request timed out")]
    Timeout,

    /// A cancellation token fired while the request was suspended.
    #[error("request cancelled")]
    Cancelled,

    /// Failure while touching the local filesystem.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The request was rejected before it ever ran.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Write attempted after the channel was completed.
    #[error("channel is closed")]
    ChannelClosed,
}
