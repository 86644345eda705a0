//! Error types shared by the gate, the prober and the watch loop.

use std::time::Duration;

use thiserror::Error;

/// Boxed error used by callbacks and tower middleware.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for control layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the Kubernetes control layer.
#[derive(Debug, Error)]
pub enum Error {
    /// No gate slot became available within the queue ceiling.
    #[error("API call rate limiter queue is full (waited {waited:?})")]
    QueueFull {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// The watch stream could not be opened or was dropped.
    #[error("watch connection failed: {0}")]
    Connection(String),

    /// A watch line was not a valid watch event.
    #[error("malformed watch event: {0}")]
    Decode(#[from] serde_json::Error),

    /// A watch event lacked the identity fields needed to track it.
    #[error("invalid watch event: {0}")]
    InvalidEvent(String),

    /// A registered callback failed.
    #[error("callback '{name}' failed: {message}")]
    Callback {
        /// Name the callback was registered under.
        name: String,
        /// Failure description.
        message: String,
    },

    /// A health probe did not reach the expected outcome in time.
    #[error("{probe} probe did not converge within {timeout:?}")]
    ProbeTimeout {
        /// Which probe timed out.
        probe: &'static str,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Kubernetes client error.
    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    ///
    /// Configuration errors are programmer errors and are never retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}
