//! Error types for Spotheat
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in Spotheat
#[derive(Debug, Error)]
pub enum SpotheatError {
    /// Price or forecast source unreachable or returned a malformed body
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// Source returned fewer rows than a planning day needs
    #[error("Insufficient data: got {got} rows, need {need}")]
    InsufficientData { got: usize, need: usize },

    /// A single device RPC call failed
    #[error("RPC failed: {0}")]
    Rpc(String),

    /// Device schedule slot limit reached
    #[error("Device schedule capacity exceeded")]
    CapacityExceeded,

    /// Device has no valid wall-clock time yet
    #[error("Device clock not ready")]
    ClockNotReady,

    /// Persistent store error
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SpotheatError {
    /// Whether retrying the same operation could succeed.
    ///
    /// Capacity exhaustion is stable until entries are deleted, so a retry
    /// within the same reconcile pass is pointless.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SpotheatError::CapacityExceeded)
    }
}

/// Result type alias for Spotheat operations
pub type Result<T> = std::result::Result<T, SpotheatError>;
