//! Heimdall error types and classification.

use std::time::Duration;

/// Heimdall error types
#[derive(Debug, thiserror::Error)]
pub enum HeimdallError {
    // Provider/network errors
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request timed out")]
    Timeout,

    /// Fast-reject raised while a circuit is open.
    ///
    /// Distinct from the wrapped operation's errors: it signals that the
    /// operation was never invoked, and it never counts as a new failure.
    #[error("circuit open for '{key}', retry in {retry_in:?}")]
    CircuitOpen { key: String, retry_in: Duration },

    // Validation errors
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("content filtered: {reason}")]
    ContentFiltered { reason: String },

    // Streaming errors
    #[error("stream error: {0}")]
    Stream(String),

    // Cache errors (fail-open: logged and degraded, never raised to callers)
    #[error("cache backend error: {0}")]
    Cache(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("no completion client configured")]
    NoClient,
}

/// Classification tag applied uniformly by the circuit breaker, the batch
/// orchestrator, and the streaming path.
///
/// Transient errors count toward circuit-breaker failures, permanent errors
/// propagate without tripping anything, filtered errors are moderation
/// outcomes rather than faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Filtered,
}

impl HeimdallError {
    /// Classify this error for retry/breaker purposes.
    pub fn class(&self) -> ErrorClass {
        match self {
            HeimdallError::Upstream(_)
            | HeimdallError::RateLimited { .. }
            | HeimdallError::Timeout
            | HeimdallError::Stream(_) => ErrorClass::Transient,
            HeimdallError::Api { status, .. } if *status == 429 || *status >= 500 => {
                ErrorClass::Transient
            }
            HeimdallError::ContentFiltered { .. } => ErrorClass::Filtered,
            _ => ErrorClass::Permanent,
        }
    }

    /// Whether this error represents a transient upstream fault.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Provider-supplied retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HeimdallError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias for heimdall operations
pub type Result<T> = std::result::Result<T, HeimdallError>;
