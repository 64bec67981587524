use crate::types::{Rank, ScalarType};

pub type Result<T> = std::result::Result<T, CohortError>;

/// Errors surfaced by cohort.
///
/// Validation failures (`InvalidArgument`, `Unsupported`) are raised
/// synchronously from dispatch. Failures inside a worker are captured into
/// the work item and re-raised by `wait()`, which is why this type is
/// `Clone`: a captured error may be observed by more than one waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CohortError {
    #[error("{op}: {reason}")]
    InvalidArgument { op: &'static str, reason: String },

    #[error("{op}: {reason}")]
    Unsupported { op: &'static str, reason: String },

    #[error("unsupported data type {dtype} for {op}")]
    UnsupportedDType { dtype: ScalarType, op: &'static str },

    #[error("{what} timed out after {timeout_ms}ms")]
    Timeout { what: &'static str, timeout_ms: u64 },

    #[error("invalid rank {rank}: group size is {size}")]
    InvalidRank { rank: Rank, size: usize },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl CohortError {
    /// Create an `InvalidArgument` error for the named operation.
    pub fn invalid_argument(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op,
            reason: reason.into(),
        }
    }

    /// Create an `Unsupported` error for the named operation.
    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            op,
            reason: reason.into(),
        }
    }

    /// Create a `Runtime` error with just a message.
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
