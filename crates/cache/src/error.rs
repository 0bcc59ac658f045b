use std::time::Duration;

use thiserror::Error;

/// Failure reported by a computation closure.
///
/// Carries its own retry classification so that every waiter sees the same
/// verdict the owner saw.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ComputeError {
    pub message: String,
    pub transient: bool,
}

impl ComputeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("computation failed: {0}")]
    Compute(ComputeError),

    #[error("computation for {key} exceeded its {after:?} deadline")]
    Timeout { key: String, after: Duration },

    #[error("computation for {key} panicked")]
    Panicked { key: String },

    #[error("cached value could not be decoded: {0}")]
    Decode(String),
}

impl CacheError {
    /// Whether a later attempt for the same key may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Compute(e) => e.transient,
            CacheError::Timeout { .. } => true,
            CacheError::Panicked { .. } | CacheError::Decode(_) => false,
        }
    }
}

impl From<ComputeError> for CacheError {
    fn from(value: ComputeError) -> Self {
        CacheError::Compute(value)
    }
}
