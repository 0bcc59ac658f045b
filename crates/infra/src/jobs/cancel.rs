use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::types::JobError;

/// Cooperative cancellation flag shared between the broker and the worker
/// running a job.
///
/// Handlers poll it at checkpoints (between network calls, before writes).
/// Setting it never interrupts a cache computation other callers wait on.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// `Err(JobError::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}
