use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Handle for one in-flight filesystem operation.
///
/// The dispatch loop owns the job; the backend only polls the cancellation
/// flag. Clones share the same flag, so a session can keep its own copy for
/// the lifetime of the operation.
#[derive(Debug, Clone, Default)]
pub struct Job {
    cancelled: Arc<AtomicBool>,
}

impl Job {
    pub fn new() -> Self {
        Job::default()
    }

    /// Request cancellation. Streaming operations notice it at the next
    /// block boundary and unwind without touching the backing archive.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
