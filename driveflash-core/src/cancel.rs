use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A shared flag used to request cancellation of a running job.
///
/// Clones observe the same flag. The worker polls it only at safe boundaries: before the
/// erase stage starts and between transfer buffers.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
