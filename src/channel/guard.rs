use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Allows at most one caller at a time into an operation, failing (rather than waiting) for
///  everybody else
#[derive(Default)]
pub struct OperationGuard {
    busy: Arc<AtomicBool>,
}

impl OperationGuard {
    pub fn new() -> OperationGuard {
        Default::default()
    }

    /// `None` if another caller currently holds a permit
    pub fn try_acquire(&self) -> Option<OperationPermit> {
        self.busy.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| OperationPermit { busy: self.busy.clone() })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Released on drop. The permit is owned, so it can be handed to whoever finishes the operation
///  and outlive the caller's future.
pub struct OperationPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
