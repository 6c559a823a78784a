//! Single-holder gate.
//!
//! The flag is checked and set in one atomic step, so the caller learns
//! whether it owns the gate before it schedules any work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Mutual-exclusion gate shared by every trigger. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SyncGate {
    busy: Arc<AtomicBool>,
}

impl SyncGate {
    /// Create an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gate, or `None` if someone holds it.
    #[must_use]
    pub fn try_acquire(&self) -> Option<SyncGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    /// Whether the gate is currently held.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof of holding the gate. Dropping it opens the gate.
#[derive(Debug)]
pub struct SyncGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
