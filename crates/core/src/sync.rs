//! Per-kind initial sync readiness flags.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};

/// Readiness of one watched kind. Both flags are set-once: they never go back to `false`.
#[derive(Debug, Default)]
pub struct SyncState {
    initial_sync_complete: AtomicBool,
    initial_sync_timed_out: AtomicBool,
}

impl SyncState {
    pub fn new() -> Self { Self::default() }

    pub fn initial_sync_complete(&self) -> bool {
        self.initial_sync_complete.load(Ordering::Acquire)
    }

    pub fn initial_sync_timed_out(&self) -> bool {
        self.initial_sync_timed_out.load(Ordering::Acquire)
    }

    /// Returns `true` only for the call that flipped the flag.
    pub fn mark_complete(&self) -> bool {
        !self.initial_sync_complete.swap(true, Ordering::AcqRel)
    }

    /// Returns `true` only for the call that flipped the flag.
    pub fn mark_timed_out(&self) -> bool {
        !self.initial_sync_timed_out.swap(true, Ordering::AcqRel)
    }
}
