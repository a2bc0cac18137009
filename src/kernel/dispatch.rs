//! One-shot latch for overlapping halo exchange with compute.
//!
//! Every pass of the kernel orders the export-boundary rows first. As
//! soon as the worker team has finished them, the halo messages for the
//! pass can be posted while the bulk of the rows is still being
//! processed; the exchange then progresses concurrently with compute
//! and is completed at the start of the next pass.
//!
//! [`SynchronizationDispatch`] guarantees that the exchange of a pass
//! is posted exactly once: the first [`dispatch`] call after the export
//! rows runs the payload, the second call at the end of the pass is the
//! fallback for passes whose export range is empty or skipped.

use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot latch; see the module documentation.
pub struct SynchronizationDispatch {
    fired: AtomicBool,
}

impl SynchronizationDispatch {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// Run `payload` unless a payload already ran for this pass.
    #[inline]
    pub fn dispatch(&self, payload: impl FnOnce()) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            payload();
        }
    }

    /// Whether the payload has run.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl Default for SynchronizationDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SynchronizationDispatch {
    fn drop(&mut self) {
        // A pass must not end without posting its exchange.
        debug_assert!(
            self.is_fired(),
            "synchronization dispatch dropped without firing"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_exactly_once() {
        let count = AtomicUsize::new(0);
        let dispatch = SynchronizationDispatch::new();
        dispatch.dispatch(|| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        dispatch.dispatch(|| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(dispatch.is_fired());
    }

    #[test]
    fn concurrent_dispatch_is_single_shot() {
        let count = AtomicUsize::new(0);
        let dispatch = SynchronizationDispatch::new();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    dispatch.dispatch(|| {
                        count.fetch_add(1, Ordering::SeqCst);
                    });
                });
            }
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
