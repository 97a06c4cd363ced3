use std::sync::atomic::{AtomicI64, Ordering};

/// Process-wide monotonic 64-bit counter. Every committed mutating log entry
/// obtains exactly one new revision by calling `next()`. Reads observe the
/// current value via `get()` without advancing it.
///
/// Only the apply loop calls `next()`; everything else only reads.
#[derive(Debug, Default)]
pub struct RevisionSource {
    current: AtomicI64,
}

impl RevisionSource {
    pub fn new(start: i64) -> Self {
        Self { current: AtomicI64::new(start) }
    }

    /// Advances the counter by one and returns the new revision.
    pub fn next(&self) -> i64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the current revision without advancing it.
    pub fn get(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Used by a storage engine restoring state from disk or from a snapshot.
    pub fn restore(&self, value: i64) {
        self.current.store(value, Ordering::SeqCst);
    }
}
