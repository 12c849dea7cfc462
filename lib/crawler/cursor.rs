use std::sync::atomic::{AtomicI64, Ordering};

use crate::server::monitoring::CRAWL_METRICS;

/// Last dispatched instance id, shared by the cycle controller and the gap detector.
///
/// Advances are a single fetch-and-add, so the value only moves forward except
/// through an explicit [`Cursor::rebase`].
#[derive(Debug)]
pub struct Cursor {
    value: AtomicI64,
    skip: i64,
}

impl Cursor {
    pub fn new(start: i64, skip: i64) -> Self {
        Self {
            value: AtomicI64::new(start),
            skip: skip.max(0),
        }
    }

    /// Moves forward by `skip + 1` and returns the id to dispatch.
    pub fn advance(&self) -> i64 {
        let step = self.skip + 1;
        let next = self.value.fetch_add(step, Ordering::SeqCst) + step;
        if let Some(metrics) = CRAWL_METRICS.get() {
            metrics.cursor_id.set(next);
        }
        next
    }

    /// Overrides the position. Only the gap detector does this.
    pub fn rebase(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst);
        if let Some(metrics) = CRAWL_METRICS.get() {
            metrics.cursor_id.set(value);
        }
    }

    pub fn load(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn skip(&self) -> i64 {
        self.skip
    }
}
