//! Ambient observability: atomic counters the facade and core update on
//! every commit/decommit/alloc/free, read back through [`Stats::committed_pages`]
//! and its sibling fields for tests and diagnostics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonic-ish quantity (committed pages, bytes in use) tracked as a
/// running total plus its high-water mark.
#[derive(Debug, Default)]
pub struct StatCounter {
    current: AtomicI64,
    peak: AtomicI64,
}

impl StatCounter {
    pub const fn new() -> Self {
        StatCounter { current: AtomicI64::new(0), peak: AtomicI64::new(0) }
    }

    pub fn increase(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(current, Ordering::Relaxed);
    }

    pub fn decrease(&self, amount: i64) {
        self.increase(-amount);
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Process-wide counters for one heap instance. Every field is
/// independently atomic; callers never need exclusive access, which
/// matters since the fast allocate/free path is meant to stay lock-free
/// outside the page pool.
#[derive(Debug, Default)]
pub struct Stats {
    pub committed_pages: StatCounter,
    pub small_allocs: AtomicU64,
    pub small_frees: AtomicU64,
    pub large_allocs: AtomicU64,
    pub large_frees: AtomicU64,
    pub small_path_exhausted: AtomicU64,
}

impl Stats {
    pub const fn new() -> Self {
        Stats {
            committed_pages: StatCounter::new(),
            small_allocs: AtomicU64::new(0),
            small_frees: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            large_frees: AtomicU64::new(0),
            small_path_exhausted: AtomicU64::new(0),
        }
    }

    pub fn record_commit(&self) {
        self.committed_pages.increase(1);
    }

    pub fn record_decommit(&self) {
        self.committed_pages.decrease(1);
    }

    pub fn record_small_alloc(&self) {
        self.small_allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_small_free(&self) {
        self.small_frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_large_alloc(&self) {
        self.large_allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_large_free(&self) {
        self.large_frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_small_path_exhausted(&self) {
        self.small_path_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn committed_pages(&self) -> i64 {
        self.committed_pages.current()
    }
}
