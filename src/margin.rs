//! The decommit margin. Each thread, per size class, holds at most one
//! drained page queued for decommit, and only lets go of it once
//! accumulated free capacity in that class crosses `slots_per_page *
//! 3/2`. This is the anti-thrash mechanism for workloads that allocate
//! and free right at a page boundary.
//!
//! `DecommitMargin` only tracks state and tells the caller which page (if
//! any) it should actually decommit; it never calls into the page
//! provider itself, which keeps the hysteresis policy testable on its
//! own.

use crate::types::{PageIndex, MARGIN_DENOMINATOR, MARGIN_NUMERATOR};

/// Per-thread, per-class decommit bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecommitMargin {
    decommit_pool: Option<PageIndex>,
    available: u64,
}

impl DecommitMargin {
    pub const fn new() -> Self {
        DecommitMargin { decommit_pool: None, available: 0 }
    }

    /// A page of this class just drained (`liveCount` reached zero).
    /// Returns a page the caller must decommit *now*: the previously
    /// queued page, displaced by the fresher one.
    pub fn reserve_decommit(&mut self, pi: PageIndex) -> Option<PageIndex> {
        if self.decommit_pool == Some(pi) {
            return None;
        }
        self.decommit_pool.replace(pi)
    }

    /// An allocation just consumed a slot from page `pi`. If that page
    /// was queued for decommit, the queue is cancelled — it's live again.
    pub fn cancel_if_reserved_on_alloc(&mut self, pi: PageIndex) {
        self.available = self.available.saturating_sub(1);
        if self.decommit_pool == Some(pi) {
            self.decommit_pool = None;
        }
    }

    /// A slot of this class was just freed. `margin` is `slots_per_page *
    /// MARGIN_NUMERATOR / MARGIN_DENOMINATOR`. Returns the queued page
    /// once spare capacity reaches the margin — the caller must decommit
    /// it and push it back to the pool.
    pub fn maybe_decommit_on_free(&mut self, margin: u64) -> Option<PageIndex> {
        self.available += 1;
        if self.available >= margin {
            self.decommit_pool.take()
        } else {
            None
        }
    }

    /// A page of this class was committed, crediting its free slots.
    pub fn on_commit(&mut self, slots_per_page: u64) {
        self.available += slots_per_page.saturating_sub(1);
    }

    /// A page of this class was decommitted, debiting its (formerly
    /// free) slots.
    pub fn on_decommit(&mut self, slots_per_page: u64) {
        self.available = self.available.saturating_sub(slots_per_page.saturating_sub(1));
    }

    pub fn available(&self) -> u64 {
        self.available
    }

    pub fn queued(&self) -> Option<PageIndex> {
        self.decommit_pool
    }
}

/// `slots_per_page * MARGIN_NUMERATOR / MARGIN_DENOMINATOR`, the
/// threshold `maybe_decommit_on_free` compares against.
#[inline]
pub const fn margin_threshold(slots_per_page: usize) -> u64 {
    (slots_per_page as u64 * MARGIN_NUMERATOR) / MARGIN_DENOMINATOR
}
