//! The page pool: a fixed-capacity stack of page indices, shared by
//! every thread, guarded by a single short critical section. The stack
//! storage itself lives outside the global allocator (see
//! [`crate::os::PageProvider::alloc_metadata`]) so this type can be
//! constructed before any allocator is up and running.

use crate::os::{PageProvider, ProviderError};
use crate::types::{PageIndex, INVALID_PAGE};
use core::mem::size_of;
use std::sync::Mutex;

/// `pool[0..=head]` is a permutation of the currently uncommitted page
/// indices; entries above `head` are [`INVALID_PAGE`]. An empty pool is
/// represented with `head == None`, rather than an unsigned index that
/// would need to underflow to signal emptiness.
struct Inner {
    entries: *mut PageIndex,
    capacity: usize,
    head: Option<usize>,
}

// SAFETY: all access to `entries` goes through `Mutex<Inner>`.
unsafe impl Send for Inner {}

pub struct PagePool {
    inner: Mutex<Inner>,
}

impl PagePool {
    /// Allocate and fully populate a pool over `pages` page indices
    /// (`0..pages`), all initially free.
    pub fn new<P: PageProvider>(provider: &P, pages: usize) -> Result<Self, ProviderError> {
        let bytes = pages * size_of::<PageIndex>();
        let raw = provider.alloc_metadata(bytes)? as *mut PageIndex;
        // SAFETY: `raw` is a fresh, exclusively-owned allocation of
        // `pages` `PageIndex` slots.
        unsafe {
            for i in 0..pages {
                raw.add(i).write(i as PageIndex);
            }
        }
        let head = if pages == 0 { None } else { Some(pages - 1) };
        Ok(PagePool { inner: Mutex::new(Inner { entries: raw, capacity: pages, head }) })
    }

    /// Pop a free page index, or `None` if the pool is exhausted.
    pub fn pop(&self) -> Option<PageIndex> {
        let mut inner = self.inner.lock().unwrap();
        let head = inner.head?;
        // SAFETY: `head < capacity`, and this slot is only touched
        // while holding the lock.
        let pi = unsafe {
            let slot = inner.entries.add(head);
            let pi = slot.read();
            slot.write(INVALID_PAGE);
            pi
        };
        inner.head = if head == 0 { None } else { Some(head - 1) };
        Some(pi)
    }

    /// Return a page index to the pool.
    pub fn push(&self, pi: PageIndex) {
        let mut inner = self.inner.lock().unwrap();
        let next = match inner.head {
            None => 0,
            Some(h) => h + 1,
        };
        debug_assert!(next < inner.capacity, "page pool overflow: pushed more pages than it holds");
        // SAFETY: `next < capacity`, slot was left as `INVALID_PAGE` by
        // whichever `pop` last vacated it (or is untouched at init).
        unsafe {
            let slot = inner.entries.add(next);
            debug_assert_eq!(slot.read(), INVALID_PAGE, "pushing onto a slot that already holds a page");
            slot.write(pi);
        }
        inner.head = Some(next);
    }

    /// Number of pages currently parked in the pool (for tests/stats).
    pub fn free_count(&self) -> usize {
        self.inner.lock().unwrap().head.map_or(0, |h| h + 1)
    }

    pub fn release<P: PageProvider>(&self, provider: &P) -> Result<(), ProviderError> {
        let inner = self.inner.lock().unwrap();
        let bytes = inner.capacity * size_of::<PageIndex>();
        provider.free_metadata(inner.entries as *mut u8, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::simulated::Simulated;

    #[test]
    fn pop_push_round_trips_every_index() {
        let provider = Simulated::new(4096);
        let pool = PagePool::new(&provider, 8).unwrap();
        assert_eq!(pool.free_count(), 8);

        let mut popped = Vec::new();
        while let Some(pi) = pool.pop() {
            popped.push(pi);
        }
        assert_eq!(pool.pop(), None);
        popped.sort_unstable();
        assert_eq!(popped, (0..8).collect::<Vec<_>>());

        for pi in popped {
            pool.push(pi);
        }
        assert_eq!(pool.free_count(), 8);
        pool.release(&provider).unwrap();
    }

    #[test]
    fn empty_pool_reports_none() {
        let provider = Simulated::new(4096);
        let pool = PagePool::new(&provider, 0).unwrap();
        assert_eq!(pool.pop(), None);
        pool.release(&provider).unwrap();
    }
}
