//! A segregated-fit small-object heap for allocations of 256 bytes or
//! fewer, backed by a single reserved virtual-address range with
//! on-demand commit/decommit, per-thread freelists, and a per-thread
//! decommit hysteresis to avoid commit/decommit thrash at page
//! boundaries. Requests above the small-object ceiling fall through to
//! the platform's aligned allocator.
//!
//! The engine lives in [`heap::HeapCore`], generic over a [`os::PageProvider`]
//! so it can run against a real OS mapping ([`os::Os`]) or, under the
//! `testing` feature, an in-memory double ([`os::simulated::Simulated`]).
//! This crate also installs as a [`std::alloc::GlobalAlloc`] via
//! [`Nemalloc`], which is the way most consumers will actually use it.

pub mod freelist;
pub mod heap;
pub mod large;
pub mod margin;
pub mod os;
pub mod pool;
pub mod stats;
pub mod types;

use heap::HeapCore;
use os::Os;
use std::alloc::{GlobalAlloc, Layout};
use std::sync::OnceLock;
use types::{DEFAULT_RESERVE, SMALL_MAX};

static HEAP: OnceLock<HeapCore<Os>> = OnceLock::new();

fn global_heap() -> &'static HeapCore<Os> {
    HEAP.get_or_init(|| {
        HeapCore::new(Os::new(), DEFAULT_RESERVE).expect("failed to reserve the small-object heap")
    })
}

/// Establishes the process-global reservation backing [`allocate`]/
/// [`free`]; a no-op if the heap was already brought up, either by an
/// earlier `init` call or lazily by the first `allocate`/`Nemalloc` use.
pub fn init(reserve_bytes: usize) {
    let _ = HEAP.get_or_init(|| {
        HeapCore::new(Os::new(), reserve_bytes).expect("failed to reserve the small-object heap")
    });
}

/// Routes to the small heap when `size` is at most [`types::SMALL_MAX`]
/// after alignment normalization, otherwise to the large path. Returns
/// null only if both paths fail.
pub fn allocate(size: usize, align: usize) -> *mut u8 {
    let (size, align) = heap::align_request(size, align);
    if size <= SMALL_MAX {
        if let Some(p) = global_heap().allocate_small(size) {
            return p;
        }
        log::debug!("small path exhausted for size={} align={}, falling back to the large path", size, align);
    }
    large::aligned_alloc(size, align)
}

/// Routes by [`heap::HeapCore::is_in_heap`], the sole classifier this
/// crate uses to tell a foreign pointer from one of its own. A null
/// pointer is a no-op.
pub fn free(p: *mut u8) {
    if p.is_null() {
        return;
    }
    if global_heap().is_in_heap(p) {
        global_heap().free_small(p);
    } else {
        large::aligned_free(p);
    }
}

/// The process-global reservation is held for the process's lifetime by
/// design, so there is nothing to release here while [`Nemalloc`] may
/// still be installed as the global allocator; this exists so the
/// public surface matches `init`/`allocate`/`free` with a symmetric
/// teardown entry point. Code that wants a reservation it can actually
/// tear down (tests, short-lived embedders) should construct a
/// [`heap::HeapCore`] directly and call its own `finalize`, as this
/// crate's test suite does.
pub fn finalize() {
    log::debug!("finalize() called; the global reservation is held for process lifetime by design");
}

/// Drop-in [`GlobalAlloc`] over the operations above.
pub struct Nemalloc;

impl Nemalloc {
    /// Brings up the global reservation at its default size if it hasn't
    /// already been initialized by an earlier `init` call or by a prior
    /// `allocate`/`Nemalloc` use. Convenience wrapper over `init` for
    /// embedders happy with [`types::DEFAULT_RESERVE`].
    pub fn init_default() {
        init(DEFAULT_RESERVE);
    }
}

unsafe impl GlobalAlloc for Nemalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        allocate(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }
}
