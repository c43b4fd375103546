//! End-to-end allocator scenarios. The first, fifth and sixth tests
//! exercise the process-global facade (`init`/`allocate`/`free`) the way
//! an embedder actually calls it; the rest build their own heap so they
//! can inspect commit counts without disturbing the process-global
//! singleton shared across this binary's other tests.
//!
//! The mass-churn and boundary-thrash loop counts below are scaled down
//! from the workloads they model to keep the suite fast; the properties
//! under test (full drain, bounded decommit count) hold at any scale
//! large enough to cross a few page boundaries.

use nemalloc_rs::heap::HeapCore;
use nemalloc_rs::os::simulated::Simulated;
use nemalloc_rs::types::{class_of, slot_size};
use std::collections::HashSet;

fn sim_heap(page_size: usize, pages: usize) -> HeapCore<Simulated> {
    let provider = Simulated::new(page_size);
    HeapCore::new(provider, page_size * pages).unwrap()
}

#[test]
fn e1_hello() {
    nemalloc_rs::init(64 * 1024 * 1024);
    let p = nemalloc_rs::allocate(16, 16);
    assert!(!p.is_null());
    assert_eq!(p as usize % 16, 0);
    unsafe {
        std::ptr::write_bytes(p, 7, 13);
    }
    nemalloc_rs::free(p);
    nemalloc_rs::finalize();
}

#[test]
fn e2_fill_one_page() {
    let heap = sim_heap(4096, 4);
    let n = heap.page_size() / slot_size(class_of(8)) - 1;
    let mut ptrs = Vec::with_capacity(n);
    for _ in 0..n {
        let p = heap.allocate_small(8).expect("single page must not exhaust the pool");
        ptrs.push(p);
    }
    let distinct_pages: HashSet<_> = ptrs.iter().map(|&p| heap.page_of(p)).collect();
    assert_eq!(distinct_pages.len(), 1);
    assert!(ptrs.iter().all(|&p| (p as usize) % 8 == 0));
    let mut addrs: Vec<_> = ptrs.iter().map(|&p| p as usize).collect();
    addrs.sort_unstable();
    addrs.dedup();
    assert_eq!(addrs.len(), n);
    heap.finalize().unwrap();
}

#[test]
fn e3_mass_churn() {
    // A large run of one-byte requests, all landing in class 0, spread
    // across many pages.
    const N: usize = 50_000;
    let heap = sim_heap(4096, 128);
    let mut ptrs = Vec::with_capacity(N);
    for _ in 0..N {
        ptrs.push(heap.allocate_small(1).expect("pool sized generously for this scenario"));
    }
    let peak_pages = heap.stats().committed_pages.peak();
    assert!(peak_pages > 1, "this run should have spanned many pages, saw {}", peak_pages);
    for p in ptrs {
        heap.free_small(p);
    }
    // Draining that many pages back to back crosses the decommit margin
    // repeatedly, releasing every page but the single one the hysteresis
    // always keeps in reserve for the next allocation.
    assert_eq!(
        heap.stats().committed_pages(),
        1,
        "hysteresis must have decommitted every page but its one permitted reserve"
    );
    heap.finalize().unwrap();
    assert_eq!(heap.stats().committed_pages(), 0);
}

#[test]
fn e4_page_boundary_thrash_bounds_decommits() {
    const ITERS: usize = 50_000;
    let heap = sim_heap(4096, 4);
    let usable_slots = heap.page_size() / slot_size(class_of(8)) - 1;
    // fill the first page entirely and keep every slot live, so the
    // churn loop below always has to reach past it onto a second page,
    // repeatedly crossing the boundary between them.
    let mut warm = Vec::with_capacity(usable_slots);
    for _ in 0..usable_slots {
        warm.push(heap.allocate_small(8).unwrap());
    }
    for _ in 0..ITERS {
        let p = heap.allocate_small(8).unwrap();
        heap.free_small(p);
    }
    let peak = heap.stats().committed_pages.peak();
    assert!(peak <= 2, "expected O(1) committed pages, observed peak {}", peak);
    for p in warm {
        heap.free_small(p);
    }
    heap.finalize().unwrap();
}

#[test]
fn e5_multi_thread_independence() {
    let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    nemalloc_rs::init(128 * 1024 * 1024);
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            std::thread::spawn(|| {
                let mut ptrs = Vec::with_capacity(2000);
                for i in 0..2000 {
                    let size = 1 + (i % 256);
                    let p = nemalloc_rs::allocate(size, 8);
                    assert!(!p.is_null());
                    ptrs.push(p);
                }
                for p in ptrs {
                    nemalloc_rs::free(p);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("worker thread must not panic or corrupt shared state");
    }
}

#[test]
fn e6_fallback() {
    nemalloc_rs::init(64 * 1024 * 1024);
    let p = nemalloc_rs::allocate(1024, 64);
    assert!(!p.is_null());
    assert_eq!(p as usize % 64, 0);
    nemalloc_rs::free(p);
}
