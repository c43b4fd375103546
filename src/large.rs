//! The large-object path: a thin pass-through to the platform's
//! aligned-malloc/aligned-free for anything above the small heap's
//! ceiling. Its only contract with the small heap is that `free(p)`
//! needs nothing but `p` to know how to release it, the same way
//! [`crate::heap::HeapCore::is_in_heap`] classifies a pointer with no
//! accompanying size.
//!
//! Unix gets this for free from `posix_memalign`/`free`. Windows has no
//! direct equivalent in the Win32 API (only the CRT does, and this crate
//! doesn't link the CRT's `_aligned_malloc` directly), so the same
//! over-allocate-and-record-the-true-base trick `posix_memalign`
//! performs internally is implemented by hand over `HeapAlloc`/`HeapFree`.

use core::mem::size_of;
use core::ptr;

/// Allocate at least `size` bytes aligned to `align` (a power of two).
/// Returns null on failure; the caller is the only path left once this
/// one fails, so there's nothing further to fall back to.
#[cfg(unix)]
pub fn aligned_alloc(size: usize, align: usize) -> *mut u8 {
    let mut out: *mut libc::c_void = ptr::null_mut();
    // posix_memalign requires align to be a multiple of sizeof(void*);
    // callers already clamp align up to at least UNIT (8), which holds
    // on every target this crate supports.
    let align = align.max(size_of::<usize>());
    // SAFETY: `out` is a valid destination, `align` is a power of two
    // multiple of pointer size, `size` is whatever the caller requested.
    let rc = unsafe { libc::posix_memalign(&mut out, align, size.max(1)) };
    if rc != 0 {
        return ptr::null_mut();
    }
    out as *mut u8
}

#[cfg(unix)]
pub fn aligned_free(ptr: *mut u8) {
    // SAFETY: `ptr` came from `aligned_alloc`'s `posix_memalign` call.
    unsafe { libc::free(ptr as *mut libc::c_void) };
}

#[cfg(windows)]
pub fn aligned_alloc(size: usize, align: usize) -> *mut u8 {
    use winapi::um::heapapi::{GetProcessHeap, HeapAlloc};

    // SAFETY: no preconditions; GetProcessHeap can return null early in
    // process startup, checked below.
    let heap = unsafe { GetProcessHeap() };
    if heap.is_null() {
        return ptr::null_mut();
    }
    let header = size_of::<usize>();
    let total = match size.max(1).checked_add(align).and_then(|n| n.checked_add(header)) {
        Some(n) => n,
        None => return ptr::null_mut(),
    };
    // SAFETY: `heap` is non-null, `total` is a checked, non-zero length.
    let raw = unsafe { HeapAlloc(heap, 0, total) } as usize;
    if raw == 0 {
        return ptr::null_mut();
    }
    let aligned = (raw + header + align - 1) & !(align - 1);
    // SAFETY: `aligned - size_of::<usize>()` lies within the allocation
    // made above, room for it was reserved via `header` in `total`.
    unsafe {
        ((aligned as *mut usize).sub(1)).write(raw);
    }
    aligned as *mut u8
}

#[cfg(windows)]
pub fn aligned_free(ptr: *mut u8) {
    use winapi::um::heapapi::{GetProcessHeap, HeapFree};

    // SAFETY: `ptr` came from `aligned_alloc`, which stored the true
    // allocation base in the `usize` immediately before it.
    let raw = unsafe { ((ptr as *mut usize).sub(1)).read() };
    unsafe {
        HeapFree(GetProcessHeap(), 0, raw as *mut _);
    }
}
