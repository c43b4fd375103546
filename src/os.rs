//! The page-provider capability: reserve/commit/decommit/release a
//! range of virtual memory, plus a page-size query. This is the only
//! seam the core touches the operating system through; everything above
//! this module is portable.

use log::warn;

/// Failure from a [`PageProvider`] call. Wraps the platform's native
/// error representation instead of asserting, so a failed `commit` can
/// be surfaced as an ordinary allocation failure rather than a panic.
#[derive(Debug, Clone, Copy)]
pub enum ProviderError {
    #[cfg(unix)]
    Errno(errno::Errno),
    #[cfg(windows)]
    Win32(u32),
}

impl core::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            #[cfg(unix)]
            ProviderError::Errno(e) => write!(f, "os call failed: {}", e),
            #[cfg(windows)]
            ProviderError::Win32(code) => write!(f, "os call failed: error {}", code),
        }
    }
}

/// A capability the core consumes to manage its reservation. Bound to
/// `Send + Sync` because a single provider instance is shared by every
/// thread touching the heap.
pub trait PageProvider: Send + Sync {
    /// Reserve `bytes` of address space with no backing. `bytes` is
    /// already a multiple of [`PageProvider::page_size`].
    fn reserve(&self, bytes: usize) -> Result<*mut u8, ProviderError>;

    /// Make one page, `page_size` bytes starting at `page_base`,
    /// readable and writable. Idempotent within a reservation.
    fn commit(&self, page_base: *mut u8, page_size: usize) -> Result<(), ProviderError>;

    /// Return the physical backing of one page. The core never reads
    /// from a decommitted page afterwards.
    fn decommit(&self, page_base: *mut u8, page_size: usize) -> Result<(), ProviderError>;

    /// Unmap an entire reservation obtained from `reserve`.
    fn release(&self, base: *mut u8, bytes: usize) -> Result<(), ProviderError>;

    /// The OS page granularity. Assumed constant for process lifetime.
    fn page_size(&self) -> usize;

    /// Reserve and commit a block of memory for the heap's own
    /// bookkeeping (the page-index pool). Deliberately bypasses any
    /// global allocator installed over this crate, since the page pool
    /// backing a `#[global_allocator]` can't itself be a `Vec` without
    /// risking recursion back into the allocator on first use.
    fn alloc_metadata(&self, bytes: usize) -> Result<*mut u8, ProviderError> {
        let size = crate::types::align_up(bytes.max(1), self.page_size());
        let base = self.reserve(size)?;
        self.commit(base, size)?;
        Ok(base)
    }

    /// Release memory obtained from [`PageProvider::alloc_metadata`].
    fn free_metadata(&self, ptr: *mut u8, bytes: usize) -> Result<(), ProviderError> {
        let size = crate::types::align_up(bytes.max(1), self.page_size());
        self.release(ptr, size)
    }
}

/// The real, OS-backed provider.
#[derive(Debug, Default)]
pub struct Os {
    page_size: usize,
}

impl Os {
    pub fn new() -> Self {
        Os { page_size: query_page_size() }
    }
}

#[cfg(unix)]
fn query_page_size() -> usize {
    // SAFETY: `sysconf` with a well-known name is always safe to call.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 { n as usize } else { 4096 }
}

#[cfg(windows)]
fn query_page_size() -> usize {
    use winapi::um::sysinfoapi::{GetSystemInfo, LPSYSTEM_INFO};
    let mut info: winapi::um::sysinfoapi::SYSTEM_INFO = unsafe { core::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info as LPSYSTEM_INFO) };
    if info.dwPageSize > 0 { info.dwPageSize as usize } else { 4096 }
}

#[cfg(unix)]
impl PageProvider for Os {
    fn reserve(&self, bytes: usize) -> Result<*mut u8, ProviderError> {
        // SAFETY: anonymous, non-executable mapping of caller-checked length.
        let p = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                bytes,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            let e = errno::errno();
            warn!("mmap(PROT_NONE, {} bytes) failed: {}", bytes, e);
            return Err(ProviderError::Errno(e));
        }
        Ok(p as *mut u8)
    }

    fn commit(&self, page_base: *mut u8, page_size: usize) -> Result<(), ProviderError> {
        // SAFETY: `page_base`/`page_size` describe a page inside a
        // reservation this provider returned from `reserve`.
        let rc = unsafe { libc::mprotect(page_base as *mut _, page_size, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            let e = errno::errno();
            warn!("mprotect(commit) at {:p} failed: {}", page_base, e);
            return Err(ProviderError::Errno(e));
        }
        Ok(())
    }

    fn decommit(&self, page_base: *mut u8, page_size: usize) -> Result<(), ProviderError> {
        // SAFETY: see `commit`. MADV_DONTNEED drops the physical pages;
        // PROT_NONE ensures a stray read traps instead of silently
        // reading stale or zeroed data.
        unsafe {
            let rc = libc::madvise(page_base as *mut _, page_size, libc::MADV_DONTNEED);
            if rc != 0 {
                let e = errno::errno();
                warn!("madvise(DONTNEED) at {:p} failed: {}", page_base, e);
                return Err(ProviderError::Errno(e));
            }
            let rc = libc::mprotect(page_base as *mut _, page_size, libc::PROT_NONE);
            if rc != 0 {
                let e = errno::errno();
                warn!("mprotect(decommit) at {:p} failed: {}", page_base, e);
                return Err(ProviderError::Errno(e));
            }
        }
        Ok(())
    }

    fn release(&self, base: *mut u8, bytes: usize) -> Result<(), ProviderError> {
        // SAFETY: `base`/`bytes` is a reservation this provider made.
        let rc = unsafe { libc::munmap(base as *mut _, bytes) };
        if rc != 0 {
            let e = errno::errno();
            warn!("munmap at {:p} ({} bytes) failed: {}", base, bytes, e);
            return Err(ProviderError::Errno(e));
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(windows)]
impl PageProvider for Os {
    fn reserve(&self, bytes: usize) -> Result<*mut u8, ProviderError> {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_RESERVE, PAGE_NOACCESS};
        // SAFETY: requesting a fresh reservation at an OS-chosen address.
        let p = unsafe { VirtualAlloc(core::ptr::null_mut(), bytes, MEM_RESERVE, PAGE_NOACCESS) };
        if p.is_null() {
            let e = last_error();
            warn!("VirtualAlloc(MEM_RESERVE, {} bytes) failed: {}", bytes, e);
            return Err(ProviderError::Win32(e));
        }
        Ok(p as *mut u8)
    }

    fn commit(&self, page_base: *mut u8, page_size: usize) -> Result<(), ProviderError> {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, PAGE_READWRITE};
        // SAFETY: `page_base` lies inside a reservation from `reserve`.
        let p = unsafe { VirtualAlloc(page_base as *mut _, page_size, MEM_COMMIT, PAGE_READWRITE) };
        if p.is_null() {
            let e = last_error();
            warn!("VirtualAlloc(MEM_COMMIT) at {:p} failed: {}", page_base, e);
            return Err(ProviderError::Win32(e));
        }
        Ok(())
    }

    fn decommit(&self, page_base: *mut u8, page_size: usize) -> Result<(), ProviderError> {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_DECOMMIT;
        // SAFETY: see `commit`.
        let ok = unsafe { VirtualFree(page_base as *mut _, page_size, MEM_DECOMMIT) };
        if ok == 0 {
            let e = last_error();
            warn!("VirtualFree(MEM_DECOMMIT) at {:p} failed: {}", page_base, e);
            return Err(ProviderError::Win32(e));
        }
        Ok(())
    }

    fn release(&self, base: *mut u8, _bytes: usize) -> Result<(), ProviderError> {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_RELEASE;
        // SAFETY: `base` is the address `reserve` returned; Windows
        // requires releasing the whole reservation with size 0.
        let ok = unsafe { VirtualFree(base as *mut _, 0, MEM_RELEASE) };
        if ok == 0 {
            let e = last_error();
            warn!("VirtualFree(MEM_RELEASE) at {:p} failed: {}", base, e);
            return Err(ProviderError::Win32(e));
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(windows)]
fn last_error() -> u32 {
    unsafe { winapi::um::errhandlingapi::GetLastError() }
}

/// A page provider that tracks committed pages in memory instead of
/// touching the OS, used by the test suite against [`crate::heap::HeapCore`]
/// so its allocator behavior can be checked without mapping real virtual
/// memory.
#[cfg(any(test, feature = "testing"))]
pub mod simulated {
    use super::{PageProvider, ProviderError};
    use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// `page_size` is configurable so tests can exercise small
    /// reservations without allocating real gigabytes of backing memory.
    pub struct Simulated {
        page_size: usize,
        committed: Mutex<HashSet<usize>>,
    }

    impl Simulated {
        pub fn new(page_size: usize) -> Self {
            Simulated { page_size, committed: Mutex::new(HashSet::new()) }
        }

        pub fn committed_count(&self) -> usize {
            self.committed.lock().unwrap().len()
        }
    }

    impl PageProvider for Simulated {
        fn reserve(&self, bytes: usize) -> Result<*mut u8, ProviderError> {
            let n = crate::types::align_up(bytes, self.page_size) / self.page_size;
            let layout = Layout::from_size_align(n * self.page_size, self.page_size).unwrap();
            // SAFETY: non-zero size layout built above; the host
            // allocator backs this range for real, standing in for the
            // OS reservation a real provider would make.
            let p = unsafe { alloc_zeroed(layout) };
            assert!(!p.is_null(), "host allocator rejected simulated reservation");
            Ok(p)
        }

        fn commit(&self, page_base: *mut u8, _page_size: usize) -> Result<(), ProviderError> {
            self.committed.lock().unwrap().insert(page_base as usize);
            Ok(())
        }

        fn decommit(&self, page_base: *mut u8, _page_size: usize) -> Result<(), ProviderError> {
            let was_committed = self.committed.lock().unwrap().remove(&(page_base as usize));
            assert!(was_committed, "decommit of a page that was never committed");
            Ok(())
        }

        fn release(&self, base: *mut u8, bytes: usize) -> Result<(), ProviderError> {
            let n = crate::types::align_up(bytes, self.page_size) / self.page_size;
            let layout = Layout::from_size_align(n * self.page_size, self.page_size).unwrap();
            // SAFETY: `base`/`bytes` describe an allocation `reserve` made with this layout.
            unsafe { dealloc(base, layout) };
            Ok(())
        }

        fn page_size(&self) -> usize {
            self.page_size
        }

        fn alloc_metadata(&self, bytes: usize) -> Result<*mut u8, ProviderError> {
            let layout = Layout::from_size_align(bytes.max(1), core::mem::align_of::<u32>()).unwrap();
            // SAFETY: non-zero size, valid alignment.
            let p = unsafe { alloc(layout) };
            assert!(!p.is_null());
            Ok(p)
        }

        fn free_metadata(&self, ptr: *mut u8, bytes: usize) -> Result<(), ProviderError> {
            let layout = Layout::from_size_align(bytes.max(1), core::mem::align_of::<u32>()).unwrap();
            // SAFETY: matches the layout used in `alloc_metadata`.
            unsafe { dealloc(ptr, layout) };
            Ok(())
        }
    }
}
