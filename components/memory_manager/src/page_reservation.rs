//! The single virtual memory reservation backing all generated code.
//!
//! The whole pool is reserved inaccessible up front with one guard page on
//! each side. Pages become readable, writable and executable only when the
//! allocator commits them, and go back to the OS (while staying reserved)
//! when the last allocation touching them is freed.

use crate::error::AllocatorError;

/// Fallback page size when the OS does not report one.
const DEFAULT_PAGE_SIZE: usize = 4096;

/// Returns the operating system page size.
pub fn system_page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    DEFAULT_PAGE_SIZE
}

/// A contiguous reserved range of virtual memory with guard pages.
#[derive(Debug)]
pub struct PageReservation {
    /// First usable byte (just past the leading guard page)
    base: *mut u8,
    /// Usable size in bytes, a multiple of the page size
    size: usize,
    /// Size of each guard region
    guard_size: usize,
    page_size: usize,
}

// SAFETY: the reservation is a plain address range. All mutation of the
// memory behind it goes through handles that own disjoint sub-ranges, and the
// allocator serializes commit/decommit behind its lock.
unsafe impl Send for PageReservation {}
// SAFETY: see above; shared access never aliases mutable bytes.
unsafe impl Sync for PageReservation {}

impl PageReservation {
    /// Reserves `size` bytes (rounded up to whole pages) plus guard pages.
    ///
    /// No page is accessible until [`commit`](Self::commit) is called.
    pub fn reserve(size: usize) -> Result<Self, AllocatorError> {
        let page_size = system_page_size();
        let size = round_up_to(size.max(1), page_size);
        let guard_size = page_size;
        let total = size + 2 * guard_size;

        let mapping = sys::reserve(total).map_err(|source| AllocatorError::Reservation {
            size: total,
            source,
        })?;

        // SAFETY: the mapping is `total` bytes long and the guard is within it.
        let base = unsafe { mapping.add(guard_size) };

        Ok(PageReservation {
            base,
            size,
            guard_size,
            page_size,
        })
    }

    /// Returns the address of the first usable byte.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Returns the usable size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the page size this reservation was created with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the size of each guard region.
    pub fn guard_size(&self) -> usize {
        self.guard_size
    }

    /// Returns true if `address` lies in the usable part of the reservation.
    pub fn contains(&self, address: usize) -> bool {
        let start = self.base as usize;
        address >= start && address < start + self.size
    }

    /// Makes the pages covering `[offset, offset + len)` accessible.
    pub fn commit(&self, offset: usize, len: usize) -> Result<(), AllocatorError> {
        self.check_page_range(offset, len);
        // SAFETY: the range was checked to lie inside the usable reservation.
        let ptr = unsafe { self.base.add(offset) };
        sys::commit(ptr, len).map_err(|source| AllocatorError::Commit {
            offset,
            len,
            source,
        })
    }

    /// Tells the OS the pages covering `[offset, offset + len)` are
    /// reclaimable and makes them inaccessible again. The range stays
    /// reserved.
    pub fn decommit(&self, offset: usize, len: usize) -> Result<(), AllocatorError> {
        self.check_page_range(offset, len);
        // SAFETY: the range was checked to lie inside the usable reservation.
        let ptr = unsafe { self.base.add(offset) };
        sys::decommit(ptr, len).map_err(|source| AllocatorError::Decommit {
            offset,
            len,
            source,
        })
    }

    fn check_page_range(&self, offset: usize, len: usize) {
        assert!(
            offset % self.page_size == 0 && len % self.page_size == 0,
            "page range {offset:#x}+{len:#x} is not page aligned"
        );
        assert!(
            offset + len <= self.size,
            "page range {offset:#x}+{len:#x} exceeds reservation of {:#x}",
            self.size
        );
    }
}

impl Drop for PageReservation {
    fn drop(&mut self) {
        // SAFETY: base was produced by reserve() as mapping + guard_size.
        let mapping = unsafe { self.base.sub(self.guard_size) };
        let total = self.size + 2 * self.guard_size;
        if let Err(err) = sys::release(mapping, total) {
            tracing::warn!(error = %err, "failed to release executable pool reservation");
        }
    }
}

/// Rounds `value` up to a multiple of `align` (a power of two).
pub(crate) fn round_up_to(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(unix)]
mod sys {
    use std::io;

    #[cfg(not(target_os = "macos"))]
    const COMMIT_PROTECTION: libc::c_int = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
    // Hardened runtimes refuse RWX without MAP_JIT; keep committed pages RW.
    #[cfg(target_os = "macos")]
    const COMMIT_PROTECTION: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

    pub(super) fn reserve(len: usize) -> io::Result<*mut u8> {
        // SAFETY: anonymous mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                RESERVE_FLAGS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ptr as *mut u8)
    }

    pub(super) fn commit(ptr: *mut u8, len: usize) -> io::Result<()> {
        // SAFETY: caller guarantees the range is inside our own mapping.
        let rc = unsafe { libc::mprotect(ptr as *mut _, len, COMMIT_PROTECTION) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn decommit(ptr: *mut u8, len: usize) -> io::Result<()> {
        // SAFETY: caller guarantees the range is inside our own mapping and
        // that no live handle covers it.
        let rc = unsafe { libc::madvise(ptr as *mut _, len, libc::MADV_DONTNEED) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: same range as above.
        let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_NONE) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn release(ptr: *mut u8, len: usize) -> io::Result<()> {
        // SAFETY: ptr/len describe exactly the mapping created by reserve().
        let rc = unsafe { libc::munmap(ptr as *mut _, len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod sys {
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::io;

    // Without an mmap-style API the pool is an ordinary heap block; commit
    // and decommit only track accounting.
    const ALIGN: usize = 4096;

    pub(super) fn reserve(len: usize) -> io::Result<*mut u8> {
        let layout = Layout::from_size_align(len, ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "allocation failed"));
        }
        Ok(ptr)
    }

    pub(super) fn commit(_ptr: *mut u8, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub(super) fn decommit(_ptr: *mut u8, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub(super) fn release(ptr: *mut u8, len: usize) -> io::Result<()> {
        let layout = Layout::from_size_align(len, ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: ptr was returned by alloc_zeroed with this layout.
        unsafe { dealloc(ptr, layout) };
        Ok(())
    }
}
