//! Fixed-size executable memory pool.
//!
//! One [`ExecutableAllocator`] owns one [`PageReservation`] for the lifetime
//! of a VM instance. All generated code, stub routines and thunks are carved
//! out of it through [`ExecutableMemoryHandle`]s. The pool never grows: when
//! it runs dry a soft request returns `None`, and a hard request runs the
//! registered reclaimer once and retries before giving up fatally.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use core_types::{CodeBlockId, FunctionId};
use parking_lot::Mutex;

use crate::error::AllocatorError;
use crate::meta_allocator::{MetaAllocator, ALLOCATION_GRANULE};
use crate::page_reservation::PageReservation;

/// Default pool size for the target architecture.
///
/// 64-bit x86 has address space to spare; ARM targets get smaller pools
/// to stay within direct branch range of each other.
pub const fn default_pool_size() -> usize {
    if cfg!(target_arch = "x86_64") {
        1024 * 1024 * 1024
    } else if cfg!(target_arch = "aarch64") {
        128 * 1024 * 1024
    } else {
        16 * 1024 * 1024
    }
}

/// What a caller wants to happen when the pool cannot satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationEffort {
    /// Return `None`; the caller keeps running without the code.
    MaySucceed,
    /// Reclaim once and retry; exhaustion after that is fatal.
    MustSucceed,
}

/// Who owns an allocation. Used for logging and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerTag {
    /// Machine code of a compiled unit
    CompiledCode(FunctionId),
    /// A polymorphic inline cache stub routine
    StubRoutine(CodeBlockId),
    /// A shared thunk (virtual call, host return, arity fixup)
    Thunk,
    /// Anything else, e.g. test allocations
    Other(&'static str),
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStatistics {
    /// Size of the reservation; constant after initialization
    pub bytes_reserved: usize,
    /// Bytes in pages currently backed by physical memory
    pub bytes_committed: usize,
    /// Bytes logically handed out to live handles
    pub bytes_allocated: usize,
}

/// A reclamation callback run before a hard allocation is retried.
pub type Reclaimer = Box<dyn FnMut() + Send>;

struct AllocatorInner {
    reservation: PageReservation,
    /// Guards the free list and the protection of every page it tracks;
    /// pages are only committed or decommitted while it is held.
    meta: Mutex<MetaAllocator>,
    reclaimer: Mutex<Option<Reclaimer>>,
    commit_failure_is_fatal: bool,
    #[cfg(test)]
    failing_commits: std::sync::atomic::AtomicUsize,
}

/// Why a single allocation attempt failed.
enum AttemptError {
    Exhausted,
    Commit(AllocatorError),
}

impl AllocatorInner {
    fn release(&self, offset: usize, size: usize) {
        let mut meta = self.meta.lock();
        let pages = meta.free(offset, size);
        self.decommit_pages(&pages);
    }

    fn commit_pages(&self, pages: &Range<usize>) -> Result<(), AllocatorError> {
        let page_size = self.reservation.page_size();
        let (offset, len) = (pages.start * page_size, pages.len() * page_size);
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            let injected = self
                .failing_commits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if injected.is_ok() {
                return Err(AllocatorError::Commit {
                    offset,
                    len,
                    source: std::io::Error::new(std::io::ErrorKind::OutOfMemory, "commit refused"),
                });
            }
        }
        self.reservation.commit(offset, len)
    }

    fn decommit_pages(&self, pages: &[Range<usize>]) {
        let page_size = self.reservation.page_size();
        for range in pages {
            let result = self
                .reservation
                .decommit(range.start * page_size, range.len() * page_size);
            if let Err(err) = result {
                tracing::warn!(error = %err, "failed to decommit executable pages");
            }
        }
    }
}

/// The executable memory allocator for one VM instance.
///
/// Cloning is cheap and yields another reference to the same pool.
///
/// # Example
///
/// ```
/// use memory_manager::{AllocationEffort, ExecutableAllocator, OwnerTag};
///
/// let allocator = ExecutableAllocator::initialize(64 * 1024).unwrap();
/// let handle = allocator
///     .allocate(100, OwnerTag::Other("doc"), AllocationEffort::MaySucceed)
///     .unwrap();
/// assert_eq!(handle.size_in_bytes(), 128);
/// assert_eq!(allocator.statistics().bytes_allocated, 128);
/// ```
#[derive(Clone)]
pub struct ExecutableAllocator {
    inner: Arc<AllocatorInner>,
}

impl ExecutableAllocator {
    /// Reserves a pool of `pool_size` bytes, rounded up to whole pages.
    pub fn initialize(pool_size: usize) -> Result<Self, AllocatorError> {
        if pool_size < ALLOCATION_GRANULE {
            return Err(AllocatorError::PoolTooSmall(pool_size));
        }
        let reservation = PageReservation::reserve(pool_size)?;
        let meta = MetaAllocator::new(reservation.size(), reservation.page_size());

        tracing::info!(
            bytes_reserved = reservation.size(),
            base = format_args!("{:#x}", reservation.base() as usize),
            "executable pool initialized"
        );

        Ok(ExecutableAllocator {
            inner: Arc::new(AllocatorInner {
                reservation,
                meta: Mutex::new(meta),
                reclaimer: Mutex::new(None),
                commit_failure_is_fatal: cfg!(debug_assertions),
                #[cfg(test)]
                failing_commits: std::sync::atomic::AtomicUsize::new(0),
            }),
        })
    }

    /// Installs the callback run when a hard allocation finds the pool full.
    pub fn set_reclaimer(&self, reclaimer: impl FnMut() + Send + 'static) {
        *self.inner.reclaimer.lock() = Some(Box::new(reclaimer));
    }

    /// Allocates `size` bytes, rounded up to the allocation granule.
    ///
    /// # Panics
    ///
    /// Aborts with a panic if `size` exceeds the whole pool, or if a
    /// [`AllocationEffort::MustSucceed`] request still cannot be satisfied
    /// after reclamation. A page commit failure is fatal in debug builds and
    /// for hard requests; a soft request in a release build gets `None`.
    pub fn allocate(
        &self,
        size: usize,
        owner: OwnerTag,
        effort: AllocationEffort,
    ) -> Option<ExecutableMemoryHandle> {
        let rounded = MetaAllocator::round_up(size);
        let reserved = self.inner.reservation.size();
        if rounded > reserved {
            crash(format_args!(
                "executable allocation of {size} bytes exceeds the {reserved} byte pool"
            ));
        }

        match self.try_allocate(size, owner) {
            Ok(handle) => return Some(handle),
            Err(AttemptError::Commit(err)) => return self.commit_failed(err, effort),
            Err(AttemptError::Exhausted) => {}
        }

        match effort {
            AllocationEffort::MaySucceed => {
                tracing::warn!(size, ?owner, "executable pool exhausted; allocation failed");
                None
            }
            AllocationEffort::MustSucceed => {
                self.reclaim();
                match self.try_allocate(size, owner) {
                    Ok(handle) => Some(handle),
                    Err(AttemptError::Commit(err)) => self.commit_failed(err, effort),
                    Err(AttemptError::Exhausted) => crash(format_args!(
                        "executable pool exhausted: cannot allocate {size} bytes for {owner:?} \
                         after reclamation"
                    )),
                }
            }
        }
    }

    fn commit_failed(
        &self,
        err: AllocatorError,
        effort: AllocationEffort,
    ) -> Option<ExecutableMemoryHandle> {
        if self.inner.commit_failure_is_fatal || effort == AllocationEffort::MustSucceed {
            crash(format_args!("{err}"));
        }
        tracing::warn!(error = %err, "page commit failed; allocation failed");
        None
    }

    /// Runs the registered reclaimer, if any.
    pub fn reclaim(&self) {
        let mut reclaimer = self.inner.reclaimer.lock();
        if let Some(reclaim) = reclaimer.as_mut() {
            let before = self.inner.meta.lock().bytes_allocated();
            reclaim();
            let after = self.inner.meta.lock().bytes_allocated();
            tracing::debug!(freed = before.saturating_sub(after), "executable pool reclaimed");
        }
    }

    fn try_allocate(
        &self,
        size: usize,
        owner: OwnerTag,
    ) -> Result<ExecutableMemoryHandle, AttemptError> {
        let mut meta = self.inner.meta.lock();
        let allocation = meta.allocate(size).ok_or(AttemptError::Exhausted)?;

        for range in &allocation.pages_to_commit {
            if let Err(err) = self.inner.commit_pages(range) {
                let pages = meta.free(allocation.offset, allocation.size);
                self.inner.decommit_pages(&pages);
                return Err(AttemptError::Commit(err));
            }
        }
        drop(meta);

        Ok(ExecutableMemoryHandle {
            inner: Arc::clone(&self.inner),
            offset: allocation.offset,
            size: allocation.size,
            owner,
        })
    }

    /// Returns current pool usage.
    pub fn statistics(&self) -> AllocatorStatistics {
        let meta = self.inner.meta.lock();
        AllocatorStatistics {
            bytes_reserved: self.inner.reservation.size(),
            bytes_committed: meta.bytes_committed(),
            bytes_allocated: meta.bytes_allocated(),
        }
    }

    /// Returns `allocated / (reserved - allocated)`, clamped to at least 1.0.
    ///
    /// A completely full pool reports infinity.
    pub fn memory_pressure(&self) -> f64 {
        let stats = self.statistics();
        let available = stats.bytes_reserved - stats.bytes_allocated;
        if available == 0 {
            return f64::INFINITY;
        }
        (stats.bytes_allocated as f64 / available as f64).max(1.0)
    }

    /// Returns true if `address` lies inside the pool.
    pub fn contains(&self, address: usize) -> bool {
        self.inner.reservation.contains(address)
    }

    /// Returns the address of the first byte of the pool.
    pub fn base_address(&self) -> usize {
        self.inner.reservation.base() as usize
    }
}

impl fmt::Debug for ExecutableAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableAllocator")
            .field("statistics", &self.statistics())
            .finish()
    }
}

/// Exclusive ownership of a range inside the executable pool.
///
/// Dropping the handle returns the range to the free list.
pub struct ExecutableMemoryHandle {
    inner: Arc<AllocatorInner>,
    offset: usize,
    size: usize,
    owner: OwnerTag,
}

impl ExecutableMemoryHandle {
    /// Returns the absolute address of the first byte.
    pub fn start(&self) -> usize {
        self.inner.reservation.base() as usize + self.offset
    }

    /// Returns the absolute address one past the last byte.
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    /// Returns the (rounded) size of the range.
    pub fn size_in_bytes(&self) -> usize {
        self.size
    }

    /// Returns the offset of the range inside the pool.
    pub fn offset_in_pool(&self) -> usize {
        self.offset
    }

    /// Returns the owner recorded at allocation time.
    pub fn owner(&self) -> OwnerTag {
        self.owner
    }

    /// Returns true if `address` lies inside this range.
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start() && address < self.end()
    }

    /// Returns the bytes of the range.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the range is committed and exclusively owned by this handle.
        unsafe { std::slice::from_raw_parts(self.start() as *const u8, self.size) }
    }

    /// Returns the bytes of the range mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the range is committed and exclusively owned by this handle,
        // and `&mut self` guarantees no other borrow of it is live.
        unsafe { std::slice::from_raw_parts_mut(self.start() as *mut u8, self.size) }
    }

    /// Copies `bytes` into the range at `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), AllocatorError> {
        self.check_bounds(offset, bytes.len())?;
        self.as_mut_slice()[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads `len` bytes from the range at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8], AllocatorError> {
        self.check_bounds(offset, len)?;
        Ok(&self.as_slice()[offset..offset + len])
    }

    /// Writes a little-endian machine word at `offset`.
    pub fn write_word(&mut self, offset: usize, word: u64) -> Result<(), AllocatorError> {
        self.write(offset, &word.to_le_bytes())
    }

    /// Reads a little-endian machine word at `offset`.
    pub fn read_word(&self, offset: usize) -> Result<u64, AllocatorError> {
        let bytes = self.read(offset, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), AllocatorError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(AllocatorError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }
}

impl Drop for ExecutableMemoryHandle {
    fn drop(&mut self) {
        self.inner.release(self.offset, self.size);
    }
}

impl fmt::Debug for ExecutableMemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableMemoryHandle")
            .field("start", &format_args!("{:#x}", self.start()))
            .field("size", &self.size)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Logs and aborts on an allocator invariant violation.
#[cold]
fn crash(message: fmt::Arguments<'_>) -> ! {
    tracing::error!("{}", message);
    panic!("{}", message);
}
