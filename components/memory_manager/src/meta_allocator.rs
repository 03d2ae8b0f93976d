//! Free-list bookkeeping for the executable pool.
//!
//! The meta allocator never touches memory. It hands out offsets inside a
//! fixed-capacity range, coalesces freed ranges, and keeps a per-page count
//! of live allocations so the caller knows exactly which pages to commit on
//! allocation and which to decommit on free.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::page_reservation::round_up_to;

/// Allocation granularity in bytes. Every request is rounded up to this.
pub const ALLOCATION_GRANULE: usize = 32;

/// A range handed out by [`MetaAllocator::allocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaAllocation {
    /// Offset of the range inside the pool
    pub offset: usize,
    /// Rounded size of the range
    pub size: usize,
    /// Page index ranges whose live count went from zero to one
    pub pages_to_commit: Vec<Range<usize>>,
}

/// Free-list allocator over `[0, capacity)`.
#[derive(Debug)]
pub struct MetaAllocator {
    capacity: usize,
    page_size: usize,
    /// Free ranges keyed by start offset; never adjacent after coalescing
    free: BTreeMap<usize, usize>,
    /// Live allocations touching each page
    page_refs: Vec<u32>,
    committed_pages: usize,
    bytes_allocated: usize,
}

impl MetaAllocator {
    /// Creates an allocator managing `capacity` bytes split in pages of
    /// `page_size`. `capacity` must be a multiple of `page_size`.
    pub fn new(capacity: usize, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        assert_eq!(capacity % page_size, 0, "capacity must be page aligned");

        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }

        MetaAllocator {
            capacity,
            page_size,
            free,
            page_refs: vec![0; capacity / page_size],
            committed_pages: 0,
            bytes_allocated: 0,
        }
    }

    /// Rounds a request up to the allocation granule. Zero-byte requests
    /// still consume one granule.
    pub fn round_up(size: usize) -> usize {
        round_up_to(size.max(1), ALLOCATION_GRANULE)
    }

    /// Returns the managed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of bytes currently handed out.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Returns the number of bytes in pages with at least one live allocation.
    pub fn bytes_committed(&self) -> usize {
        self.committed_pages * self.page_size
    }

    /// Returns the size of the largest free range.
    pub fn largest_free_range(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Carves a range of at least `size` bytes using first fit.
    ///
    /// Returns `None` if no free range is large enough. The pool never grows.
    pub fn allocate(&mut self, size: usize) -> Option<MetaAllocation> {
        let size = Self::round_up(size);
        let (&start, &len) = self.free.iter().find(|(_, &len)| len >= size)?;

        self.free.remove(&start);
        if len > size {
            self.free.insert(start + size, len - size);
        }
        self.bytes_allocated += size;

        let mut pages_to_commit = Vec::new();
        for page in self.page_span(start, size) {
            self.page_refs[page] += 1;
            if self.page_refs[page] == 1 {
                self.committed_pages += 1;
                push_page(&mut pages_to_commit, page);
            }
        }

        Some(MetaAllocation {
            offset: start,
            size,
            pages_to_commit,
        })
    }

    /// Returns `[offset, offset + size)` to the free list.
    ///
    /// Returns the page index ranges that no longer hold any live allocation.
    ///
    /// # Panics
    ///
    /// Panics if the range overlaps memory that is already free.
    pub fn free(&mut self, offset: usize, size: usize) -> Vec<Range<usize>> {
        assert!(offset + size <= self.capacity, "freed range exceeds the pool");
        self.assert_not_free(offset, size);

        let mut start = offset;
        let mut len = size;

        if let Some((&prev_start, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_start + prev_len == offset {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(offset + size)) {
            self.free.remove(&(offset + size));
            len += next_len;
        }
        self.free.insert(start, len);
        self.bytes_allocated -= size;

        let mut pages_to_decommit = Vec::new();
        for page in self.page_span(offset, size) {
            self.page_refs[page] -= 1;
            if self.page_refs[page] == 0 {
                self.committed_pages -= 1;
                push_page(&mut pages_to_decommit, page);
            }
        }
        pages_to_decommit
    }

    fn page_span(&self, offset: usize, size: usize) -> Range<usize> {
        let first = offset / self.page_size;
        let last = (offset + size - 1) / self.page_size;
        first..last + 1
    }

    fn assert_not_free(&self, offset: usize, size: usize) {
        let end = offset + size;
        if let Some((&free_start, &free_len)) = self.free.range(..end).next_back() {
            assert!(
                free_start + free_len <= offset,
                "double free of pool range {offset:#x}+{size:#x}"
            );
        }
    }
}

fn push_page(ranges: &mut Vec<Range<usize>>, page: usize) {
    match ranges.last_mut() {
        Some(last) if last.end == page => last.end = page + 1,
        _ => ranges.push(page..page + 1),
    }
}
