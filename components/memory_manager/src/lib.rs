//! Memory Manager - executable memory pool and object shapes
//!
//! This component provides:
//! - A fixed-size, guard-paged virtual memory reservation for generated code
//! - A free-list meta allocator with 32-byte granularity and page accounting
//! - Exclusive handles over pool ranges that return their bytes on drop
//! - Structures (immutable object shapes) with cached transitions
//! - The object heap consumed by the inline caches

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod executable_allocator;
pub mod meta_allocator;
pub mod object;
pub mod page_reservation;
pub mod structure;

// Re-export main types
pub use error::AllocatorError;
pub use executable_allocator::{
    default_pool_size, AllocationEffort, AllocatorStatistics, ExecutableAllocator,
    ExecutableMemoryHandle, OwnerTag, Reclaimer,
};
pub use meta_allocator::{MetaAllocation, MetaAllocator, ALLOCATION_GRANULE};
pub use object::{GetterSetter, HeapCell, JsObject, ObjectHeap, ObjectKind, PropertySlot};
pub use page_reservation::{system_page_size, PageReservation};
pub use structure::{
    IndexingType, PropertyAttributes, PropertyEntry, PropertyName, Structure, StructureId,
    StructureRegistry,
};
