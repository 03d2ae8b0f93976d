//! Shared thunks every unit's sites can point at.
//!
//! These are the fixed targets of the call and access protocols: the
//! virtual-call path of unlinked call sites, the host-call return path, and
//! the two slow paths of uncached access sites.

use memory_manager::{AllocationEffort, ExecutableAllocator, ExecutableMemoryHandle, OwnerTag};

use crate::compiled_unit::InitialTargets;
use crate::repatch::SlowPathTargets;

const THUNK_SIZE: usize = 32;
const INT3: u8 = 0xCC;

/// The runtime's shared thunks.
#[derive(Debug)]
pub struct Thunks {
    virtual_call: ExecutableMemoryHandle,
    host_call_return: ExecutableMemoryHandle,
    access_optimize: ExecutableMemoryHandle,
    access_generic: ExecutableMemoryHandle,
}

impl Thunks {
    /// Emits all thunks. Returns `None` if the pool cannot fit them.
    pub fn generate(allocator: &ExecutableAllocator) -> Option<Thunks> {
        let emit = || {
            let mut handle =
                allocator.allocate(THUNK_SIZE, OwnerTag::Thunk, AllocationEffort::MaySucceed)?;
            handle.as_mut_slice().fill(INT3);
            Some(handle)
        };
        Some(Thunks {
            virtual_call: emit()?,
            host_call_return: emit()?,
            access_optimize: emit()?,
            access_generic: emit()?,
        })
    }

    /// Target of call sites that are not linked.
    pub fn virtual_call(&self) -> usize {
        self.virtual_call.start()
    }

    /// Target returned by host dispatch; reads the host return slot.
    pub fn host_call_return(&self) -> usize {
        self.host_call_return.start()
    }

    /// Slow path of access sites that may still cache.
    pub fn access_optimize(&self) -> usize {
        self.access_optimize.start()
    }

    /// Slow path of access sites that gave up.
    pub fn access_generic(&self) -> usize {
        self.access_generic.start()
    }

    pub(crate) fn initial_targets(&self) -> InitialTargets {
        InitialTargets {
            call: self.virtual_call(),
            access: self.access_optimize(),
        }
    }

    pub(crate) fn slow_paths(&self) -> SlowPathTargets {
        SlowPathTargets {
            optimize: self.access_optimize(),
            generic: self.access_generic(),
        }
    }
}
