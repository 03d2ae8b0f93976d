//! Code patching: call-site targets and access stub routines.
//!
//! Every call or access site reads its target from a word-sized patch slot
//! inside the unit's code. Linking, unlinking and cache updates rewrite that
//! word. Stub routines are the generated structure-check chains a cached
//! access site jumps to; they live in the executable pool next to the code
//! that uses them.

use std::fmt;

use core_types::CodeBlockId;
use memory_manager::{
    AllocationEffort, AllocatorError, ExecutableAllocator, ExecutableMemoryHandle, OwnerTag,
    StructureId,
};

use crate::compiled_unit::{CompiledUnit, ReturnAddress};
use crate::stub_info::{CacheEntry, CacheUpdate};

const HEADER_SIZE: usize = 8;
const CHECK_SIZE: usize = 8;

/// A generated structure-check chain for one access site.
///
/// Layout: a word holding the entry count, then one word per entry holding
/// the structure id it checks for.
pub struct StubRoutine {
    code: ExecutableMemoryHandle,
    checks: usize,
}

impl StubRoutine {
    /// Emits a routine checking `entries` in order.
    ///
    /// Returns `None` if the pool has no room; the site then keeps using the
    /// slow path.
    pub fn generate(
        allocator: &ExecutableAllocator,
        owner: CodeBlockId,
        entries: &[CacheEntry],
    ) -> Option<StubRoutine> {
        let size = HEADER_SIZE + CHECK_SIZE * entries.len();
        let mut code = allocator.allocate(
            size,
            OwnerTag::StubRoutine(owner),
            AllocationEffort::MaySucceed,
        )?;
        match emit_checks(&mut code, entries) {
            Ok(()) => Some(StubRoutine {
                code,
                checks: entries.len(),
            }),
            Err(err) => {
                tracing::warn!(error = %err, "failed to emit stub routine");
                None
            }
        }
    }

    /// Address the site's patch slot points at.
    pub fn start(&self) -> usize {
        self.code.start()
    }

    /// Number of structure checks in the routine.
    pub fn check_count(&self) -> usize {
        self.checks
    }

    /// Runs the check chain. Returns the index of the matching entry.
    pub fn probe(&self, structure: StructureId) -> Option<usize> {
        let count = self.code.read_word(0).ok()? as usize;
        (0..count).find(|&i| {
            self.code
                .read_word(HEADER_SIZE + i * CHECK_SIZE)
                .map(|word| word == u64::from(structure.0))
                .unwrap_or(false)
        })
    }
}

impl fmt::Debug for StubRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubRoutine")
            .field("start", &format_args!("{:#x}", self.code.start()))
            .field("checks", &self.checks)
            .finish()
    }
}

fn emit_checks(
    code: &mut ExecutableMemoryHandle,
    entries: &[CacheEntry],
) -> Result<(), AllocatorError> {
    code.write_word(0, entries.len() as u64)?;
    for (i, entry) in entries.iter().enumerate() {
        code.write_word(
            HEADER_SIZE + i * CHECK_SIZE,
            u64::from(entry.structure_id().0),
        )?;
    }
    Ok(())
}

/// Slow-path entry points an access site can be pointed back at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlowPathTargets {
    /// Slow path that also updates the cache
    pub optimize: usize,
    /// Slow path that never caches
    pub generic: usize,
}

/// Applies a cache update to the access site at `return_address`.
///
/// `Cached` regenerates the stub routine and points the site at it, freeing
/// the previous routine. If the pool has no room the site goes back to the
/// optimizing slow path. `BecameGeneric` points the site at the plain
/// generic operation for good.
pub(crate) fn repatch_access_site(
    allocator: &ExecutableAllocator,
    unit: &mut CompiledUnit,
    return_address: ReturnAddress,
    update: CacheUpdate,
    targets: SlowPathTargets,
) {
    let owner = unit.id();
    let Some(info) = unit.stub_info_mut(return_address) else {
        return;
    };
    let patch_offset = info.patch_offset();

    let target = match update {
        CacheUpdate::Cached => {
            let routine = StubRoutine::generate(allocator, owner, info.entries());
            let target = routine
                .as_ref()
                .map_or(targets.optimize, StubRoutine::start);
            // The old routine is released here, after the new one exists.
            info.routine = routine;
            target
        }
        CacheUpdate::BecameGeneric => {
            info.routine = None;
            targets.generic
        }
        CacheUpdate::MarkedSeen | CacheUpdate::Unchanged => return,
    };

    if let Err(err) = unit.write_patch_slot(patch_offset, target) {
        tracing::warn!(error = %err, "failed to repatch access site");
    }
}
