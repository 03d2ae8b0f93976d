//! Per-site property access metadata and its inline cache.
//!
//! Every property access in compiled code owns a [`StubInfo`]. The cache in
//! it moves one way: virgin, monomorphic, polymorphic, generic. Entries hold
//! their structures weakly, so a cache never keeps a shape alive and entries
//! whose shape has died simply stop matching.

use std::rc::{Rc, Weak};

use arrayvec::ArrayVec;
use core_types::CellId;
use memory_manager::{ObjectHeap, PropertyName, Structure, StructureId};

use crate::code_origin::CodeOrigin;
use crate::repatch::StubRoutine;

/// Hard upper bound on polymorphic list length.
pub const MAX_POLYMORPHIC_CAPACITY: usize = 8;

/// Which store semantics a put uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutKind {
    /// Assignment: honours setters, writability and the prototype chain
    Ordinary,
    /// Definition: writes an own property, ignoring all of the above
    Direct,
}

/// The kind of property access a site performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// `base.name`
    GetById,
    /// `base.name = value`
    PutById {
        /// Ordinary or direct store
        kind: PutKind,
        /// Strict mode code
        strict: bool,
    },
    /// `base[subscript]`
    GetByVal,
    /// `base[subscript] = value`
    PutByVal {
        /// Strict mode code
        strict: bool,
    },
}

impl AccessKind {
    /// Returns true for accesses with a fixed property name.
    pub fn is_by_id(self) -> bool {
        matches!(self, AccessKind::GetById | AccessKind::PutById { .. })
    }

    /// Returns true for stores.
    pub fn is_put(self) -> bool {
        matches!(self, AccessKind::PutById { .. } | AccessKind::PutByVal { .. })
    }

    /// Returns true if the access was compiled from strict mode code.
    pub fn is_strict(self) -> bool {
        match self {
            AccessKind::PutById { strict, .. } | AccessKind::PutByVal { strict } => strict,
            AccessKind::GetById | AccessKind::GetByVal => false,
        }
    }
}

/// The prototypes a cached access looked through, with the structure each
/// had when the entry was made.
///
/// A hit is only valid while every prototype still has that structure: a
/// property added to, or changed on, any of them could shadow the result.
#[derive(Debug, Clone, Default)]
pub struct PrototypeChain(Vec<(CellId, Weak<Structure>)>);

impl PrototypeChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a prototype and its current structure.
    pub fn push(&mut self, prototype: CellId, structure: &Rc<Structure>) {
        self.0.push((prototype, Rc::downgrade(structure)));
    }

    /// Number of prototypes guarded.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no prototype is guarded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if every recorded structure is alive.
    pub fn is_live(&self) -> bool {
        self.0.iter().all(|(_, structure)| structure.strong_count() > 0)
    }

    /// Returns true if every prototype still has its recorded structure.
    pub fn is_intact(&self, heap: &ObjectHeap) -> bool {
        self.0.iter().all(|(cell, expected)| {
            heap.object(*cell)
                .is_some_and(|object| Weak::as_ptr(expected) == Rc::as_ptr(object.structure()))
        })
    }
}

/// What a cache entry does once its structure check passes.
#[derive(Debug, Clone)]
pub enum CachedAccess {
    /// Read an own named slot
    Load {
        /// Slot offset
        offset: u32,
    },
    /// Read a named slot of an object on the prototype chain
    ProtoLoad {
        /// The prototype holding the property
        holder: CellId,
        /// Prototypes from the base's prototype up to and including `holder`
        chain: PrototypeChain,
        /// Slot offset in the holder
        offset: u32,
    },
    /// Overwrite an existing writable own slot
    Replace {
        /// Slot offset
        offset: u32,
    },
    /// Append a new slot and move the object to `next`
    Transition {
        /// Structure after the add
        next: Weak<Structure>,
        /// Offset of the appended slot
        offset: u32,
        /// Prototypes checked for setters and read-only properties
        chain: PrototypeChain,
    },
    /// Read an in-bounds element
    IndexedLoad,
    /// Write an element in bounds or exactly at the end
    IndexedStore,
}

/// One structure check plus the access it guards.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    structure: Weak<Structure>,
    structure_id: StructureId,
    access: CachedAccess,
}

impl CacheEntry {
    /// Creates an entry guarded by `structure`.
    pub fn new(structure: &Rc<Structure>, access: CachedAccess) -> Self {
        Self {
            structure: Rc::downgrade(structure),
            structure_id: structure.id(),
            access,
        }
    }

    /// Id of the guarding structure.
    pub fn structure_id(&self) -> StructureId {
        self.structure_id
    }

    /// The guarded access.
    pub fn access(&self) -> &CachedAccess {
        &self.access
    }

    /// Returns true if `structure` is the guarding structure.
    pub fn matches(&self, structure: &Rc<Structure>) -> bool {
        Weak::as_ptr(&self.structure) == Rc::as_ptr(structure)
    }

    /// Returns true if every structure the entry refers to is still alive.
    pub fn is_live(&self) -> bool {
        let dependency_live = match &self.access {
            CachedAccess::ProtoLoad { chain, .. } => chain.is_live(),
            CachedAccess::Transition { next, chain, .. } => {
                next.strong_count() > 0 && chain.is_live()
            }
            _ => true,
        };
        self.structure.strong_count() > 0 && dependency_live
    }
}

/// Inline cache state of one access site.
#[derive(Debug, Clone, Default)]
pub enum CacheState {
    /// Nothing cached; every access takes the generic path
    #[default]
    Virgin,
    /// One structure cached
    Monomorphic(CacheEntry),
    /// Several structures cached, in first-seen order
    Polymorphic(ArrayVec<CacheEntry, MAX_POLYMORPHIC_CAPACITY>),
    /// Gave up; the site calls the plain generic operation forever
    Generic,
}

/// What [`StubInfo::observe`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// First visit(s); only the seen count changed
    MarkedSeen,
    /// The entry list changed and the stub must be regenerated
    Cached,
    /// Nothing changed
    Unchanged,
    /// The site gave up on caching
    BecameGeneric,
}

/// Metadata for one property access site.
#[derive(Debug)]
pub struct StubInfo {
    kind: AccessKind,
    identifier: Option<PropertyName>,
    origin: CodeOrigin,
    patch_offset: usize,
    capacity: usize,
    visits: u32,
    uncacheable: u32,
    state: CacheState,
    pub(crate) routine: Option<StubRoutine>,
}

impl StubInfo {
    /// Creates virgin metadata for a site.
    pub fn new(
        kind: AccessKind,
        identifier: Option<PropertyName>,
        origin: CodeOrigin,
        patch_offset: usize,
        capacity: usize,
    ) -> Self {
        Self {
            kind,
            identifier,
            origin,
            patch_offset,
            capacity: capacity.clamp(1, MAX_POLYMORPHIC_CAPACITY),
            visits: 0,
            uncacheable: 0,
            state: CacheState::Virgin,
            routine: None,
        }
    }

    /// The access kind.
    pub fn kind(&self) -> AccessKind {
        self.kind
    }

    /// The property name for by-id sites.
    pub fn identifier(&self) -> Option<&PropertyName> {
        self.identifier.as_ref()
    }

    /// Where in bytecode the site is.
    pub fn origin(&self) -> &CodeOrigin {
        &self.origin
    }

    /// Offset of the site's patchable target word in the unit's code.
    pub fn patch_offset(&self) -> usize {
        self.patch_offset
    }

    /// Returns true once the site has been executed at least once.
    pub fn seen(&self) -> bool {
        self.visits > 0
    }

    /// Current cache state.
    pub fn state(&self) -> &CacheState {
        &self.state
    }

    /// Returns true if the site gave up on caching.
    pub fn is_generic(&self) -> bool {
        matches!(self.state, CacheState::Generic)
    }

    /// The generated stub routine, if one is installed.
    pub fn routine(&self) -> Option<&StubRoutine> {
        self.routine.as_ref()
    }

    /// Cached entries in first-seen order.
    pub fn entries(&self) -> &[CacheEntry] {
        match &self.state {
            CacheState::Virgin | CacheState::Generic => &[],
            CacheState::Monomorphic(entry) => std::slice::from_ref(entry),
            CacheState::Polymorphic(entries) => entries.as_slice(),
        }
    }

    /// Finds the live entry guarded by `structure`.
    pub fn lookup(&self, structure: &Rc<Structure>) -> Option<&CacheEntry> {
        self.entries()
            .iter()
            .find(|entry| entry.matches(structure) && entry.is_live())
    }

    /// Records one slow-path execution.
    ///
    /// `entry` is the cacheable access the slow path just performed, or
    /// `None` if it was not cacheable. Visits below `threshold` only mark the
    /// site as seen. Uncacheable accesses count against the same capacity as
    /// cached shapes.
    pub fn observe(&mut self, entry: Option<CacheEntry>, threshold: u32) -> CacheUpdate {
        if self.is_generic() {
            return CacheUpdate::Unchanged;
        }
        let visits_before = self.visits;
        self.visits = self.visits.saturating_add(1);
        if visits_before < threshold {
            return CacheUpdate::MarkedSeen;
        }

        let Some(entry) = entry else {
            self.uncacheable += 1;
            if self.uncacheable as usize > self.capacity {
                self.give_up();
                return CacheUpdate::BecameGeneric;
            }
            return CacheUpdate::Unchanged;
        };

        match &mut self.state {
            CacheState::Virgin => {
                self.state = CacheState::Monomorphic(entry);
                CacheUpdate::Cached
            }
            CacheState::Monomorphic(existing) => {
                if existing.structure_id == entry.structure_id || !existing.is_live() {
                    *existing = entry;
                    CacheUpdate::Cached
                } else if self.capacity < 2 {
                    self.give_up();
                    CacheUpdate::BecameGeneric
                } else {
                    let mut entries = ArrayVec::new();
                    entries.push(existing.clone());
                    entries.push(entry);
                    self.state = CacheState::Polymorphic(entries);
                    CacheUpdate::Cached
                }
            }
            CacheState::Polymorphic(entries) => {
                entries.retain(|existing| existing.is_live());
                if let Some(existing) = entries
                    .iter_mut()
                    .find(|existing| existing.structure_id == entry.structure_id)
                {
                    *existing = entry;
                    CacheUpdate::Cached
                } else if entries.len() < self.capacity {
                    entries.push(entry);
                    CacheUpdate::Cached
                } else {
                    self.give_up();
                    CacheUpdate::BecameGeneric
                }
            }
            CacheState::Generic => CacheUpdate::Unchanged,
        }
    }

    /// Drops entries whose structures have died. Returns how many went.
    pub fn prune_dead_entries(&mut self) -> usize {
        match &mut self.state {
            CacheState::Polymorphic(entries) => {
                let before = entries.len();
                entries.retain(|entry| entry.is_live());
                before - entries.len()
            }
            _ => 0,
        }
    }

    fn give_up(&mut self) {
        self.state = CacheState::Generic;
        self.routine = None;
    }
}
