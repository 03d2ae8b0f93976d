//! Property access operations.
//!
//! Each access kind has a generic operation, which performs the access and
//! never touches the site's cache, and an optimizing operation, which
//! performs the same access and then feeds what it saw to the site's
//! [`StubInfo`](crate::stub_info::StubInfo) so the site can be repatched.
//! Access sites start out pointing at the optimizing operation and are moved
//! to the generic one when their cache gives up.

use std::rc::Rc;

use core_types::{CellId, JsError, Value};
use memory_manager::{HeapCell, ObjectHeap, PropertyAttributes, PropertyName, Structure};

use crate::context::{Callee, VmContext};
use crate::operations::OperationSite;
use crate::repatch::repatch_access_site;
use crate::stub_info::{AccessKind, CacheEntry, CacheUpdate, CachedAccess, PrototypeChain, PutKind};

/// Longest prototype chain a cache entry will guard.
const MAX_CACHED_CHAIN: usize = 16;

/// Result of one slow-path access.
struct Access {
    value: Value,
    cache: Option<CacheEntry>,
}

impl Access {
    fn uncached(value: Value) -> Self {
        Access { value, cache: None }
    }

    fn cached(value: Value, structure: &Rc<Structure>, access: CachedAccess) -> Self {
        Access {
            value,
            cache: Some(CacheEntry::new(structure, access)),
        }
    }
}

/// Collects the prototypes of `base`, stopping after `last` if given.
///
/// Returns `None` if the chain is too long to guard.
fn prototype_chain(heap: &ObjectHeap, base: CellId, last: Option<CellId>) -> Option<PrototypeChain> {
    let mut chain = PrototypeChain::new();
    let mut current = heap.object(base)?.structure().prototype();
    while let Some(id) = current {
        if chain.len() == MAX_CACHED_CHAIN {
            return None;
        }
        let object = heap.object(id)?;
        chain.push(id, object.structure());
        if Some(id) == last {
            break;
        }
        current = object.structure().prototype();
    }
    Some(chain)
}

/// Calls a getter or setter.
///
/// Only host functions can run here; script accessors need the interpreter.
fn call_accessor(
    ctx: &mut VmContext,
    function: Value,
    this: Value,
    arguments: &[Value],
) -> Result<Value, JsError> {
    match ctx.resolve_callee(function) {
        Some(Callee::Host(id)) => ctx.invoke_host(id, this, arguments),
        Some(Callee::Script(id)) => Err(JsError::internal(format!(
            "script accessor {id} cannot run from compiled code"
        ))),
        None => Err(JsError::type_error(format!(
            "accessor {} is not a function",
            function.type_name()
        ))),
    }
}

fn accessor_pair(ctx: &VmContext, slot_value: Value) -> Result<memory_manager::GetterSetter, JsError> {
    slot_value
        .as_cell()
        .and_then(|cell| ctx.heap().getter_setter(cell))
        .ok_or_else(|| JsError::internal("accessor slot without a getter/setter pair"))
}

/// Converts a subscript to a property name.
fn property_key(heap: &ObjectHeap, subscript: Value) -> PropertyName {
    match subscript.as_cell().and_then(|cell| heap.string(cell)) {
        Some(string) => Rc::clone(string),
        None => subscript.to_string().into(),
    }
}

// Get

fn get_by_name(ctx: &mut VmContext, base: Value, name: &PropertyName) -> Result<Access, JsError> {
    ctx.counters_mut().generic_lookups += 1;
    if base.is_undefined_or_null() {
        return Err(JsError::type_error(format!(
            "Cannot read properties of {base} (reading '{name}')"
        )));
    }
    let Some(cell) = base.as_cell() else {
        return Ok(Access::uncached(Value::Undefined));
    };
    if let Some(HeapCell::String(string)) = ctx.heap().cell(cell) {
        let value = if &**name == "length" {
            Value::Smi(string.chars().count() as i32)
        } else {
            Value::Undefined
        };
        return Ok(Access::uncached(value));
    }

    let Some(slot) = ctx.heap().lookup_property(cell, name) else {
        return Ok(Access::uncached(Value::Undefined));
    };
    if slot.entry.attributes.accessor {
        let pair = accessor_pair(ctx, slot.value)?;
        if pair.getter == Value::Undefined {
            return Ok(Access::uncached(Value::Undefined));
        }
        return call_accessor(ctx, pair.getter, base, &[]).map(Access::uncached);
    }

    let heap = ctx.heap();
    let Some(structure) = heap.structure_of(cell) else {
        return Ok(Access::uncached(slot.value));
    };
    if slot.depth == 0 {
        return Ok(Access::cached(
            slot.value,
            &structure,
            CachedAccess::Load {
                offset: slot.entry.offset,
            },
        ));
    }
    Ok(match prototype_chain(heap, cell, Some(slot.holder)) {
        Some(chain) => Access::cached(
            slot.value,
            &structure,
            CachedAccess::ProtoLoad {
                holder: slot.holder,
                chain,
                offset: slot.entry.offset,
            },
        ),
        None => Access::uncached(slot.value),
    })
}

fn get_by_value(ctx: &mut VmContext, base: Value, subscript: Value) -> Result<Access, JsError> {
    if base.is_undefined_or_null() {
        return Err(JsError::type_error(format!(
            "Cannot read properties of {base} (reading '{}')",
            property_key(ctx.heap(), subscript)
        )));
    }
    if let (Some(cell), Some(index)) = (base.as_cell(), subscript.as_array_index()) {
        let heap = ctx.heap();
        match heap.cell(cell) {
            Some(HeapCell::Object(object)) if object.has_indexed_storage() => {
                if let Some(value) = heap.element(cell, index) {
                    let structure = Rc::clone(object.structure());
                    return Ok(Access::cached(value, &structure, CachedAccess::IndexedLoad));
                }
            }
            Some(HeapCell::String(string)) => {
                let character = string.chars().nth(index as usize);
                let value = match character {
                    Some(c) => Value::Cell(ctx.heap_mut().allocate_string(c.encode_utf8(&mut [0; 4]))),
                    None => Value::Undefined,
                };
                return Ok(Access::uncached(value));
            }
            _ => {}
        }
    }
    let name = property_key(ctx.heap(), subscript);
    let access = get_by_name(ctx, base, &name)?;
    Ok(Access::uncached(access.value))
}

// Put

fn read_only_error(name: &str) -> JsError {
    JsError::type_error(format!("Cannot assign to read only property '{name}' of object"))
}

fn put_by_name(
    ctx: &mut VmContext,
    base: Value,
    name: &PropertyName,
    value: Value,
    kind: PutKind,
    strict: bool,
) -> Result<Option<CacheEntry>, JsError> {
    ctx.counters_mut().generic_lookups += 1;
    if base.is_undefined_or_null() {
        return Err(JsError::type_error(format!(
            "Cannot set properties of {base} (setting '{name}')"
        )));
    }
    let Some(cell) = base.as_cell().filter(|&cell| ctx.heap().object(cell).is_some()) else {
        if strict {
            return Err(JsError::type_error(format!(
                "Cannot create property '{name}' on {}",
                base.type_name()
            )));
        }
        return Ok(None);
    };

    if kind == PutKind::Ordinary {
        if let Some(slot) = ctx.heap().lookup_property(cell, name) {
            let attributes = slot.entry.attributes;
            if attributes.accessor {
                let pair = accessor_pair(ctx, slot.value)?;
                if pair.setter == Value::Undefined {
                    if strict {
                        return Err(JsError::type_error(format!(
                            "Cannot set property '{name}' which has only a getter"
                        )));
                    }
                    return Ok(None);
                }
                call_accessor(ctx, pair.setter, base, &[value])?;
                return Ok(None);
            }
            if !attributes.writable {
                if strict {
                    return Err(read_only_error(name));
                }
                return Ok(None);
            }
            if slot.depth == 0 {
                let structure = ctx.heap().structure_of(cell);
                ctx.heap_mut().write_slot(cell, slot.entry.offset, value);
                return Ok(structure.map(|structure| {
                    CacheEntry::new(
                        &structure,
                        CachedAccess::Replace {
                            offset: slot.entry.offset,
                        },
                    )
                }));
            }
        }
    }

    let Some(before) = ctx.heap().structure_of(cell) else {
        return Ok(None);
    };
    let chain = match kind {
        PutKind::Ordinary => prototype_chain(ctx.heap(), cell, None),
        PutKind::Direct => Some(PrototypeChain::new()),
    };
    let Some(offset) =
        ctx.heap_mut()
            .put_direct(cell, Rc::clone(name), value, PropertyAttributes::DEFAULT)
    else {
        return Ok(None);
    };
    let Some(after) = ctx.heap().structure_of(cell) else {
        return Ok(None);
    };

    if Rc::ptr_eq(&before, &after) {
        return Ok(Some(CacheEntry::new(&before, CachedAccess::Replace { offset })));
    }
    if after.slot_count() != before.slot_count() + 1 {
        // Attributes changed in place; the new shape is not shared.
        return Ok(None);
    }
    Ok(chain.map(|chain| {
        CacheEntry::new(
            &before,
            CachedAccess::Transition {
                next: Rc::downgrade(&after),
                offset,
                chain,
            },
        )
    }))
}

fn put_by_value(
    ctx: &mut VmContext,
    base: Value,
    subscript: Value,
    value: Value,
    strict: bool,
) -> Result<Option<CacheEntry>, JsError> {
    if base.is_undefined_or_null() {
        return Err(JsError::type_error(format!(
            "Cannot set properties of {base} (setting '{}')",
            property_key(ctx.heap(), subscript)
        )));
    }
    let max_growth = ctx.config().max_array_growth;
    if let (Some(cell), Some(index)) = (base.as_cell(), subscript.as_array_index()) {
        let indexed = ctx
            .heap()
            .object(cell)
            .filter(|object| object.has_indexed_storage())
            .map(|object| (Rc::clone(object.structure()), object.elements().len()));
        if let Some((structure, length)) = indexed {
            let index_usize = index as usize;
            if index_usize <= length {
                ctx.heap_mut().put_element(cell, index, value);
                return Ok(Some(CacheEntry::new(&structure, CachedAccess::IndexedStore)));
            }
            if index < max_growth {
                ctx.heap_mut().put_element(cell, index, value);
                return Ok(None);
            }
        }
    }
    let name = property_key(ctx.heap(), subscript);
    put_by_name(ctx, base, &name, value, PutKind::Ordinary, strict)?;
    Ok(None)
}

// Cached execution

/// Runs a cached get. `None` means the entry no longer applies and the
/// slow path must run.
pub(crate) fn run_cached_get(
    heap: &ObjectHeap,
    entry: &CacheEntry,
    base: CellId,
    index: Option<u32>,
) -> Option<Value> {
    match entry.access() {
        CachedAccess::Load { offset } => heap.read_slot(base, *offset),
        CachedAccess::ProtoLoad {
            holder,
            chain,
            offset,
        } => {
            if !chain.is_intact(heap) {
                return None;
            }
            heap.read_slot(*holder, *offset)
        }
        CachedAccess::IndexedLoad => heap.element(base, index?),
        CachedAccess::Replace { .. }
        | CachedAccess::Transition { .. }
        | CachedAccess::IndexedStore => None,
    }
}

/// Runs a cached put. Returns false if the slow path must run.
pub(crate) fn run_cached_put(
    heap: &mut ObjectHeap,
    entry: &CacheEntry,
    base: CellId,
    index: Option<u32>,
    value: Value,
) -> bool {
    match entry.access() {
        CachedAccess::Replace { offset } => heap.write_slot(base, *offset, value),
        CachedAccess::Transition {
            next,
            offset,
            chain,
        } => {
            let Some(next) = next.upgrade() else {
                return false;
            };
            if !chain.is_intact(heap) {
                return false;
            }
            heap.transition_and_append(base, next, value) == Some(*offset)
        }
        CachedAccess::IndexedStore => {
            let Some(index) = index else {
                return false;
            };
            let in_range = heap
                .element_count(base)
                .is_some_and(|length| index as usize <= length);
            in_range && heap.put_element(base, index, value)
        }
        CachedAccess::Load { .. } | CachedAccess::ProtoLoad { .. } | CachedAccess::IndexedLoad => {
            false
        }
    }
}

// Site plumbing

fn site_kind(ctx: &VmContext, site: OperationSite) -> Result<(AccessKind, Option<PropertyName>), JsError> {
    ctx.code_block_for_address(site.return_address.0)
        .and_then(|unit| unit.stub_info(site.return_address))
        .map(|info| (info.kind(), info.identifier().cloned()))
        .ok_or_else(|| JsError::internal(format!("no access site at {}", site.return_address)))
}

fn site_identifier(ctx: &VmContext, site: OperationSite) -> Result<PropertyName, JsError> {
    site_kind(ctx, site)?
        .1
        .ok_or_else(|| JsError::internal(format!("access site at {} has no name", site.return_address)))
}

/// Feeds one slow-path result to the site's cache and repatches the site.
fn update_cache(ctx: &mut VmContext, site: OperationSite, entry: Option<CacheEntry>) {
    let threshold = ctx.config().stub_repatch_threshold;
    let allocator = ctx.allocator().clone();
    let slow_paths = ctx.thunks().slow_paths();
    let Some(block) = ctx
        .code_block_for_address(site.return_address.0)
        .map(|unit| unit.id())
    else {
        return;
    };
    let Some(unit) = ctx.code_block_mut(block) else {
        return;
    };
    let Some(info) = unit.stub_info_mut(site.return_address) else {
        return;
    };
    let update = info.observe(entry, threshold);
    let entries = info.entries().len();
    repatch_access_site(&allocator, unit, site.return_address, update, slow_paths);

    match update {
        CacheUpdate::Cached => {
            ctx.counters_mut().repatches += 1;
            tracing::debug!(return_address = %site.return_address, entries, "repatched access site");
        }
        CacheUpdate::BecameGeneric => {
            ctx.counters_mut().repatches += 1;
            tracing::debug!(return_address = %site.return_address, "access site became generic");
        }
        CacheUpdate::MarkedSeen | CacheUpdate::Unchanged => {}
    }
}

// Operations

/// `base.name` without caching.
pub fn operation_get_by_id(ctx: &mut VmContext, site: OperationSite, base: Value) -> Result<Value, JsError> {
    let name = site_identifier(ctx, site)?;
    Ok(get_by_name(ctx, base, &name)?.value)
}

/// `base.name`, updating the site's cache.
pub fn operation_get_by_id_optimize(
    ctx: &mut VmContext,
    site: OperationSite,
    base: Value,
) -> Result<Value, JsError> {
    let name = site_identifier(ctx, site)?;
    let access = get_by_name(ctx, base, &name)?;
    update_cache(ctx, site, access.cache);
    Ok(access.value)
}

fn put_by_id_generic(
    ctx: &mut VmContext,
    site: OperationSite,
    base: Value,
    value: Value,
    kind: PutKind,
    strict: bool,
) -> Result<(), JsError> {
    let name = site_identifier(ctx, site)?;
    put_by_name(ctx, base, &name, value, kind, strict).map(|_| ())
}

/// Strict `base.name = value` without caching.
pub fn operation_put_by_id_strict(
    ctx: &mut VmContext,
    site: OperationSite,
    base: Value,
    value: Value,
) -> Result<(), JsError> {
    put_by_id_generic(ctx, site, base, value, PutKind::Ordinary, true)
}

/// Sloppy `base.name = value` without caching.
pub fn operation_put_by_id_non_strict(
    ctx: &mut VmContext,
    site: OperationSite,
    base: Value,
    value: Value,
) -> Result<(), JsError> {
    put_by_id_generic(ctx, site, base, value, PutKind::Ordinary, false)
}

/// Strict own-property definition without caching.
pub fn operation_put_by_id_direct_strict(
    ctx: &mut VmContext,
    site: OperationSite,
    base: Value,
    value: Value,
) -> Result<(), JsError> {
    put_by_id_generic(ctx, site, base, value, PutKind::Direct, true)
}

/// Sloppy own-property definition without caching.
pub fn operation_put_by_id_direct_non_strict(
    ctx: &mut VmContext,
    site: OperationSite,
    base: Value,
    value: Value,
) -> Result<(), JsError> {
    put_by_id_generic(ctx, site, base, value, PutKind::Direct, false)
}

/// Any put-by-id, with the site's own strictness and store kind, updating
/// the site's cache.
pub fn operation_put_by_id_optimize(
    ctx: &mut VmContext,
    site: OperationSite,
    base: Value,
    value: Value,
) -> Result<(), JsError> {
    let (kind, name) = site_kind(ctx, site)?;
    let AccessKind::PutById { kind, strict } = kind else {
        return Err(JsError::internal(format!(
            "access site at {} is not a put-by-id",
            site.return_address
        )));
    };
    let name = name.ok_or_else(|| JsError::internal("put-by-id site without a name"))?;
    let entry = put_by_name(ctx, base, &name, value, kind, strict)?;
    update_cache(ctx, site, entry);
    Ok(())
}

/// `base[subscript]` without caching.
pub fn operation_get_by_val(
    ctx: &mut VmContext,
    _site: OperationSite,
    base: Value,
    subscript: Value,
) -> Result<Value, JsError> {
    Ok(get_by_value(ctx, base, subscript)?.value)
}

/// `base[subscript]`, updating the site's cache.
pub fn operation_get_by_val_optimize(
    ctx: &mut VmContext,
    site: OperationSite,
    base: Value,
    subscript: Value,
) -> Result<Value, JsError> {
    let access = get_by_value(ctx, base, subscript)?;
    update_cache(ctx, site, access.cache);
    Ok(access.value)
}

/// Strict `base[subscript] = value` without caching.
pub fn operation_put_by_val_strict(
    ctx: &mut VmContext,
    _site: OperationSite,
    base: Value,
    subscript: Value,
    value: Value,
) -> Result<(), JsError> {
    put_by_value(ctx, base, subscript, value, true).map(|_| ())
}

/// Sloppy `base[subscript] = value` without caching.
pub fn operation_put_by_val_non_strict(
    ctx: &mut VmContext,
    _site: OperationSite,
    base: Value,
    subscript: Value,
    value: Value,
) -> Result<(), JsError> {
    put_by_value(ctx, base, subscript, value, false).map(|_| ())
}

/// `base[subscript] = value` with the site's strictness, updating the
/// site's cache.
pub fn operation_put_by_val_optimize(
    ctx: &mut VmContext,
    site: OperationSite,
    base: Value,
    subscript: Value,
    value: Value,
) -> Result<(), JsError> {
    let (kind, _) = site_kind(ctx, site)?;
    let entry = put_by_value(ctx, base, subscript, value, kind.is_strict())?;
    update_cache(ctx, site, entry);
    Ok(())
}

/// `subscript in base`.
pub fn operation_has_property(
    ctx: &mut VmContext,
    _site: OperationSite,
    base: Value,
    subscript: Value,
) -> Result<bool, JsError> {
    let heap = ctx.heap();
    let Some(cell) = base.as_cell().filter(|&cell| heap.object(cell).is_some()) else {
        return Err(JsError::type_error(format!(
            "Cannot use 'in' operator to search for '{}' in {base}",
            property_key(heap, subscript)
        )));
    };
    ctx.counters_mut().generic_lookups += 1;
    let heap = ctx.heap();
    if let Some(index) = subscript.as_array_index() {
        if heap.element(cell, index).is_some() {
            return Ok(true);
        }
    }
    Ok(heap.lookup_property(cell, &property_key(heap, subscript)).is_some())
}
