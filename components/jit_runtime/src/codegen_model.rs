//! The generated side of calls and property accesses.
//!
//! Compiled code does very little on its own: it loads a site's patch slot,
//! jumps where the slot points, and calls an operation when that is a slow
//! path. The functions here perform those same steps against a
//! [`VmContext`], so call linking and the inline caches are driven exactly
//! as machine code would drive them.

use core_types::{JsError, Value};
use thiserror::Error;

use crate::call_frame::{CallFrame, FrameIndex};
use crate::compiled_unit::ReturnAddress;
use crate::context::{Callee, VmContext};
use crate::function::CodeSpecializationKind;
use crate::operations::{OperationId, OperationOutcome, OperationSite};
use crate::property_access::{run_cached_get, run_cached_put};
use crate::stub_info::{AccessKind, CacheEntry, PutKind};

/// An operation returned with the exception slot set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exception pending in frame {}", .frame.0)]
pub struct PendingException {
    /// Frame the exception was raised for
    pub frame: FrameIndex,
    /// Site of the raising operation; `None` if it was raised while
    /// setting up `frame`
    pub site: Option<ReturnAddress>,
}

/// What happened at a call site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallOutcome {
    /// Control is now in compiled code running in this frame
    Entered(FrameIndex),
    /// A host function ran to completion
    Returned(Value),
}

/// Where the search for a handler ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Landing {
    /// Frame that catches
    pub frame: FrameIndex,
    /// Catch entry address
    pub catch_entry: usize,
}

fn raise(ctx: &mut VmContext, error: JsError, frame: FrameIndex, site: Option<ReturnAddress>) -> PendingException {
    ctx.throw(error);
    PendingException { frame, site }
}

fn missing_site(site: ReturnAddress) -> JsError {
    JsError::internal(format!("no compiled site at {site}"))
}

/// Calls `callee` from the call site at `site` in `caller`'s code.
///
/// A linked site jumps straight in when the callee matches and the linked
/// entry is the one this argument count needs; a short argument list must
/// enter through the callee's arity check. Anything else goes through the
/// site's slow path: the link operation while the slot still points at the
/// virtual-call thunk, the virtual-call operation once the site is linked.
pub fn execute_call(
    ctx: &mut VmContext,
    caller: FrameIndex,
    site: ReturnAddress,
    callee: Value,
    this: Value,
    arguments: Vec<Value>,
) -> Result<CallOutcome, PendingException> {
    let Some((kind, origin, slot, linked)) = ctx.code_block_for_address(site.0).and_then(|unit| {
        let info = unit.call_link_info(site)?;
        let slot = unit.read_patch_slot(info.patch_offset())?;
        Some((info.kind(), info.origin().clone(), slot, info.linked().copied()))
    }) else {
        return Err(raise(ctx, missing_site(site), caller, Some(site)));
    };

    let argument_count = u32::try_from(arguments.len()).unwrap_or(u32::MAX);
    let frame = match ctx.frames_mut().push(CallFrame::new(callee, this, arguments)) {
        Ok(frame) => frame,
        Err(error) => return Err(raise(ctx, error, caller, Some(site))),
    };

    if let Some(linked) = linked.filter(|linked| linked.target == slot) {
        let entry = ctx
            .code_block(linked.code_block)
            .map(|unit| unit.entry_for(argument_count));
        if entry == Some(linked.target)
            && ctx.resolve_callee(callee) == Some(Callee::Script(linked.callee))
        {
            if let Some(entered) = ctx.frames_mut().get_mut(frame) {
                entered.code_block = Some(linked.code_block);
                entered.call_site = Some(origin);
            }
            ctx.set_top_call_frame(frame);
            ctx.counters_mut().linked_call_hits += 1;
            return Ok(CallOutcome::Entered(frame));
        }
    }

    let operation = match (slot == ctx.thunks().virtual_call(), kind) {
        (true, CodeSpecializationKind::Call) => OperationId::LinkCall,
        (true, CodeSpecializationKind::Construct) => OperationId::LinkConstruct,
        (false, CodeSpecializationKind::Call) => OperationId::VirtualCall,
        (false, CodeSpecializationKind::Construct) => OperationId::VirtualConstruct,
    };
    let operation_site = OperationSite {
        frame,
        return_address: site,
    };
    let outcome = ctx.call_operation(operation, operation_site, &[]);
    if outcome.exception_pending {
        return Err(PendingException { frame, site: None });
    }

    if outcome.code_ptr().0 == ctx.thunks().host_call_return() {
        let result = ctx.call_operation(OperationId::GetHostCallReturnValue, operation_site, &[]);
        ctx.leave_frame(frame);
        ctx.set_top_call_frame(caller);
        return Ok(CallOutcome::Returned(result.value().unwrap_or(Value::Undefined)));
    }
    Ok(CallOutcome::Entered(frame))
}

/// Returns from compiled code running in `frame`, handing `value` back to
/// its caller.
pub fn return_from_call(ctx: &mut VmContext, frame: FrameIndex, value: Value) -> Value {
    if let Some(left) = ctx.leave_frame(frame) {
        if let Some(caller) = left.caller {
            ctx.set_top_call_frame(caller);
        }
    }
    value
}

/// Searches for a handler for `pending` and unwinds to it.
///
/// Returns `None` if nothing catches; the exception stays pending.
pub fn unwind(ctx: &mut VmContext, pending: PendingException) -> Option<Landing> {
    let (operation, return_address) = match pending.site {
        Some(site) => (OperationId::LookupExceptionHandler, site),
        None => (OperationId::LookupExceptionHandlerFromCaller, ReturnAddress(0)),
    };
    let site = OperationSite {
        frame: pending.frame,
        return_address,
    };
    let handler = ctx.call_operation(operation, site, &[]).handler();
    let (frame, catch_entry) = handler.unpack(ctx.allocator().base_address())?;
    Some(Landing { frame, catch_entry })
}

// Property access sites

enum SlotTarget {
    Generic,
    Optimize,
    Routine(Option<CacheEntry>),
}

/// Reads the patch slot of the access site at `site` and, if it points at a
/// stub routine, runs the routine's structure checks against `base`.
fn probe_access_site(ctx: &VmContext, site: ReturnAddress, base: Value) -> Option<(AccessKind, SlotTarget)> {
    let unit = ctx.code_block_for_address(site.0)?;
    let info = unit.stub_info(site)?;
    let slot = unit.read_patch_slot(info.patch_offset())?;

    let thunks = ctx.thunks();
    let target = if slot == thunks.access_generic() {
        SlotTarget::Generic
    } else if slot == thunks.access_optimize() {
        SlotTarget::Optimize
    } else {
        let hit = info
            .routine()
            .filter(|routine| routine.start() == slot)
            .zip(base.as_cell().and_then(|cell| ctx.heap().structure_of(cell)))
            .and_then(|(routine, structure)| {
                let entry = info.entries().get(routine.probe(structure.id())?)?;
                entry.matches(&structure).then(|| entry.clone())
            });
        SlotTarget::Routine(hit)
    };
    Some((info.kind(), target))
}

fn finish(outcome: OperationOutcome, frame: FrameIndex, site: ReturnAddress) -> Result<OperationOutcome, PendingException> {
    if outcome.exception_pending {
        Err(PendingException {
            frame,
            site: Some(site),
        })
    } else {
        Ok(outcome)
    }
}

fn count_hit(ctx: &mut VmContext) {
    ctx.counters_mut().inline_cache_hits += 1;
}

/// Executes `base.name` at the access site `site`.
pub fn execute_get_by_id(
    ctx: &mut VmContext,
    frame: FrameIndex,
    site: ReturnAddress,
    base: Value,
) -> Result<Value, PendingException> {
    let Some((_, target)) = probe_access_site(ctx, site, base) else {
        return Err(raise(ctx, missing_site(site), frame, Some(site)));
    };
    let operation = match target {
        SlotTarget::Generic => OperationId::GetById,
        SlotTarget::Optimize | SlotTarget::Routine(None) => OperationId::GetByIdOptimize,
        SlotTarget::Routine(Some(entry)) => {
            let hit = base
                .as_cell()
                .and_then(|cell| run_cached_get(ctx.heap(), &entry, cell, None));
            if let Some(value) = hit {
                count_hit(ctx);
                return Ok(value);
            }
            OperationId::GetByIdOptimize
        }
    };
    let outcome = ctx.call_operation(operation, OperationSite { frame, return_address: site }, &[base.encode().bits()]);
    finish(outcome, frame, site).map(|outcome| outcome.value().unwrap_or(Value::Undefined))
}

fn generic_put_by_id(kind: AccessKind) -> OperationId {
    match kind {
        AccessKind::PutById {
            kind: PutKind::Direct,
            strict: true,
        } => OperationId::PutByIdDirectStrict,
        AccessKind::PutById {
            kind: PutKind::Direct,
            strict: false,
        } => OperationId::PutByIdDirectNonStrict,
        AccessKind::PutById {
            kind: PutKind::Ordinary,
            strict: false,
        } => OperationId::PutByIdNonStrict,
        _ => OperationId::PutByIdStrict,
    }
}

/// Executes `base.name = value` at the access site `site`.
pub fn execute_put_by_id(
    ctx: &mut VmContext,
    frame: FrameIndex,
    site: ReturnAddress,
    base: Value,
    value: Value,
) -> Result<(), PendingException> {
    let Some((kind, target)) = probe_access_site(ctx, site, base) else {
        return Err(raise(ctx, missing_site(site), frame, Some(site)));
    };
    let operation = match target {
        SlotTarget::Generic => generic_put_by_id(kind),
        SlotTarget::Optimize | SlotTarget::Routine(None) => OperationId::PutByIdOptimize,
        SlotTarget::Routine(Some(entry)) => {
            let hit = base
                .as_cell()
                .is_some_and(|cell| run_cached_put(ctx.heap_mut(), &entry, cell, None, value));
            if hit {
                count_hit(ctx);
                return Ok(());
            }
            OperationId::PutByIdOptimize
        }
    };
    let operands = [base.encode().bits(), value.encode().bits()];
    let outcome = ctx.call_operation(operation, OperationSite { frame, return_address: site }, &operands);
    finish(outcome, frame, site).map(drop)
}

/// Executes `base[subscript]` at the access site `site`.
pub fn execute_get_by_val(
    ctx: &mut VmContext,
    frame: FrameIndex,
    site: ReturnAddress,
    base: Value,
    subscript: Value,
) -> Result<Value, PendingException> {
    let Some((_, target)) = probe_access_site(ctx, site, base) else {
        return Err(raise(ctx, missing_site(site), frame, Some(site)));
    };
    let operation = match target {
        SlotTarget::Generic => OperationId::GetByVal,
        SlotTarget::Optimize | SlotTarget::Routine(None) => OperationId::GetByValOptimize,
        SlotTarget::Routine(Some(entry)) => {
            let hit = base.as_cell().zip(subscript.as_array_index()).and_then(|(cell, index)| {
                run_cached_get(ctx.heap(), &entry, cell, Some(index))
            });
            if let Some(value) = hit {
                count_hit(ctx);
                return Ok(value);
            }
            OperationId::GetByValOptimize
        }
    };
    let operands = [base.encode().bits(), subscript.encode().bits()];
    let outcome = ctx.call_operation(operation, OperationSite { frame, return_address: site }, &operands);
    finish(outcome, frame, site).map(|outcome| outcome.value().unwrap_or(Value::Undefined))
}

/// Executes `base[subscript] = value` at the access site `site`.
pub fn execute_put_by_val(
    ctx: &mut VmContext,
    frame: FrameIndex,
    site: ReturnAddress,
    base: Value,
    subscript: Value,
    value: Value,
) -> Result<(), PendingException> {
    let Some((kind, target)) = probe_access_site(ctx, site, base) else {
        return Err(raise(ctx, missing_site(site), frame, Some(site)));
    };
    let generic = if kind.is_strict() {
        OperationId::PutByValStrict
    } else {
        OperationId::PutByValNonStrict
    };
    let operation = match target {
        SlotTarget::Generic => generic,
        SlotTarget::Optimize | SlotTarget::Routine(None) => OperationId::PutByValOptimize,
        SlotTarget::Routine(Some(entry)) => {
            let hit = base.as_cell().zip(subscript.as_array_index()).is_some_and(|(cell, index)| {
                run_cached_put(ctx.heap_mut(), &entry, cell, Some(index), value)
            });
            if hit {
                count_hit(ctx);
                return Ok(());
            }
            OperationId::PutByValOptimize
        }
    };
    let operands = [
        base.encode().bits(),
        subscript.encode().bits(),
        value.encode().bits(),
    ];
    let outcome = ctx.call_operation(operation, OperationSite { frame, return_address: site }, &operands);
    finish(outcome, frame, site).map(drop)
}
