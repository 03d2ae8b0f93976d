//! Exception handler lookup.
//!
//! A throw is located by the return address of the operation that raised
//! it. Its code origin is searched from the innermost inlined frame out to
//! the machine frame, then the search continues in each calling machine
//! frame at the call site that frame was called from. The first covering
//! handler wins.

use core_types::CodeBlockId;

use crate::call_frame::FrameIndex;
use crate::code_origin::{CodeOrigin, HandlerInfo};
use crate::compiled_unit::CompiledUnit;
use crate::context::VmContext;
use crate::operations::OperationSite;

/// Where execution resumes after a throw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerTarget {
    /// Machine frame that catches
    pub frame: FrameIndex,
    /// Unit running in that frame
    pub code_block: CodeBlockId,
    /// The covering handler
    pub handler: HandlerInfo,
}

/// A handler target packed into one word for the trampoline.
///
/// The high half holds the frame index plus one, the low half the catch
/// entry's offset from the executable pool base. Zero means no handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedHandler(pub u64);

impl PackedHandler {
    /// No handler was found.
    pub const NONE: PackedHandler = PackedHandler(0);

    /// Packs a frame and catch entry address. `None` if the entry lies
    /// below `pool_base` or too far above it.
    pub fn pack(frame: FrameIndex, catch_entry: usize, pool_base: usize) -> Option<PackedHandler> {
        let offset = u32::try_from(catch_entry.checked_sub(pool_base)?).ok()?;
        let frame = u64::from(frame.0) + 1;
        Some(PackedHandler((frame << 32) | u64::from(offset)))
    }

    /// Returns true if no handler was found.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Recovers the frame and absolute catch entry address.
    pub fn unpack(self, pool_base: usize) -> Option<(FrameIndex, usize)> {
        let frame = (self.0 >> 32).checked_sub(1)?;
        let offset = (self.0 & u64::from(u32::MAX)) as usize;
        Some((FrameIndex(frame as u32), pool_base + offset))
    }
}

/// Searches one unit's handlers for `origin`, walking out through its
/// inlined frames.
pub fn find_handler_in_unit(unit: &CompiledUnit, origin: &CodeOrigin) -> Option<HandlerInfo> {
    let mut offset = origin.bytecode_offset;
    let mut inline = origin.inline_call_frame.clone();
    while let Some(frame) = inline {
        if let Some(handler) = frame.handlers.handler_for(offset) {
            return Some(*handler);
        }
        offset = frame.caller.bytecode_offset;
        inline = frame.caller.inline_call_frame.clone();
    }
    unit.handlers().handler_for(offset).copied()
}

/// Finds the handler for a throw at `origin` in `frame`, searching calling
/// frames as needed. Does not modify the frame stack.
pub fn lookup_handler(
    ctx: &VmContext,
    frame: FrameIndex,
    origin: CodeOrigin,
) -> Option<HandlerTarget> {
    let mut current = Some((frame, origin));
    while let Some((index, origin)) = current.take() {
        let state = ctx.frames().get(index)?;
        if let Some(code_block) = state.code_block {
            let found = ctx
                .code_block(code_block)
                .and_then(|unit| find_handler_in_unit(unit, &origin));
            if let Some(handler) = found {
                return Some(HandlerTarget {
                    frame: index,
                    code_block,
                    handler,
                });
            }
        }
        current = state.caller.zip(state.call_site.clone());
    }
    None
}

fn unwind_to_handler(ctx: &mut VmContext, frame: FrameIndex, origin: CodeOrigin) -> PackedHandler {
    debug_assert!(ctx.has_exception(), "handler lookup without a pending exception");
    let Some(target) = lookup_handler(ctx, frame, origin) else {
        tracing::debug!(?frame, "no handler for exception");
        return PackedHandler::NONE;
    };
    let pool_base = ctx.allocator().base_address();
    let Some(packed) = PackedHandler::pack(target.frame, target.handler.catch_entry, pool_base) else {
        tracing::error!(?target, "catch entry outside the executable pool");
        return PackedHandler::NONE;
    };
    ctx.frames_mut().unwind_to(target.frame);
    ctx.set_top_call_frame(target.frame);
    tracing::debug!(
        frame = ?target.frame,
        code_block = %target.code_block,
        catch_target = target.handler.target,
        "unwound to handler"
    );
    packed
}

/// Looks up the handler for the exception raised by the operation at
/// `site`, unwinding the frame stack to the catching frame.
///
/// Returns [`PackedHandler::NONE`] and leaves the frames alone if nothing
/// catches; the embedding then owns the exception.
pub fn operation_lookup_exception_handler(ctx: &mut VmContext, site: OperationSite) -> PackedHandler {
    let origin = ctx
        .code_block_for_address(site.return_address.0)
        .and_then(|unit| unit.code_origin_for(site.return_address));
    match origin {
        Some(origin) => unwind_to_handler(ctx, site.frame, origin),
        None => {
            tracing::warn!(return_address = %site.return_address, "throw from unknown site");
            PackedHandler::NONE
        }
    }
}

/// Looks up the handler for an exception raised while setting up the frame
/// at `frame`, before its code ran. The search starts at the call site in
/// the caller.
pub fn operation_lookup_exception_handler_from_caller(
    ctx: &mut VmContext,
    frame: FrameIndex,
) -> PackedHandler {
    let caller = ctx
        .frames()
        .get(frame)
        .and_then(|state| state.caller.zip(state.call_site.clone()));
    match caller {
        Some((caller, origin)) => unwind_to_handler(ctx, caller, origin),
        None => PackedHandler::NONE,
    }
}
