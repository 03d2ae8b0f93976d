//! Call linking.
//!
//! Every call instruction in compiled code owns a [`CallLinkInfo`] and a
//! patch slot. An unlinked slot points at the virtual-call thunk, which
//! resolves the callee on every call. Once the same callee has been seen
//! again after the configured number of visits, the slot is rewritten to the
//! callee's entry point and later calls jump there directly until the
//! callee's code is discarded.

use core_types::{CodeBlockId, FunctionId, JsError, Value};

use crate::call_frame::FrameIndex;
use crate::code_origin::CodeOrigin;
use crate::context::{Callee, VmContext};
use crate::function::{CodeSpecializationKind, IncomingCall};
use crate::operations::OperationSite;

/// Machine code address returned to generated code. Zero means "an
/// exception is pending".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodePtr(pub usize);

impl CodePtr {
    /// The sentinel returned alongside a pending exception.
    pub const NULL: CodePtr = CodePtr(0);

    /// Returns true for the sentinel.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Where a linked call site jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedTarget {
    /// Function the site was linked for
    pub callee: FunctionId,
    /// Unit the target lies in
    pub code_block: CodeBlockId,
    /// Entry address written into the patch slot
    pub target: usize,
}

/// Link state of one call site.
#[derive(Debug, Clone, PartialEq)]
pub struct CallLinkInfo {
    kind: CodeSpecializationKind,
    origin: CodeOrigin,
    patch_offset: usize,
    visits: u32,
    last_target: Option<(FunctionId, usize)>,
    linked: Option<LinkedTarget>,
}

impl CallLinkInfo {
    /// Creates unseen, unlinked state for a call site.
    pub fn new(kind: CodeSpecializationKind, origin: CodeOrigin, patch_offset: usize) -> Self {
        Self {
            kind,
            origin,
            patch_offset,
            visits: 0,
            last_target: None,
            linked: None,
        }
    }

    /// Call or construct.
    pub fn kind(&self) -> CodeSpecializationKind {
        self.kind
    }

    /// Bytecode position of the call.
    pub fn origin(&self) -> &CodeOrigin {
        &self.origin
    }

    /// Offset of the site's patch slot in the unit's code.
    pub fn patch_offset(&self) -> usize {
        self.patch_offset
    }

    /// Whether the slow path has run for this site since it was last reset.
    pub fn seen(&self) -> bool {
        self.visits > 0
    }

    /// Slow-path visits since the last reset.
    pub fn visits(&self) -> u32 {
        self.visits
    }

    /// Returns true once the site jumps directly to a callee.
    pub fn is_linked(&self) -> bool {
        self.linked.is_some()
    }

    /// The current direct target.
    pub fn linked(&self) -> Option<&LinkedTarget> {
        self.linked.as_ref()
    }

    /// Records a visit for a script callee entered at `target`. Returns true
    /// if the site should now be linked to it.
    ///
    /// A callee is only stable if it was also entered at the same address
    /// last time, so a site whose argument count varies around the callee's
    /// parameter count never links.
    pub(crate) fn observe(&mut self, callee: FunctionId, target: usize, threshold: u32) -> bool {
        let stable = self.last_target == Some((callee, target));
        let link = self.linked.is_none() && stable && self.visits >= threshold;
        self.visits = self.visits.saturating_add(1);
        self.last_target = Some((callee, target));
        link
    }

    /// Records a visit for a host callee; host calls are never linked.
    pub(crate) fn observe_host(&mut self) {
        self.visits = self.visits.saturating_add(1);
        self.last_target = None;
    }

    pub(crate) fn set_linked(&mut self, target: LinkedTarget) {
        self.linked = Some(target);
    }

    /// Reverts to unseen and unlinked.
    pub(crate) fn unlink(&mut self) {
        self.visits = 0;
        self.last_target = None;
        self.linked = None;
    }
}

enum Resolved {
    Host,
    Compiled {
        function: FunctionId,
        code_block: CodeBlockId,
        target: usize,
    },
}

/// Resolves the callee of the frame at `site`, running host functions and
/// compiling script functions as needed.
fn resolve(
    ctx: &mut VmContext,
    site: OperationSite,
    kind: CodeSpecializationKind,
) -> Result<Resolved, JsError> {
    let call_site = call_site_origin(ctx, site)?;
    let frame = ctx
        .frames_mut()
        .get_mut(site.frame)
        .ok_or_else(|| JsError::internal(format!("no frame {:?}", site.frame)))?;
    frame.call_site = Some(call_site);
    let callee = frame.callee;
    let this = frame.this;
    let argument_count = frame.argument_count();

    match ctx.resolve_callee(callee) {
        None => Err(not_callable(callee, kind)),
        Some(Callee::Host(id)) => {
            let constructible = ctx.host_function(id).is_some_and(|f| f.is_constructible());
            if kind == CodeSpecializationKind::Construct && !constructible {
                return Err(not_callable(callee, kind));
            }
            let arguments = frame_arguments(ctx, site.frame);
            let result = ctx.invoke_host(id, this, &arguments)?;
            ctx.set_host_call_return_value(result);
            Ok(Resolved::Host)
        }
        Some(Callee::Script(function)) => {
            let constructible = ctx.function(function).is_some_and(|f| f.is_constructible());
            if kind == CodeSpecializationKind::Construct && !constructible {
                return Err(not_callable(callee, kind));
            }
            let code_block = ctx.compile_for(function, kind).map_err(|err| {
                tracing::debug!(error = %err, "lazy compilation failed");
                JsError::stack_overflow()
            })?;
            let target = ctx
                .code_block(code_block)
                .map(|unit| unit.entry_for(argument_count))
                .ok_or_else(|| JsError::internal(format!("code block {code_block} missing")))?;
            if let Some(frame) = ctx.frames_mut().get_mut(site.frame) {
                frame.code_block = Some(code_block);
            }
            Ok(Resolved::Compiled {
                function,
                code_block,
                target,
            })
        }
    }
}

fn not_callable(callee: Value, kind: CodeSpecializationKind) -> JsError {
    match kind {
        CodeSpecializationKind::Call => {
            JsError::type_error(format!("{} is not a function", callee.type_name()))
        }
        CodeSpecializationKind::Construct => {
            JsError::type_error(format!("{} is not a constructor", callee.type_name()))
        }
    }
}

fn frame_arguments(ctx: &VmContext, frame: FrameIndex) -> Vec<Value> {
    ctx.frames()
        .get(frame)
        .map(|frame| frame.arguments.clone())
        .unwrap_or_default()
}

fn caller_code_block(ctx: &VmContext, site: OperationSite) -> Result<CodeBlockId, JsError> {
    ctx.code_block_for_address(site.return_address.0)
        .map(|unit| unit.id())
        .ok_or_else(|| {
            JsError::internal(format!("no compiled code at {}", site.return_address))
        })
}

fn call_site_origin(ctx: &VmContext, site: OperationSite) -> Result<CodeOrigin, JsError> {
    ctx.code_block_for_address(site.return_address.0)
        .and_then(|unit| unit.call_link_info(site.return_address))
        .map(|info| info.origin().clone())
        .ok_or_else(|| JsError::internal(format!("no call site at {}", site.return_address)))
}

fn link_for(
    ctx: &mut VmContext,
    site: OperationSite,
    kind: CodeSpecializationKind,
) -> Result<CodePtr, JsError> {
    let caller = caller_code_block(ctx, site)?;
    let resolved = resolve(ctx, site, kind)?;
    let threshold = ctx.config().call_link_threshold;
    let host_return = ctx.thunks().host_call_return();

    let unit = ctx
        .code_block_mut(caller)
        .ok_or_else(|| JsError::internal(format!("code block {caller} missing")))?;
    let info = unit
        .call_link_info_mut(site.return_address)
        .ok_or_else(|| JsError::internal(format!("no call site at {}", site.return_address)))?;
    debug_assert_eq!(info.kind(), kind);

    let (function, code_block, target) = match resolved {
        Resolved::Host => {
            info.observe_host();
            return Ok(CodePtr(host_return));
        }
        Resolved::Compiled {
            function,
            code_block,
            target,
        } => (function, code_block, target),
    };
    if !info.observe(function, target, threshold) {
        return Ok(CodePtr(target));
    }

    info.set_linked(LinkedTarget {
        callee: function,
        code_block,
        target,
    });
    let patch_offset = info.patch_offset();
    if let Err(err) = unit.write_patch_slot(patch_offset, target) {
        tracing::warn!(error = %err, "failed to link call site");
        if let Some(info) = unit.call_link_info_mut(site.return_address) {
            info.unlink();
        }
        return Ok(CodePtr(target));
    }
    if let Some(executable) = ctx.function_mut(function) {
        executable.add_incoming_call(
            kind,
            IncomingCall {
                caller,
                return_address: site.return_address,
            },
        );
    }
    ctx.counters_mut().calls_linked += 1;
    tracing::debug!(
        %function,
        ?kind,
        return_address = %site.return_address,
        target = format_args!("{target:#x}"),
        "linked call site"
    );
    Ok(CodePtr(target))
}

fn virtual_for(
    ctx: &mut VmContext,
    site: OperationSite,
    kind: CodeSpecializationKind,
) -> Result<CodePtr, JsError> {
    ctx.counters_mut().virtual_calls += 1;
    Ok(match resolve(ctx, site, kind)? {
        Resolved::Host => CodePtr(ctx.thunks().host_call_return()),
        Resolved::Compiled { target, .. } => CodePtr(target),
    })
}

/// Slow path of an unlinked call site: resolves the callee, links the site
/// when it has become stable, and returns where to jump.
pub fn operation_link_call(ctx: &mut VmContext, site: OperationSite) -> Result<CodePtr, JsError> {
    link_for(ctx, site, CodeSpecializationKind::Call)
}

/// [`operation_link_call`] for `new`.
pub fn operation_link_construct(
    ctx: &mut VmContext,
    site: OperationSite,
) -> Result<CodePtr, JsError> {
    link_for(ctx, site, CodeSpecializationKind::Construct)
}

/// Resolves the callee without touching the site's link state.
pub fn operation_virtual_call(
    ctx: &mut VmContext,
    site: OperationSite,
) -> Result<CodePtr, JsError> {
    virtual_for(ctx, site, CodeSpecializationKind::Call)
}

/// [`operation_virtual_call`] for `new`.
pub fn operation_virtual_construct(
    ctx: &mut VmContext,
    site: OperationSite,
) -> Result<CodePtr, JsError> {
    virtual_for(ctx, site, CodeSpecializationKind::Construct)
}

/// Reads the value the last host call returned.
pub fn operation_get_host_call_return_value(ctx: &mut VmContext) -> Value {
    ctx.host_call_return_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_frame::CallFrame;
    use crate::compiled_unit::ReturnAddress;
    use crate::config::JitConfig;
    use crate::function::FunctionBody;
    use crate::host::{HostCall, HostFunction};

    struct Fixture {
        ctx: VmContext,
        caller_frame: FrameIndex,
        return_address: ReturnAddress,
    }

    fn fixture(kind: CodeSpecializationKind) -> Fixture {
        let mut ctx = VmContext::new(JitConfig::with_pool_size(256 * 1024)).unwrap();
        let caller = ctx.define_function("caller", 0, FunctionBody::new().with_call(kind, 3));
        let caller_value = ctx.instantiate_function(caller);
        let caller_frame = ctx
            .enter_function(caller_value, Value::Undefined, vec![])
            .unwrap();
        let block = ctx.frame_code_block(caller_frame).unwrap();
        let return_address = ctx.code_block(block).unwrap().call_site(0).unwrap();
        Fixture {
            ctx,
            caller_frame,
            return_address,
        }
    }

    impl Fixture {
        fn call(
            &mut self,
            callee: Value,
            arguments: Vec<Value>,
            op: fn(&mut VmContext, OperationSite) -> Result<CodePtr, JsError>,
        ) -> Result<CodePtr, JsError> {
            let frame = self
                .ctx
                .frames_mut()
                .push(CallFrame::new(callee, Value::Undefined, arguments))
                .unwrap();
            let site = OperationSite {
                frame,
                return_address: self.return_address,
            };
            let result = op(&mut self.ctx, site);
            self.ctx.frames_mut().unwind_to(self.caller_frame);
            result
        }

        fn info(&self) -> &CallLinkInfo {
            let block = self.ctx.frame_code_block(self.caller_frame).unwrap();
            self.ctx
                .code_block(block)
                .unwrap()
                .call_link_info(self.return_address)
                .unwrap()
        }

        fn patch_slot(&self) -> usize {
            let block = self.ctx.frame_code_block(self.caller_frame).unwrap();
            let unit = self.ctx.code_block(block).unwrap();
            unit.read_patch_slot(self.info().patch_offset()).unwrap()
        }
    }

    fn double(call: &mut HostCall<'_>) -> Result<Value, JsError> {
        match call.argument(0) {
            Value::Smi(n) => Ok(Value::Smi(n * 2)),
            other => Err(JsError::type_error(format!("cannot double {}", other.type_name()))),
        }
    }

    #[test]
    fn test_links_on_second_visit_with_stable_callee() {
        let mut fx = fixture(CodeSpecializationKind::Call);
        let f = fx.ctx.define_function("f", 0, FunctionBody::new());
        let callee = fx.ctx.instantiate_function(f);
        let virtual_call = fx.ctx.thunks().virtual_call();

        let first = fx.call(callee, vec![], operation_link_call).unwrap();
        assert!(fx.info().seen());
        assert!(!fx.info().is_linked());
        assert_eq!(fx.patch_slot(), virtual_call);

        let second = fx.call(callee, vec![], operation_link_call).unwrap();
        assert_eq!(first, second);
        assert!(fx.info().is_linked());
        assert_eq!(fx.patch_slot(), second.0);
        assert_eq!(fx.ctx.counters().calls_linked, 1);
        assert_eq!(fx.ctx.function(f).unwrap().incoming_calls(CodeSpecializationKind::Call).len(), 1);
    }

    #[test]
    fn test_changing_callee_delays_link() {
        let mut fx = fixture(CodeSpecializationKind::Call);
        let f = fx.ctx.define_function("f", 0, FunctionBody::new());
        let g = fx.ctx.define_function("g", 0, FunctionBody::new());
        let fv = fx.ctx.instantiate_function(f);
        let gv = fx.ctx.instantiate_function(g);

        fx.call(fv, vec![], operation_link_call).unwrap();
        fx.call(gv, vec![], operation_link_call).unwrap();
        assert!(!fx.info().is_linked());
        fx.call(gv, vec![], operation_link_call).unwrap();
        assert_eq!(fx.info().linked().map(|l| l.callee), Some(g));
    }

    #[test]
    fn test_short_argument_list_uses_arity_check_entry() {
        let mut fx = fixture(CodeSpecializationKind::Call);
        let f = fx.ctx.define_function("f", 2, FunctionBody::new());
        let callee = fx.ctx.instantiate_function(f);

        let short = fx.call(callee, vec![Value::Smi(1)], operation_virtual_call).unwrap();
        let full = fx
            .call(callee, vec![Value::Smi(1), Value::Smi(2)], operation_virtual_call)
            .unwrap();
        let block = fx.ctx.function(f).unwrap().code_for(CodeSpecializationKind::Call).unwrap();
        let unit = fx.ctx.code_block(block).unwrap();
        assert_eq!(short.0, unit.arity_check_address());
        assert_eq!(full.0, unit.entry_address());
    }

    #[test]
    fn test_varying_argument_count_keeps_site_unlinked() {
        let mut fx = fixture(CodeSpecializationKind::Call);
        let f = fx.ctx.define_function("f", 2, FunctionBody::new());
        let callee = fx.ctx.instantiate_function(f);
        let full = vec![Value::Smi(1), Value::Smi(2)];

        fx.call(callee, full.clone(), operation_link_call).unwrap();
        let short = fx.call(callee, vec![], operation_link_call).unwrap();
        assert!(!fx.info().is_linked());
        fx.call(callee, full, operation_link_call).unwrap();
        assert!(!fx.info().is_linked());

        let again = fx.call(callee, vec![], operation_link_call).unwrap();
        assert_eq!(again, short);
        let again = fx.call(callee, vec![], operation_link_call).unwrap();
        let linked = fx.info().linked().copied().unwrap();
        assert_eq!(linked.target, again.0);
        let unit = fx.ctx.code_block(linked.code_block).unwrap();
        assert_eq!(linked.target, unit.arity_check_address());
    }

    #[test]
    fn test_host_callee_is_dispatched_and_never_linked() {
        let mut fx = fixture(CodeSpecializationKind::Call);
        let h = fx.ctx.define_host_function(HostFunction::new("double", double));
        let callee = fx.ctx.instantiate_host_function(h);
        let host_return = fx.ctx.thunks().host_call_return();

        for _ in 0..3 {
            let target = fx.call(callee, vec![Value::Smi(21)], operation_link_call).unwrap();
            assert_eq!(target.0, host_return);
            assert_eq!(operation_get_host_call_return_value(&mut fx.ctx), Value::Smi(42));
        }
        assert!(!fx.info().is_linked());
        assert_eq!(fx.ctx.counters().host_calls, 3);
    }

    #[test]
    fn test_host_error_propagates() {
        let mut fx = fixture(CodeSpecializationKind::Call);
        let h = fx.ctx.define_host_function(HostFunction::new("double", double));
        let callee = fx.ctx.instantiate_host_function(h);
        let err = fx.call(callee, vec![Value::Null], operation_link_call).unwrap_err();
        assert_eq!(err.kind, core_types::ErrorKind::TypeError);
    }

    #[test]
    fn test_calling_non_function_is_type_error() {
        let mut fx = fixture(CodeSpecializationKind::Call);
        let err = fx.call(Value::Smi(5), vec![], operation_link_call).unwrap_err();
        assert_eq!(err.kind, core_types::ErrorKind::TypeError);
        assert!(err.message.contains("not a function"));
    }

    #[test]
    fn test_construct_non_constructor_is_type_error() {
        let mut fx = fixture(CodeSpecializationKind::Construct);
        let arrow = fx
            .ctx
            .define_non_constructible_function("arrow", 0, FunctionBody::new());
        let callee = fx.ctx.instantiate_function(arrow);
        let err = fx.call(callee, vec![], operation_link_construct).unwrap_err();
        assert!(err.message.contains("not a constructor"));
    }

    #[test]
    fn test_discard_unlinks_incoming_calls() {
        let mut fx = fixture(CodeSpecializationKind::Call);
        let f = fx.ctx.define_function("f", 0, FunctionBody::new());
        let callee = fx.ctx.instantiate_function(f);
        fx.call(callee, vec![], operation_link_call).unwrap();
        fx.call(callee, vec![], operation_link_call).unwrap();
        assert!(fx.info().is_linked());

        assert!(fx.ctx.discard_code(f, CodeSpecializationKind::Call));
        assert!(!fx.info().is_linked());
        assert!(!fx.info().seen());
        assert_eq!(fx.patch_slot(), fx.ctx.thunks().virtual_call());
        assert_eq!(fx.ctx.counters().calls_unlinked, 1);

        fx.call(callee, vec![], operation_link_call).unwrap();
        assert!(!fx.info().is_linked());
        fx.call(callee, vec![], operation_link_call).unwrap();
        assert!(fx.info().is_linked());
    }

    #[test]
    fn test_callee_frame_records_call_site() {
        let mut fx = fixture(CodeSpecializationKind::Call);
        let f = fx.ctx.define_function("f", 0, FunctionBody::new());
        let callee = fx.ctx.instantiate_function(f);
        let frame = fx
            .ctx
            .frames_mut()
            .push(CallFrame::new(callee, Value::Undefined, vec![]))
            .unwrap();
        let site = OperationSite {
            frame,
            return_address: fx.return_address,
        };
        operation_link_call(&mut fx.ctx, site).unwrap();
        let entered = fx.ctx.frames().get(frame).unwrap();
        assert_eq!(entered.call_site.as_ref().map(|o| o.bytecode_offset), Some(3));
        assert!(entered.code_block.is_some());
    }
}
