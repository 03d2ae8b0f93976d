//! Unit tests for jit_runtime components

use core_types::{ErrorKind, Value};
use jit_runtime::{
    execute_call, execute_get_by_id, execute_put_by_id, return_from_call, AccessKind,
    CacheState, CallOutcome, CodeSpecializationKind, FrameIndex, FunctionBody, HostFunction,
    JitConfig, PutKind, ReturnAddress, VmContext,
};
use memory_manager::PropertyAttributes;

fn context() -> VmContext {
    VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap()
}

/// Enters a function with one call site and one access site of `access`.
fn enter_caller(ctx: &mut VmContext, access: AccessKind) -> (FrameIndex, ReturnAddress, ReturnAddress) {
    let body = FunctionBody::new()
        .with_call(CodeSpecializationKind::Call, 1)
        .with_access(access, 2, "x");
    let f = ctx.define_function("caller", 0, body);
    let value = ctx.instantiate_function(f);
    let frame = ctx.enter_function(value, Value::Undefined, vec![]).unwrap();
    let unit = ctx.code_block(ctx.frame_code_block(frame).unwrap()).unwrap();
    (frame, unit.call_site(0).unwrap(), unit.access_site(0).unwrap())
}

/// An object whose structure differs per `shape`, holding `x`.
fn shaped_object(ctx: &mut VmContext, shape: u32, x: i32) -> Value {
    let heap = ctx.heap_mut();
    let object = heap.allocate_object(None);
    heap.put_direct(object, format!("p{shape}").into(), Value::Null, PropertyAttributes::DEFAULT);
    heap.put_direct(object, "x".into(), Value::Smi(x), PropertyAttributes::DEFAULT);
    Value::Cell(object)
}

fn site_state(ctx: &VmContext, site: ReturnAddress) -> CacheState {
    ctx.code_block_for_address(site.0)
        .and_then(|unit| unit.stub_info(site))
        .map(|info| info.state().clone())
        .unwrap()
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[test]
fn test_config_json_overrides_defaults() {
    let config = JitConfig::from_json(r#"{ "polymorphic_list_capacity": 2 }"#).unwrap();
    assert_eq!(config.polymorphic_list_capacity, 2);
    assert_eq!(config.call_link_threshold, JitConfig::default().call_link_threshold);
}

#[test]
fn test_config_rejects_oversized_capacity() {
    assert!(JitConfig::from_json(r#"{ "polymorphic_list_capacity": 64 }"#).is_err());
}

// ============================================================================
// Call Linking Tests
// ============================================================================

#[test]
fn test_first_call_is_not_linked() {
    let mut ctx = context();
    let (frame, call_site, _) = enter_caller(&mut ctx, AccessKind::GetById);
    let f = ctx.define_function("f", 0, FunctionBody::new());
    let callee = ctx.instantiate_function(f);

    let outcome = execute_call(&mut ctx, frame, call_site, callee, Value::Undefined, vec![]).unwrap();
    assert!(matches!(outcome, CallOutcome::Entered(_)));
    let unit = ctx.code_block_for_address(call_site.0).unwrap();
    let info = unit.call_link_info(call_site).unwrap();
    assert!(info.seen());
    assert!(!info.is_linked());
}

#[test]
fn test_discarded_callee_is_relinked_after_recompiling() {
    let mut ctx = context();
    let (frame, call_site, _) = enter_caller(&mut ctx, AccessKind::GetById);
    let f = ctx.define_function("f", 0, FunctionBody::new());
    let callee = ctx.instantiate_function(f);
    let call = |ctx: &mut VmContext| {
        match execute_call(ctx, frame, call_site, callee, Value::Undefined, vec![]).unwrap() {
            CallOutcome::Entered(entered) => {
                return_from_call(ctx, entered, Value::Undefined);
            }
            CallOutcome::Returned(_) => panic!("script callee returned synchronously"),
        }
    };

    call(&mut ctx);
    call(&mut ctx);
    assert_eq!(ctx.counters().calls_linked, 1);

    assert!(ctx.discard_code(f, CodeSpecializationKind::Call));
    let unit = ctx.code_block_for_address(call_site.0).unwrap();
    assert!(!unit.call_link_info(call_site).unwrap().is_linked());

    call(&mut ctx);
    call(&mut ctx);
    assert_eq!(ctx.counters().calls_linked, 2);
    assert_eq!(ctx.counters().calls_unlinked, 1);
}

#[test]
fn test_host_callee_error_is_pending_after_call() {
    let mut ctx = context();
    let (frame, call_site, _) = enter_caller(&mut ctx, AccessKind::GetById);
    let host = ctx.define_host_function(HostFunction::new("fail", |_| {
        Err(core_types::JsError::range_error("nope"))
    }));
    let callee = ctx.instantiate_host_function(host);

    let pending = execute_call(&mut ctx, frame, call_site, callee, Value::Undefined, vec![]).unwrap_err();
    assert_eq!(pending.site, None);
    let kind = ctx.exception().and_then(|e| e.as_error()).map(|e| e.kind);
    assert_eq!(kind, Some(ErrorKind::RangeError));
}

// ============================================================================
// Inline Cache Tests
// ============================================================================

#[test]
fn test_get_by_id_grows_then_gives_up() {
    let mut ctx = VmContext::new(JitConfig {
        polymorphic_list_capacity: 2,
        ..JitConfig::with_pool_size(512 * 1024)
    })
    .unwrap();
    let (frame, _, site) = enter_caller(&mut ctx, AccessKind::GetById);

    let first = shaped_object(&mut ctx, 0, 1);
    execute_get_by_id(&mut ctx, frame, site, first).unwrap();
    assert!(matches!(site_state(&ctx, site), CacheState::Virgin));

    for shape in 0..2 {
        let object = shaped_object(&mut ctx, shape, 1);
        execute_get_by_id(&mut ctx, frame, site, object).unwrap();
    }
    assert!(matches!(site_state(&ctx, site), CacheState::Polymorphic(ref entries) if entries.len() == 2));

    let third = shaped_object(&mut ctx, 2, 7);
    assert_eq!(execute_get_by_id(&mut ctx, frame, site, third), Ok(Value::Smi(7)));
    assert!(matches!(site_state(&ctx, site), CacheState::Generic));

    let repatches = ctx.counters().repatches;
    let again = shaped_object(&mut ctx, 3, 8);
    assert_eq!(execute_get_by_id(&mut ctx, frame, site, again), Ok(Value::Smi(8)));
    assert_eq!(ctx.counters().repatches, repatches);
}

#[test]
fn test_prototype_load_is_invalidated_by_shadowing() {
    let mut ctx = context();
    let (frame, _, site) = enter_caller(&mut ctx, AccessKind::GetById);
    let proto = ctx.heap_mut().allocate_object(None);
    ctx.heap_mut()
        .put_direct(proto, "x".into(), Value::Smi(1), PropertyAttributes::DEFAULT);
    let middle = ctx.heap_mut().allocate_object(Some(proto));
    let object = Value::Cell(ctx.heap_mut().allocate_object(Some(middle)));

    for _ in 0..3 {
        assert_eq!(execute_get_by_id(&mut ctx, frame, site, object), Ok(Value::Smi(1)));
    }
    ctx.heap_mut()
        .put_direct(middle, "x".into(), Value::Smi(2), PropertyAttributes::DEFAULT);
    assert_eq!(execute_get_by_id(&mut ctx, frame, site, object), Ok(Value::Smi(2)));
}

#[test]
fn test_sloppy_put_to_read_only_is_silent() {
    let mut ctx = context();
    let (frame, _, site) = enter_caller(
        &mut ctx,
        AccessKind::PutById {
            kind: PutKind::Ordinary,
            strict: false,
        },
    );
    let object = ctx.heap_mut().allocate_object(None);
    ctx.heap_mut()
        .put_direct(object, "x".into(), Value::Smi(1), PropertyAttributes::READ_ONLY);

    for _ in 0..3 {
        execute_put_by_id(&mut ctx, frame, site, Value::Cell(object), Value::Smi(2)).unwrap();
    }
    let slot = ctx.heap().lookup_property(object, "x").unwrap();
    assert_eq!(slot.value, Value::Smi(1));
    assert!(!ctx.has_exception());
}

// ============================================================================
// Code Lifecycle Tests
// ============================================================================

#[test]
fn test_retired_code_is_reclaimed() {
    let mut ctx = context();
    let f = ctx.define_function("f", 0, FunctionBody::new());
    ctx.compile_for(f, CodeSpecializationKind::Call).unwrap();
    let allocated = ctx.allocator().statistics().bytes_allocated;

    assert!(ctx.discard_code(f, CodeSpecializationKind::Call));
    assert_eq!(ctx.retired_code_count(), 1);
    ctx.reclaim();
    assert_eq!(ctx.retired_code_count(), 0);
    assert!(ctx.allocator().statistics().bytes_allocated < allocated);
}
