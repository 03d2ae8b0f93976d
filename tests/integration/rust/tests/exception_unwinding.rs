//! Exception Unwinding Integration Tests
//!
//! Throws from compiled code, including from inlined frames, and checks
//! where the handler search lands.

use core_types::Value;
use integration_tests::init_tracing;
use jit_runtime::{
    execute_call, execute_get_by_id, unwind, AccessKind, CallOutcome, CodeSpecializationKind,
    FunctionBody, JitConfig, Landing, VmContext,
};

/// Test: A throw inside an inlined frame with no local handler is caught
/// by the calling frame
#[test]
fn test_inlined_throw_reaches_caller_handler() {
    init_tracing();
    let mut ctx = VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap();

    let inner = ctx.define_function("inner", 0, FunctionBody::new());
    let mut callee_body = FunctionBody::new().with_access(AccessKind::GetById, 3, "x");
    let inline = callee_body.inline(inner, 20, None);
    callee_body.access_sites[0].inline_frame = Some(inline);
    let callee_fn = ctx.define_function("callee", 0, callee_body);

    let caller_fn = ctx.define_function(
        "caller",
        0,
        FunctionBody::new()
            .with_call(CodeSpecializationKind::Call, 7)
            .with_handler(5, 9, 50),
    );
    let caller_value = ctx.instantiate_function(caller_fn);
    let caller = ctx.enter_function(caller_value, Value::Undefined, vec![]).unwrap();
    let caller_unit = ctx.code_block(ctx.frame_code_block(caller).unwrap()).unwrap();
    let call_site = caller_unit.call_site(0).unwrap();
    let catch_entry = caller_unit.handlers().handlers()[0].catch_entry;

    let callee_value = ctx.instantiate_function(callee_fn);
    let CallOutcome::Entered(callee) =
        execute_call(&mut ctx, caller, call_site, callee_value, Value::Undefined, vec![]).unwrap()
    else {
        panic!("expected compiled callee");
    };
    let callee_unit = ctx.code_block(ctx.frame_code_block(callee).unwrap()).unwrap();
    assert!(callee_unit.handlers().is_empty());
    let throw_site = callee_unit.access_site(0).unwrap();

    let pending = execute_get_by_id(&mut ctx, callee, throw_site, Value::Undefined).unwrap_err();
    let landing = unwind(&mut ctx, pending).unwrap();
    assert_eq!(
        landing,
        Landing {
            frame: caller,
            catch_entry
        }
    );
    assert_eq!(ctx.frames().depth(), 1);
    assert_eq!(ctx.top_call_frame(), Some(caller));
    assert!(ctx.take_exception().is_some());
}

/// Test: A call that fails before the callee runs is caught in the caller
#[test]
fn test_failed_call_setup_is_caught_in_caller() {
    let mut ctx = VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap();
    let caller_fn = ctx.define_function(
        "caller",
        0,
        FunctionBody::new()
            .with_call(CodeSpecializationKind::Call, 2)
            .with_handler(0, 4, 12),
    );
    let caller_value = ctx.instantiate_function(caller_fn);
    let caller = ctx.enter_function(caller_value, Value::Undefined, vec![]).unwrap();
    let call_site = ctx
        .code_block(ctx.frame_code_block(caller).unwrap())
        .unwrap()
        .call_site(0)
        .unwrap();

    let pending =
        execute_call(&mut ctx, caller, call_site, Value::Boolean(true), Value::Undefined, vec![]).unwrap_err();
    let landing = unwind(&mut ctx, pending).unwrap();
    assert_eq!(landing.frame, caller);
    assert_eq!(ctx.frames().depth(), 1);
}

/// Test: An uncaught throw leaves the stack for the embedder
#[test]
fn test_uncaught_throw_keeps_frames() {
    let mut ctx = VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap();
    let f = ctx.define_function(
        "f",
        0,
        FunctionBody::new().with_access(AccessKind::GetById, 0, "x"),
    );
    let value = ctx.instantiate_function(f);
    let frame = ctx.enter_function(value, Value::Undefined, vec![]).unwrap();
    let site = ctx
        .code_block(ctx.frame_code_block(frame).unwrap())
        .unwrap()
        .access_site(0)
        .unwrap();

    let pending = execute_get_by_id(&mut ctx, frame, site, Value::Null).unwrap_err();
    assert_eq!(unwind(&mut ctx, pending), None);
    assert_eq!(ctx.frames().depth(), 1);
    assert!(ctx.has_exception());
}
