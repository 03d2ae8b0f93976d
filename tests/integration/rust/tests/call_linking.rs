//! Call Linking Integration Tests
//!
//! Drives call sites through their unlinked, linked and virtual states the
//! way compiled code would, across several callers and callees.

use core_types::Value;
use integration_tests::init_tracing;
use jit_runtime::{
    execute_call, return_from_call, CallOutcome, CodeSpecializationKind, FrameIndex,
    FunctionBody, HostFunction, JitConfig, ReturnAddress, VmContext,
};

fn caller_with_calls(ctx: &mut VmContext, calls: usize) -> (FrameIndex, Vec<ReturnAddress>) {
    let mut body = FunctionBody::new();
    for i in 0..calls {
        body = body.with_call(CodeSpecializationKind::Call, i as u32);
    }
    let f = ctx.define_function("caller", 0, body);
    let value = ctx.instantiate_function(f);
    let frame = ctx.enter_function(value, Value::Undefined, vec![]).unwrap();
    let unit = ctx.code_block(ctx.frame_code_block(frame).unwrap()).unwrap();
    let sites = (0..calls).map(|i| unit.call_site(i).unwrap()).collect();
    (frame, sites)
}

fn call_and_return(ctx: &mut VmContext, caller: FrameIndex, site: ReturnAddress, callee: Value) {
    match execute_call(ctx, caller, site, callee, Value::Undefined, vec![]).unwrap() {
        CallOutcome::Entered(frame) => {
            return_from_call(ctx, frame, Value::Undefined);
        }
        CallOutcome::Returned(_) => {}
    }
}

fn is_linked(ctx: &VmContext, site: ReturnAddress) -> bool {
    ctx.code_block_for_address(site.0)
        .and_then(|unit| unit.call_link_info(site))
        .is_some_and(|info| info.is_linked())
}

/// Test: A monomorphic site converges to a single link and stays linked
#[test]
fn test_monomorphic_site_converges() {
    init_tracing();
    let mut ctx = VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap();
    let (caller, sites) = caller_with_calls(&mut ctx, 1);
    let f = ctx.define_function("f", 0, FunctionBody::new());
    let callee = ctx.instantiate_function(f);

    for _ in 0..20 {
        call_and_return(&mut ctx, caller, sites[0], callee);
    }
    assert!(is_linked(&ctx, sites[0]));
    let counters = ctx.counters();
    assert_eq!(counters.calls_linked, 1);
    assert_eq!(counters.linked_call_hits, 18);
    assert_eq!(counters.compilations, 2);
    assert_eq!(ctx.frames().depth(), 1);
}

/// Test: Each site links independently to its own callee
#[test]
fn test_sites_link_independently() {
    let mut ctx = VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap();
    let (caller, sites) = caller_with_calls(&mut ctx, 2);
    let f = ctx.define_function("f", 0, FunctionBody::new());
    let g = ctx.define_function("g", 0, FunctionBody::new());
    let (f_value, g_value) = (ctx.instantiate_function(f), ctx.instantiate_function(g));

    call_and_return(&mut ctx, caller, sites[0], f_value);
    call_and_return(&mut ctx, caller, sites[0], f_value);
    call_and_return(&mut ctx, caller, sites[1], g_value);
    assert!(is_linked(&ctx, sites[0]));
    assert!(!is_linked(&ctx, sites[1]));

    assert_eq!(ctx.function(f).unwrap().incoming_calls(CodeSpecializationKind::Call).len(), 1);
    assert!(ctx.function(g).unwrap().incoming_calls(CodeSpecializationKind::Call).is_empty());
}

/// Test: A site alternating between callees never links
#[test]
fn test_alternating_callees_stay_unlinked() {
    let mut ctx = VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap();
    let (caller, sites) = caller_with_calls(&mut ctx, 1);
    let f = ctx.define_function("f", 0, FunctionBody::new());
    let g = ctx.define_function("g", 0, FunctionBody::new());
    let (f_value, g_value) = (ctx.instantiate_function(f), ctx.instantiate_function(g));

    for i in 0..10 {
        let callee = if i % 2 == 0 { f_value } else { g_value };
        call_and_return(&mut ctx, caller, sites[0], callee);
    }
    assert!(!is_linked(&ctx, sites[0]));
    assert_eq!(ctx.counters().calls_linked, 0);
}

/// Test: Host callees are invoked every time and never linked
#[test]
fn test_host_callee_never_links() {
    let mut ctx = VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap();
    let (caller, sites) = caller_with_calls(&mut ctx, 1);
    let host = ctx.define_host_function(HostFunction::new("count", |call| {
        Ok(Value::Smi(call.arguments.len() as i32))
    }));
    let callee = ctx.instantiate_host_function(host);

    for n in 0..5 {
        let arguments = vec![Value::Null; n];
        let outcome = execute_call(&mut ctx, caller, sites[0], callee, Value::Undefined, arguments).unwrap();
        assert_eq!(outcome, CallOutcome::Returned(Value::Smi(n as i32)));
    }
    assert!(!is_linked(&ctx, sites[0]));
    assert_eq!(ctx.counters().host_calls, 5);
}

/// Test: Discarding a callee that is still running defers freeing its code
#[test]
fn test_discard_while_running_defers_free() {
    let mut ctx = VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap();
    let (caller, sites) = caller_with_calls(&mut ctx, 1);
    let f = ctx.define_function("f", 0, FunctionBody::new());
    let callee = ctx.instantiate_function(f);
    call_and_return(&mut ctx, caller, sites[0], callee);
    call_and_return(&mut ctx, caller, sites[0], callee);

    let CallOutcome::Entered(frame) =
        execute_call(&mut ctx, caller, sites[0], callee, Value::Undefined, vec![]).unwrap()
    else {
        panic!("expected compiled callee");
    };
    let block = ctx.frame_code_block(frame).unwrap();
    assert!(ctx.discard_code(f, CodeSpecializationKind::Call));
    assert!(!is_linked(&ctx, sites[0]));
    assert!(ctx.code_block(block).is_some());
    assert_eq!(ctx.retired_code_count(), 0);

    return_from_call(&mut ctx, frame, Value::Undefined);
    ctx.collect_dead_code();
    assert!(ctx.code_block(block).is_none());
    assert_eq!(ctx.retired_code_count(), 1);
}
