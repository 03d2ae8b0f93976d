//! Executable Memory Integration Tests
//!
//! Verifies that compiled code, stub routines and thunks share one pool
//! without overlapping, and that every byte handed out comes back.

use core_types::Value;
use integration_tests::init_tracing;
use jit_runtime::{
    execute_get_by_id, AccessKind, AllocationPolicy, CodeSpecializationKind, FunctionBody,
    JitConfig, VmContext,
};
use memory_manager::{
    AllocationEffort, ExecutableAllocator, OwnerTag, PropertyAttributes, ALLOCATION_GRANULE,
};

/// Test: Handles from a busy pool never overlap
#[test]
fn test_live_handles_are_disjoint() {
    let allocator = ExecutableAllocator::initialize(64 * 1024).unwrap();
    let sizes = [1, 31, 32, 33, 100, 257, 4000, 64, 7];
    let mut handles: Vec<_> = sizes
        .iter()
        .map(|&size| {
            allocator
                .allocate(size, OwnerTag::Other("disjoint"), AllocationEffort::MaySucceed)
                .unwrap()
        })
        .collect();
    handles.remove(3);
    handles.remove(5);
    handles.push(
        allocator
            .allocate(90, OwnerTag::Other("disjoint"), AllocationEffort::MaySucceed)
            .unwrap(),
    );

    for (i, a) in handles.iter().enumerate() {
        assert_eq!(a.size_in_bytes() % ALLOCATION_GRANULE, 0);
        for b in &handles[i + 1..] {
            assert!(a.end() <= b.start() || b.end() <= a.start(), "{a:?} overlaps {b:?}");
        }
    }
}

/// Test: Allocated bytes equal the sum of live rounded sizes
#[test]
fn test_allocated_bytes_are_conserved() {
    let allocator = ExecutableAllocator::initialize(64 * 1024).unwrap();
    let mut live = Vec::new();
    for size in [10usize, 50, 90, 130, 170] {
        live.push(
            allocator
                .allocate(size, OwnerTag::Other("conservation"), AllocationEffort::MaySucceed)
                .unwrap(),
        );
        let expected: usize = live.iter().map(|h| h.size_in_bytes()).sum();
        assert_eq!(allocator.statistics().bytes_allocated, expected);
    }
    live.clear();
    assert_eq!(allocator.statistics().bytes_allocated, 0);
}

/// Test: A VM's code, stubs and thunks all live inside its own pool
#[test]
fn test_runtime_code_lives_in_the_pool() {
    init_tracing();
    let mut ctx = VmContext::new(JitConfig::with_pool_size(256 * 1024)).unwrap();
    let f = ctx.define_function(
        "f",
        0,
        FunctionBody::new().with_access(AccessKind::GetById, 0, "x"),
    );
    let callee = ctx.instantiate_function(f);
    let frame = ctx.enter_function(callee, Value::Undefined, vec![]).unwrap();
    let block = ctx.frame_code_block(frame).unwrap();
    let site = ctx.code_block(block).unwrap().access_site(0).unwrap();

    let object = ctx.heap_mut().allocate_object(None);
    ctx.heap_mut()
        .put_direct(object, "x".into(), Value::Smi(1), PropertyAttributes::DEFAULT);
    for _ in 0..2 {
        execute_get_by_id(&mut ctx, frame, site, Value::Cell(object)).unwrap();
    }

    let allocator = ctx.allocator();
    let unit = ctx.code_block(block).unwrap();
    assert!(allocator.contains(unit.code_start()));
    assert!(allocator.contains(ctx.thunks().virtual_call()));
    let routine = unit.stub_info(site).unwrap().routine().unwrap();
    assert!(allocator.contains(routine.start()));
    assert!(!unit.contains(routine.start()));
}

/// Test: A soft-policy VM reports exhaustion instead of aborting
#[test]
fn test_soft_policy_compile_failure_is_recoverable() {
    let config = JitConfig {
        allocation_policy: AllocationPolicy::Soft,
        ..JitConfig::with_pool_size(64 * 1024)
    };
    let mut ctx = VmContext::new(config).unwrap();
    let mut filler = Vec::new();
    while let Some(handle) = ctx.allocator().allocate(
        ALLOCATION_GRANULE,
        OwnerTag::Other("filler"),
        AllocationEffort::MaySucceed,
    ) {
        filler.push(handle);
    }
    let f = ctx.define_function("f", 0, FunctionBody::new());
    assert!(ctx.compile_for(f, CodeSpecializationKind::Call).is_err());
    assert_eq!(ctx.counters().compile_failures, 1);

    filler.clear();
    assert!(ctx.compile_for(f, CodeSpecializationKind::Call).is_ok());
}

/// Test: Compiling under high pool pressure frees retired code first
#[test]
fn test_compile_under_pressure_reclaims_retired_code() {
    init_tracing();
    let mut ctx = VmContext::new(JitConfig::with_pool_size(64 * 1024)).unwrap();
    let mut compiled = 0;
    while ctx.allocator().memory_pressure() < 2.0 {
        assert!(compiled < 100_000, "pool pressure never reached 2.0");
        let f = ctx.define_function(&format!("f{compiled}"), 0, FunctionBody::new());
        ctx.compile_for(f, CodeSpecializationKind::Call).unwrap();
        assert!(ctx.discard_code(f, CodeSpecializationKind::Call));
        compiled += 1;
    }
    assert_eq!(ctx.retired_code_count(), compiled);
    let before = ctx.allocator().statistics().bytes_allocated;

    let g = ctx.define_function("g", 0, FunctionBody::new());
    ctx.compile_for(g, CodeSpecializationKind::Call).unwrap();
    assert_eq!(ctx.retired_code_count(), 0);
    assert!(ctx.allocator().statistics().bytes_allocated < before);
    assert!(ctx.allocator().memory_pressure() < 2.0);
}

/// Test: A hard request on a full pool runs the VM's reclaimer and retries
#[test]
fn test_hard_allocation_runs_vm_reclaimer() {
    let mut ctx = VmContext::new(JitConfig::with_pool_size(64 * 1024)).unwrap();
    let f = ctx.define_function("f", 0, FunctionBody::new());
    ctx.compile_for(f, CodeSpecializationKind::Call).unwrap();
    assert!(ctx.discard_code(f, CodeSpecializationKind::Call));
    assert_eq!(ctx.retired_code_count(), 1);

    let stats = ctx.allocator().statistics();
    let free = stats.bytes_reserved - stats.bytes_allocated;
    let handle = ctx.allocator().allocate(
        free + ALLOCATION_GRANULE,
        OwnerTag::Other("oversubscribed"),
        AllocationEffort::MustSucceed,
    );
    assert!(handle.is_some());
    assert_eq!(ctx.retired_code_count(), 0);
}
