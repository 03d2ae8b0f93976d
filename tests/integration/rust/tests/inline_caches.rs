//! Inline Cache Integration Tests
//!
//! Exercises access sites across many shapes, checking that caches only
//! ever grow toward generic and that cached paths agree with slow paths.

use core_types::Value;
use integration_tests::init_tracing;
use jit_runtime::{
    execute_get_by_id, execute_get_by_val, execute_put_by_id, execute_put_by_val, AccessKind,
    CacheState, FrameIndex, FunctionBody, JitConfig, PutKind, ReturnAddress, VmContext,
};
use memory_manager::PropertyAttributes;

fn enter(ctx: &mut VmContext, body: FunctionBody) -> (FrameIndex, Vec<ReturnAddress>) {
    let sites = body.access_sites.len();
    let f = ctx.define_function("f", 0, body);
    let value = ctx.instantiate_function(f);
    let frame = ctx.enter_function(value, Value::Undefined, vec![]).unwrap();
    let unit = ctx.code_block(ctx.frame_code_block(frame).unwrap()).unwrap();
    (frame, (0..sites).map(|i| unit.access_site(i).unwrap()).collect())
}

fn rank(state: &CacheState) -> usize {
    match state {
        CacheState::Virgin => 0,
        CacheState::Monomorphic(_) => 1,
        CacheState::Polymorphic(entries) => entries.len(),
        CacheState::Generic => usize::MAX,
    }
}

fn state(ctx: &VmContext, site: ReturnAddress) -> CacheState {
    ctx.code_block_for_address(site.0)
        .and_then(|unit| unit.stub_info(site))
        .map(|info| info.state().clone())
        .unwrap()
}

/// Test: Cache state never shrinks while shapes keep arriving
#[test]
fn test_cache_growth_is_monotonic() {
    init_tracing();
    let mut ctx = VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap();
    let (frame, sites) = enter(&mut ctx, FunctionBody::new().with_access(AccessKind::GetById, 0, "x"));
    let capacity = ctx.config().polymorphic_list_capacity;

    let mut previous = 0;
    let mut objects = Vec::new();
    for shape in 0..capacity + 3 {
        let object = ctx.heap_mut().allocate_object(None);
        for extra in 0..shape {
            ctx.heap_mut().put_direct(
                object,
                format!("pad{extra}").into(),
                Value::Null,
                PropertyAttributes::DEFAULT,
            );
        }
        ctx.heap_mut()
            .put_direct(object, "x".into(), Value::Smi(shape as i32), PropertyAttributes::DEFAULT);
        objects.push(object);

        for _ in 0..2 {
            let value = execute_get_by_id(&mut ctx, frame, sites[0], Value::Cell(object)).unwrap();
            assert_eq!(value, Value::Smi(shape as i32));
            let current = rank(&state(&ctx, sites[0]));
            assert!(current >= previous, "cache shrank at shape {shape}");
            previous = current;
        }
    }
    assert!(matches!(state(&ctx, sites[0]), CacheState::Generic));

    for (shape, object) in objects.iter().enumerate() {
        let value = execute_get_by_id(&mut ctx, frame, sites[0], Value::Cell(*object)).unwrap();
        assert_eq!(value, Value::Smi(shape as i32));
    }
}

/// Test: Cached transitions build the same shape the slow path does
#[test]
fn test_cached_transition_matches_slow_path() {
    let mut ctx = VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap();
    let put = AccessKind::PutById {
        kind: PutKind::Direct,
        strict: false,
    };
    let (frame, sites) = enter(&mut ctx, FunctionBody::new().with_access(put, 0, "x"));

    let mut structures = Vec::new();
    for i in 0..4 {
        let object = ctx.heap_mut().allocate_object(None);
        execute_put_by_id(&mut ctx, frame, sites[0], Value::Cell(object), Value::Smi(i)).unwrap();
        assert_eq!(ctx.heap().lookup_property(object, "x").unwrap().value, Value::Smi(i));
        structures.push(ctx.heap().structure_of(object).unwrap().id());
    }
    assert!(structures.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(ctx.counters().inline_cache_hits >= 1);
}

/// Test: Indexed sites cache loads and appends but not holes
#[test]
fn test_indexed_sites_follow_array_length() {
    let mut ctx = VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap();
    let body = FunctionBody::new()
        .with_indexed_access(AccessKind::PutByVal { strict: true }, 0)
        .with_indexed_access(AccessKind::GetByVal, 1);
    let (frame, sites) = enter(&mut ctx, body);
    let array = Value::Cell(ctx.heap_mut().allocate_array(None, Vec::new()));

    for i in 0..8 {
        execute_put_by_val(&mut ctx, frame, sites[0], array, Value::Smi(i), Value::Smi(i + 100)).unwrap();
    }
    for i in 0..8 {
        let value = execute_get_by_val(&mut ctx, frame, sites[1], array, Value::Smi(i)).unwrap();
        assert_eq!(value, Value::Smi(i + 100));
    }
    let past_end = execute_get_by_val(&mut ctx, frame, sites[1], array, Value::Smi(8)).unwrap();
    assert_eq!(past_end, Value::Undefined);
    assert!(!matches!(state(&ctx, sites[1]), CacheState::Generic));
}
