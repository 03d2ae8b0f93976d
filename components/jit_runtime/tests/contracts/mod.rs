//! Contract tests for the jit_runtime API
//!
//! These tests pin the observable behaviour generated code relies on: the
//! operation signatures, the exception sentinel, and the cache transitions
//! of an access site.

use core_types::{ErrorKind, Value};
use jit_runtime::{
    execute_get_by_id, execute_put_by_id, AccessKind, Architecture, CacheState,
    CodeSpecializationKind, FrameIndex, FunctionBody, JitConfig, OperationBridge, OperationId,
    OperationSite, OperationTable, PackedHandler, PutKind, ReturnAddress, ReturnKind, VmContext,
};
use memory_manager::PropertyAttributes;

fn context() -> VmContext {
    VmContext::new(JitConfig::with_pool_size(512 * 1024)).unwrap()
}

fn enter_with_access(ctx: &mut VmContext, access: AccessKind) -> (FrameIndex, ReturnAddress) {
    let f = ctx.define_function("f", 0, FunctionBody::new().with_access(access, 0, "x"));
    let value = ctx.instantiate_function(f);
    let frame = ctx.enter_function(value, Value::Undefined, vec![]).unwrap();
    let site = ctx
        .code_block(ctx.frame_code_block(frame).unwrap())
        .unwrap()
        .access_site(0)
        .unwrap();
    (frame, site)
}

/// Every catalogued operation has a signature the bridge can call.
#[test]
fn contract_operation_signatures() {
    let table = OperationTable::standard();
    let expect = [
        (OperationId::LinkCall, 0, ReturnKind::Pointer),
        (OperationId::VirtualConstruct, 0, ReturnKind::Pointer),
        (OperationId::GetHostCallReturnValue, 0, ReturnKind::EncodedValue),
        (OperationId::GetById, 1, ReturnKind::EncodedValue),
        (OperationId::PutByIdStrict, 2, ReturnKind::Void),
        (OperationId::GetByVal, 2, ReturnKind::EncodedValue),
        (OperationId::PutByValOptimize, 3, ReturnKind::Void),
        (OperationId::HasProperty, 2, ReturnKind::Boolean),
        (OperationId::LookupExceptionHandler, 0, ReturnKind::Pointer),
    ];
    for (id, arity, returns) in expect {
        let signature = table.get(id).signature();
        assert_eq!(signature.arity, arity, "{id:?}");
        assert_eq!(signature.returns, returns, "{id:?}");
    }
    for id in OperationId::ALL {
        let signature = table.get(id).signature();
        let is_lookup = matches!(
            id,
            OperationId::LookupExceptionHandler | OperationId::LookupExceptionHandlerFromCaller
        );
        assert_eq!(signature.expects_pending_exception, is_lookup, "{id:?}");
    }
}

/// A failing operation returns the empty word and leaves the exception set.
#[test]
fn contract_exception_sentinel() {
    let mut ctx = context();
    let (frame, site) = enter_with_access(&mut ctx, AccessKind::GetById);
    let outcome = ctx.call_operation(
        OperationId::GetByIdOptimize,
        OperationSite {
            frame,
            return_address: site,
        },
        &[Value::Null.encode().bits()],
    );
    assert_eq!(outcome.word, 0);
    assert!(outcome.exception_pending);
    assert!(ctx.has_exception());
}

/// Scenario: strict put to a read-only property throws, sloppy does nothing.
#[test]
fn contract_read_only_put_by_id() {
    let mut ctx = context();
    let object = ctx.heap_mut().allocate_object(None);
    ctx.heap_mut()
        .put_direct(object, "x".into(), Value::Smi(1), PropertyAttributes::READ_ONLY);

    let (frame, strict_site) = enter_with_access(
        &mut ctx,
        AccessKind::PutById {
            kind: PutKind::Ordinary,
            strict: true,
        },
    );
    let pending =
        execute_put_by_id(&mut ctx, frame, strict_site, Value::Cell(object), Value::Smi(2)).unwrap_err();
    assert_eq!(pending.site, Some(strict_site));
    let error = ctx.take_exception().unwrap();
    assert_eq!(error.as_error().map(|e| e.kind), Some(ErrorKind::TypeError));

    let (frame, sloppy_site) = enter_with_access(
        &mut ctx,
        AccessKind::PutById {
            kind: PutKind::Ordinary,
            strict: false,
        },
    );
    execute_put_by_id(&mut ctx, frame, sloppy_site, Value::Cell(object), Value::Smi(2)).unwrap();
    assert!(!ctx.has_exception());
    assert_eq!(ctx.heap().lookup_property(object, "x").unwrap().value, Value::Smi(1));
}

/// Scenario: shape A twice, then shape B gives a two-entry list that
/// serves both without going generic.
#[test]
fn contract_monomorphic_to_polymorphic() {
    let mut ctx = context();
    let (frame, site) = enter_with_access(&mut ctx, AccessKind::GetById);
    let a = ctx.heap_mut().allocate_object(None);
    ctx.heap_mut()
        .put_direct(a, "x".into(), Value::Smi(1), PropertyAttributes::DEFAULT);
    let b = ctx.heap_mut().allocate_object(None);
    ctx.heap_mut()
        .put_direct(b, "y".into(), Value::Smi(0), PropertyAttributes::DEFAULT);
    ctx.heap_mut()
        .put_direct(b, "x".into(), Value::Smi(2), PropertyAttributes::DEFAULT);

    let state = |ctx: &VmContext| {
        ctx.code_block_for_address(site.0)
            .and_then(|unit| unit.stub_info(site))
            .map(|info| info.state().clone())
            .unwrap()
    };

    execute_get_by_id(&mut ctx, frame, site, Value::Cell(a)).unwrap();
    assert!(matches!(state(&ctx), CacheState::Virgin));
    execute_get_by_id(&mut ctx, frame, site, Value::Cell(a)).unwrap();
    assert!(matches!(state(&ctx), CacheState::Monomorphic(_)));
    execute_get_by_id(&mut ctx, frame, site, Value::Cell(b)).unwrap();
    assert!(matches!(state(&ctx), CacheState::Polymorphic(ref entries) if entries.len() == 2));

    let hits = ctx.counters().inline_cache_hits;
    assert_eq!(execute_get_by_id(&mut ctx, frame, site, Value::Cell(a)), Ok(Value::Smi(1)));
    assert_eq!(execute_get_by_id(&mut ctx, frame, site, Value::Cell(b)), Ok(Value::Smi(2)));
    assert_eq!(ctx.counters().inline_cache_hits, hits + 2);
}

/// Compiling is idempotent per specialization.
#[test]
fn contract_compile_for_is_idempotent() {
    let mut ctx = context();
    let f = ctx.define_function("f", 1, FunctionBody::new());
    let first = ctx.compile_for(f, CodeSpecializationKind::Call).unwrap();
    let second = ctx.compile_for(f, CodeSpecializationKind::Call).unwrap();
    let construct = ctx.compile_for(f, CodeSpecializationKind::Construct).unwrap();
    assert_eq!(first, second);
    assert_ne!(first, construct);
    assert_eq!(ctx.counters().compilations, 2);
}

/// Handler words survive packing for any pool base.
#[test]
fn contract_packed_handler() {
    assert!(PackedHandler::NONE.is_none());
    let packed = PackedHandler::pack(FrameIndex(0), 0x7000_1234, 0x7000_0000).unwrap();
    assert_eq!(packed.unpack(0x7000_0000), Some((FrameIndex(0), 0x7000_1234)));
}

/// The bridge behaves the same on every supported architecture.
#[test]
fn contract_bridge_architectures() {
    for arch in [
        Architecture::X86_64,
        Architecture::Aarch64,
        Architecture::X86,
        Architecture::Arm32,
    ] {
        let mut ctx = context();
        let (frame, site) = enter_with_access(&mut ctx, AccessKind::GetById);
        let object = ctx.heap_mut().allocate_object(None);
        ctx.heap_mut()
            .put_direct(object, "x".into(), Value::Smi(4), PropertyAttributes::DEFAULT);
        let outcome = OperationBridge::new(arch).call(
            &mut ctx,
            OperationId::GetById,
            OperationSite {
                frame,
                return_address: site,
            },
            &[Value::Cell(object).encode().bits()],
        );
        assert_eq!(outcome.value(), Some(Value::Smi(4)), "{arch:?}");
    }
}
