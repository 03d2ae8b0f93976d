//! JIT Runtime - the runtime half of a tiered JavaScript JIT
//!
//! Generated code leans on this crate for everything it cannot do inline:
//! - Installing compiled code in the executable pool and retiring it again
//! - Linking call sites to their callees once a call site settles
//! - Inline caches for property reads and writes, repatched as shapes are seen
//! - The operation catalogue and its per-architecture calling convention
//! - Finding the handler for a throw, through inlined and calling frames
//!
//! # Examples
//!
//! ```
//! use core_types::Value;
//! use jit_runtime::{FunctionBody, JitConfig, VmContext};
//!
//! let mut ctx = VmContext::new(JitConfig::with_pool_size(256 * 1024)).unwrap();
//! let f = ctx.define_function("f", 0, FunctionBody::new());
//! let callee = ctx.instantiate_function(f);
//! let frame = ctx.enter_function(callee, Value::Undefined, vec![]).unwrap();
//! assert!(ctx.frame_code_block(frame).is_some());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod call_frame;
pub mod call_link;
pub mod code_origin;
pub mod codegen_model;
pub mod compiled_unit;
pub mod compiler;
pub mod config;
pub mod context;
pub mod error;
pub mod exception;
pub mod function;
pub mod host;
pub mod operations;
pub mod property_access;
pub mod repatch;
pub mod stub_info;
pub mod thunks;
pub mod trampoline;

// Re-export main types
pub use call_frame::{CallFrame, FrameIndex, FrameStack};
pub use call_link::{CallLinkInfo, CodePtr, LinkedTarget};
pub use code_origin::{CodeOrigin, HandlerInfo, HandlerTable, InlineCallFrame};
pub use codegen_model::{
    execute_call, execute_get_by_id, execute_get_by_val, execute_put_by_id, execute_put_by_val,
    return_from_call, unwind, CallOutcome, Landing, PendingException,
};
pub use compiled_unit::{CompiledUnit, ReturnAddress};
pub use compiler::{CompileError, CompiledCode, LazyCompiler, SiteLayout, TemplateCompiler};
pub use config::{AllocationPolicy, ConfigError, JitConfig};
pub use context::{Callee, RuntimeCounters, VmContext};
pub use error::{Exception, RuntimeError};
pub use exception::{HandlerTarget, PackedHandler};
pub use function::{CodeSpecializationKind, FunctionBody, FunctionExecutable};
pub use host::{HostCall, HostFunction, NativeFunction};
pub use operations::{
    OperationBridge, OperationId, OperationOutcome, OperationSignature, OperationSite,
    OperationTable, ReturnKind,
};
pub use repatch::StubRoutine;
pub use stub_info::{
    AccessKind, CacheEntry, CacheState, CacheUpdate, CachedAccess, PutKind, StubInfo,
    MAX_POLYMORPHIC_CAPACITY,
};
pub use thunks::Thunks;
pub use trampoline::{Architecture, MachineState, NativeCall, TrampolineError};
