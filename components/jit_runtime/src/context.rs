//! The VM instance context.
//!
//! [`VmContext`] owns everything one VM instance's compiled code runs
//! against: the executable pool, the object heap, registered functions,
//! installed code, the frame arena and the two scratch slots operations
//! communicate through (the exception slot and the host-call return slot).

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use core_types::{CodeBlockId, FunctionId, HostFunctionId, JsError, Value};
use memory_manager::{
    AllocationEffort, ExecutableAllocator, ExecutableMemoryHandle, ObjectHeap, ObjectKind,
    OwnerTag,
};
use parking_lot::Mutex;

use crate::call_frame::{CallFrame, FrameIndex, FrameStack};
use crate::compiled_unit::{CompiledUnit, ReturnAddress};
use crate::compiler::{CompileError, LazyCompiler, TemplateCompiler};
use crate::config::{AllocationPolicy, JitConfig};
use crate::error::{Exception, RuntimeError};
use crate::function::{CodeSpecializationKind, FunctionBody, FunctionExecutable};
use crate::host::HostFunction;
use crate::operations::{OperationBridge, OperationId, OperationOutcome, OperationSite};
use crate::thunks::Thunks;
use crate::trampoline::Architecture;

/// Pool pressure at which compilation first reclaims dead code.
const PROACTIVE_RECLAIM_PRESSURE: f64 = 2.0;

/// Slow-path counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeCounters {
    /// Functions compiled
    pub compilations: u64,
    /// Compilations that failed
    pub compile_failures: u64,
    /// Call sites linked
    pub calls_linked: u64,
    /// Call sites reverted to virtual
    pub calls_unlinked: u64,
    /// Calls that took a linked direct jump
    pub linked_call_hits: u64,
    /// Calls resolved through the virtual path
    pub virtual_calls: u64,
    /// Host functions invoked
    pub host_calls: u64,
    /// Generic property lookups
    pub generic_lookups: u64,
    /// Accesses satisfied by a stub routine
    pub inline_cache_hits: u64,
    /// Access sites repatched
    pub repatches: u64,
    /// Compiled units discarded
    pub code_discarded: u64,
}

/// What a callee value resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    /// Script function with an executable
    Script(FunctionId),
    /// Native host function
    Host(HostFunctionId),
}

/// One VM instance.
pub struct VmContext {
    config: JitConfig,
    allocator: ExecutableAllocator,
    heap: ObjectHeap,
    functions: Vec<FunctionExecutable>,
    host_functions: Vec<HostFunction>,
    code_blocks: BTreeMap<CodeBlockId, CompiledUnit>,
    jettisoned: Vec<CompiledUnit>,
    retired: Arc<Mutex<Vec<ExecutableMemoryHandle>>>,
    next_code_block: u32,
    frames: FrameStack,
    top_call_frame: Option<FrameIndex>,
    exception: Option<Exception>,
    host_call_return_value: Value,
    compiler: Box<dyn LazyCompiler>,
    thunks: Thunks,
    bridge: Rc<OperationBridge>,
    counters: RuntimeCounters,
}

impl VmContext {
    /// Creates a context with the template compiler.
    pub fn new(config: JitConfig) -> Result<Self, RuntimeError> {
        Self::with_compiler(config, Box::new(TemplateCompiler::new()))
    }

    /// Creates a context that compiles with `compiler`.
    pub fn with_compiler(
        config: JitConfig,
        compiler: Box<dyn LazyCompiler>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let allocator = ExecutableAllocator::initialize(config.pool_size)?;
        let thunks = Thunks::generate(&allocator).ok_or(RuntimeError::ThunkAllocation)?;

        let retired: Arc<Mutex<Vec<ExecutableMemoryHandle>>> = Arc::default();
        let queue = Arc::clone(&retired);
        allocator.set_reclaimer(move || {
            let freed = queue.lock().drain(..).count();
            tracing::debug!(freed, "released retired code");
        });

        tracing::info!(
            pool_size = config.pool_size,
            policy = ?config.allocation_policy,
            architecture = ?Architecture::host(),
            "VM context initialized"
        );

        Ok(VmContext {
            frames: FrameStack::new(config.max_call_depth),
            config,
            allocator,
            heap: ObjectHeap::new(),
            functions: Vec::new(),
            host_functions: Vec::new(),
            code_blocks: BTreeMap::new(),
            jettisoned: Vec::new(),
            retired,
            next_code_block: 0,
            top_call_frame: None,
            exception: None,
            host_call_return_value: Value::Undefined,
            compiler,
            thunks,
            bridge: Rc::new(OperationBridge::new(Architecture::host())),
            counters: RuntimeCounters::default(),
        })
    }

    /// The configuration in effect.
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// The executable pool.
    pub fn allocator(&self) -> &ExecutableAllocator {
        &self.allocator
    }

    /// The object heap.
    pub fn heap(&self) -> &ObjectHeap {
        &self.heap
    }

    /// The object heap, mutably.
    pub fn heap_mut(&mut self) -> &mut ObjectHeap {
        &mut self.heap
    }

    /// The frame arena.
    pub fn frames(&self) -> &FrameStack {
        &self.frames
    }

    /// The frame arena, mutably.
    pub fn frames_mut(&mut self) -> &mut FrameStack {
        &mut self.frames
    }

    /// Shared thunk addresses.
    pub fn thunks(&self) -> &Thunks {
        &self.thunks
    }

    /// Slow-path counters.
    pub fn counters(&self) -> RuntimeCounters {
        self.counters
    }

    pub(crate) fn counters_mut(&mut self) -> &mut RuntimeCounters {
        &mut self.counters
    }

    /// Frame that last called into the runtime.
    pub fn top_call_frame(&self) -> Option<FrameIndex> {
        self.top_call_frame
    }

    pub(crate) fn set_top_call_frame(&mut self, frame: FrameIndex) {
        self.top_call_frame = Some(frame);
    }

    // Functions

    /// Registers a script function.
    pub fn define_function(
        &mut self,
        name: &str,
        parameter_count: u32,
        body: FunctionBody,
    ) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions
            .push(FunctionExecutable::new(id, name, parameter_count, body));
        id
    }

    /// Registers a script function that cannot be used with `new`.
    pub fn define_non_constructible_function(
        &mut self,
        name: &str,
        parameter_count: u32,
        body: FunctionBody,
    ) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(
            FunctionExecutable::new(id, name, parameter_count, body).non_constructible(),
        );
        id
    }

    /// Looks up a script function.
    pub fn function(&self, id: FunctionId) -> Option<&FunctionExecutable> {
        self.functions.get(id.index())
    }

    pub(crate) fn function_mut(&mut self, id: FunctionId) -> Option<&mut FunctionExecutable> {
        self.functions.get_mut(id.index())
    }

    /// Allocates a function object for `id`.
    pub fn instantiate_function(&mut self, id: FunctionId) -> Value {
        Value::Cell(self.heap.allocate_function(id, None))
    }

    /// Registers a host function.
    pub fn define_host_function(&mut self, function: HostFunction) -> HostFunctionId {
        let id = HostFunctionId(self.host_functions.len() as u32);
        self.host_functions.push(function);
        id
    }

    /// Looks up a host function.
    pub fn host_function(&self, id: HostFunctionId) -> Option<&HostFunction> {
        self.host_functions.get(id.index())
    }

    /// Allocates a function object for host function `id`.
    pub fn instantiate_host_function(&mut self, id: HostFunctionId) -> Value {
        Value::Cell(self.heap.allocate_host_function(id, None))
    }

    /// Classifies a callee value. `None` if it is not callable.
    pub fn resolve_callee(&self, value: Value) -> Option<Callee> {
        let object = self.heap.object(value.as_cell()?)?;
        match object.kind() {
            ObjectKind::Function(id) => Some(Callee::Script(id)),
            ObjectKind::HostFunction(id) => Some(Callee::Host(id)),
            ObjectKind::Ordinary | ObjectKind::Array => None,
        }
    }

    /// Runs a host function with the given receiver and arguments.
    pub(crate) fn invoke_host(
        &mut self,
        id: HostFunctionId,
        this: Value,
        arguments: &[Value],
    ) -> Result<Value, JsError> {
        let function = self
            .host_functions
            .get(id.index())
            .cloned()
            .ok_or_else(|| JsError::internal(format!("unknown host function {id}")))?;
        self.counters.host_calls += 1;
        let mut call = crate::host::HostCall {
            heap: &mut self.heap,
            this,
            arguments,
        };
        function.invoke(&mut call)
    }

    // Compiled code

    /// Returns the code for `function` specialized for `kind`, compiling and
    /// installing it first if needed.
    pub fn compile_for(
        &mut self,
        function: FunctionId,
        kind: CodeSpecializationKind,
    ) -> Result<CodeBlockId, CompileError> {
        let executable = self
            .functions
            .get(function.index())
            .ok_or(CompileError::UnknownFunction(function))?;
        if let Some(existing) = executable.code_for(kind) {
            return Ok(existing);
        }

        let result = self.compile_and_install(function, kind);
        match &result {
            Ok(id) => {
                self.counters.compilations += 1;
                tracing::debug!(%function, ?kind, code_block = %id, "installed compiled code");
            }
            Err(err) => {
                self.counters.compile_failures += 1;
                tracing::warn!(%function, ?kind, error = %err, "compilation failed");
            }
        }
        result
    }

    fn compile_and_install(
        &mut self,
        function: FunctionId,
        kind: CodeSpecializationKind,
    ) -> Result<CodeBlockId, CompileError> {
        let compiled = self.compiler.compile_for(&self.functions, function, kind)?;

        if self.allocator.memory_pressure() >= PROACTIVE_RECLAIM_PRESSURE {
            self.reclaim();
        } else {
            self.collect_dead_code();
        }
        let effort = match self.config.allocation_policy {
            AllocationPolicy::Soft => AllocationEffort::MaySucceed,
            AllocationPolicy::Hard => AllocationEffort::MustSucceed,
        };
        let executable = &self.functions[function.index()];
        let handle = self
            .allocator
            .allocate(compiled.bytes.len(), OwnerTag::CompiledCode(function), effort)
            .ok_or_else(|| CompileError::OutOfExecutableMemory(executable.name().to_string()))?;

        let id = CodeBlockId(self.next_code_block);
        let unit = CompiledUnit::link(
            id,
            function,
            kind,
            executable.parameter_count(),
            handle,
            &compiled,
            executable.body(),
            self.thunks.initial_targets(),
            self.config.polymorphic_list_capacity,
        )?;
        self.next_code_block += 1;
        self.code_blocks.insert(id, unit);
        self.functions[function.index()].set_code(kind, Some(id));
        Ok(id)
    }

    /// Looks up an installed or discarded-but-running unit.
    pub fn code_block(&self, id: CodeBlockId) -> Option<&CompiledUnit> {
        self.code_blocks
            .get(&id)
            .or_else(|| self.jettisoned.iter().find(|unit| unit.id() == id))
    }

    /// Mutable variant of [`code_block`](Self::code_block).
    pub fn code_block_mut(&mut self, id: CodeBlockId) -> Option<&mut CompiledUnit> {
        match self.code_blocks.get_mut(&id) {
            Some(unit) => Some(unit),
            None => self.jettisoned.iter_mut().find(|unit| unit.id() == id),
        }
    }

    /// Finds the unit whose code contains `address`.
    pub fn code_block_for_address(&self, address: usize) -> Option<&CompiledUnit> {
        self.code_blocks
            .values()
            .chain(&self.jettisoned)
            .find(|unit| unit.contains(address))
    }

    /// The unit running in `frame`.
    pub fn frame_code_block(&self, frame: FrameIndex) -> Option<CodeBlockId> {
        self.frames.get(frame)?.code_block
    }

    /// Number of installed units.
    pub fn installed_code_count(&self) -> usize {
        self.code_blocks.len()
    }

    /// Discards the code of `function` for `kind`.
    ///
    /// Every call site linked to it reverts to the virtual path. If a frame
    /// is still running the code its metadata stays available until that
    /// frame is gone; otherwise the memory is retired at once. Returns false
    /// if there was no code.
    pub fn discard_code(&mut self, function: FunctionId, kind: CodeSpecializationKind) -> bool {
        let Some(executable) = self.functions.get_mut(function.index()) else {
            return false;
        };
        let Some(block) = executable.code_for(kind) else {
            return false;
        };
        executable.set_code(kind, None);
        let incoming = executable.take_incoming_calls(kind);

        for call in &incoming {
            self.unlink_call_site(call.caller, call.return_address, block);
        }
        if let Some(unit) = self.code_blocks.remove(&block) {
            if self.frames.is_running(block) {
                self.jettisoned.push(unit);
            } else {
                self.retire(unit);
            }
        }
        self.counters.code_discarded += 1;
        tracing::debug!(%function, ?kind, code_block = %block, unlinked = incoming.len(), "discarded code");
        true
    }

    fn unlink_call_site(
        &mut self,
        caller: CodeBlockId,
        return_address: ReturnAddress,
        target_block: CodeBlockId,
    ) {
        let virtual_call = self.thunks.virtual_call();
        let Some(unit) = self.code_block_mut(caller) else {
            return;
        };
        let Some(info) = unit.call_link_info_mut(return_address) else {
            return;
        };
        if info.linked().map(|link| link.code_block) != Some(target_block) {
            return;
        }
        info.unlink();
        let patch_offset = info.patch_offset();
        if let Err(err) = unit.write_patch_slot(patch_offset, virtual_call) {
            tracing::warn!(error = %err, "failed to unlink call site");
        }
        self.counters.calls_unlinked += 1;
    }

    /// Retires discarded units no frame is running any more.
    pub fn collect_dead_code(&mut self) {
        if self.jettisoned.is_empty() {
            return;
        }
        let (running, dead): (Vec<_>, Vec<_>) = std::mem::take(&mut self.jettisoned)
            .into_iter()
            .partition(|unit| self.frames.is_running(unit.id()));
        self.jettisoned = running;
        for unit in dead {
            self.retire(unit);
        }
    }

    /// Queues the memory of `unit` for freeing and drops the incoming-call
    /// records its linked sites left in their callees.
    fn retire(&mut self, unit: CompiledUnit) {
        for (_, info) in unit.call_links() {
            if let Some(linked) = info.linked() {
                if let Some(callee) = self.functions.get_mut(linked.callee.index()) {
                    callee.remove_incoming_calls_from(unit.id());
                }
            }
        }
        self.retired.lock().push(unit.into_code());
    }

    /// Retires dead code and frees everything retired.
    pub fn reclaim(&mut self) {
        self.collect_dead_code();
        self.allocator.reclaim();
    }

    /// Number of retired code ranges not yet freed.
    pub fn retired_code_count(&self) -> usize {
        self.retired.lock().len()
    }

    // Frames

    /// Enters `callee` from outside compiled code, compiling it if needed.
    ///
    /// This is the VM's entry path into compiled code; calls made from
    /// compiled code go through the call-link operations instead.
    pub fn enter_function(
        &mut self,
        callee: Value,
        this: Value,
        arguments: Vec<Value>,
    ) -> Result<FrameIndex, JsError> {
        let Some(Callee::Script(function)) = self.resolve_callee(callee) else {
            return Err(JsError::type_error(format!(
                "{} is not a compiled function",
                callee.type_name()
            )));
        };
        let block = self
            .compile_for(function, CodeSpecializationKind::Call)
            .map_err(|_| JsError::stack_overflow())?;
        let frame = self.frames.push(CallFrame::new(callee, this, arguments))?;
        if let Some(entered) = self.frames.get_mut(frame) {
            entered.code_block = Some(block);
        }
        Ok(frame)
    }

    /// Pops `frame`, which must be the innermost frame.
    pub fn leave_frame(&mut self, frame: FrameIndex) -> Option<CallFrame> {
        if self.frames.top() != Some(frame) {
            tracing::warn!(?frame, top = ?self.frames.top(), "frame left out of order");
            return None;
        }
        self.frames.pop()
    }

    // Scratch slots

    /// Sets the exception slot to a runtime error.
    pub fn throw(&mut self, error: JsError) {
        tracing::trace!(%error, "exception raised");
        self.exception = Some(Exception::Error(error));
    }

    /// Sets the exception slot to a script value.
    pub fn throw_value(&mut self, value: Value) {
        self.exception = Some(Exception::Value(value));
    }

    /// The pending exception.
    pub fn exception(&self) -> Option<&Exception> {
        self.exception.as_ref()
    }

    /// Returns true if an exception is pending.
    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Takes the pending exception, clearing the slot.
    pub fn take_exception(&mut self) -> Option<Exception> {
        self.exception.take()
    }

    /// The value the last host call returned.
    pub fn host_call_return_value(&self) -> Value {
        self.host_call_return_value
    }

    pub(crate) fn set_host_call_return_value(&mut self, value: Value) {
        self.host_call_return_value = value;
    }

    // Operations

    /// Calls a runtime operation the way generated code does.
    pub fn call_operation(
        &mut self,
        id: OperationId,
        site: OperationSite,
        arguments: &[u64],
    ) -> OperationOutcome {
        let bridge = Rc::clone(&self.bridge);
        bridge.call(self, id, site, arguments)
    }
}

impl Drop for VmContext {
    fn drop(&mut self) {
        // Retired handles point back into the pool, whose reclaimer owns
        // this queue; empty it so the pool can be released.
        self.retired.lock().clear();
    }
}

impl fmt::Debug for VmContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmContext")
            .field("allocator", &self.allocator)
            .field("functions", &self.functions.len())
            .field("code_blocks", &self.code_blocks.len())
            .field("frames", &self.frames.depth())
            .field("exception", &self.exception)
            .field("counters", &self.counters)
            .finish()
    }
}
