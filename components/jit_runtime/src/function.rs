//! Function executables: the compile-once part of a script function.
//!
//! A [`FunctionExecutable`] is shared by every closure of the same function.
//! It records the bytecode-level description the compiler needs
//! ([`FunctionBody`]), the compiled code for each specialization, and the
//! call sites currently linked to that code.

use std::rc::Rc;

use core_types::{CodeBlockId, FunctionId};
use memory_manager::PropertyName;

use crate::compiled_unit::ReturnAddress;
use crate::stub_info::AccessKind;

/// Call or construct specialization of a function's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeSpecializationKind {
    /// `f(...)`
    Call,
    /// `new f(...)`
    Construct,
}

impl CodeSpecializationKind {
    fn index(self) -> usize {
        match self {
            CodeSpecializationKind::Call => 0,
            CodeSpecializationKind::Construct => 1,
        }
    }
}

/// A call instruction in a function body.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSiteSpec {
    /// Call or construct
    pub kind: CodeSpecializationKind,
    /// Bytecode offset of the call
    pub bytecode_offset: u32,
    /// Index into [`FunctionBody::inlined`] if the call is in inlined code
    pub inline_frame: Option<usize>,
}

/// A property access instruction in a function body.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessSiteSpec {
    /// Kind of access
    pub kind: AccessKind,
    /// Bytecode offset of the access
    pub bytecode_offset: u32,
    /// Property name for by-id accesses
    pub identifier: Option<PropertyName>,
    /// Index into [`FunctionBody::inlined`] if the access is in inlined code
    pub inline_frame: Option<usize>,
}

/// A try range in bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRange {
    /// First covered offset
    pub start: u32,
    /// One past the last covered offset
    pub end: u32,
    /// Offset of the catch block
    pub target: u32,
}

/// A function the optimizer inlined into this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineSpec {
    /// The inlined function
    pub callee: FunctionId,
    /// Offset of the inlined call in the caller
    pub call_bytecode_offset: u32,
    /// Enclosing inlined frame; must come earlier in the list
    pub parent: Option<usize>,
}

/// Compiler-facing description of a function body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionBody {
    /// Call sites in bytecode order
    pub call_sites: Vec<CallSiteSpec>,
    /// Property access sites in bytecode order
    pub access_sites: Vec<AccessSiteSpec>,
    /// Try ranges, innermost first
    pub handlers: Vec<HandlerRange>,
    /// Inlined callees
    pub inlined: Vec<InlineSpec>,
}

impl FunctionBody {
    /// Creates an empty body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a call site.
    pub fn with_call(mut self, kind: CodeSpecializationKind, bytecode_offset: u32) -> Self {
        self.call_sites.push(CallSiteSpec {
            kind,
            bytecode_offset,
            inline_frame: None,
        });
        self
    }

    /// Adds a by-id access site.
    pub fn with_access(mut self, kind: AccessKind, bytecode_offset: u32, name: &str) -> Self {
        self.access_sites.push(AccessSiteSpec {
            kind,
            bytecode_offset,
            identifier: Some(name.into()),
            inline_frame: None,
        });
        self
    }

    /// Adds a by-val access site.
    pub fn with_indexed_access(mut self, kind: AccessKind, bytecode_offset: u32) -> Self {
        self.access_sites.push(AccessSiteSpec {
            kind,
            bytecode_offset,
            identifier: None,
            inline_frame: None,
        });
        self
    }

    /// Adds a try range.
    pub fn with_handler(mut self, start: u32, end: u32, target: u32) -> Self {
        self.handlers.push(HandlerRange { start, end, target });
        self
    }

    /// Records an inlined callee and returns its frame index.
    pub fn inline(&mut self, callee: FunctionId, call_bytecode_offset: u32, parent: Option<usize>) -> usize {
        self.inlined.push(InlineSpec {
            callee,
            call_bytecode_offset,
            parent,
        });
        self.inlined.len() - 1
    }
}

/// A call site linked to a function's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingCall {
    /// Unit containing the call site
    pub caller: CodeBlockId,
    /// The call site
    pub return_address: ReturnAddress,
}

/// Shared executable state of a script function.
#[derive(Debug, Clone)]
pub struct FunctionExecutable {
    id: FunctionId,
    name: Rc<str>,
    parameter_count: u32,
    constructible: bool,
    body: FunctionBody,
    code: [Option<CodeBlockId>; 2],
    incoming: [Vec<IncomingCall>; 2],
}

impl FunctionExecutable {
    /// Creates an executable with no compiled code.
    pub fn new(id: FunctionId, name: &str, parameter_count: u32, body: FunctionBody) -> Self {
        Self {
            id,
            name: name.into(),
            parameter_count,
            constructible: true,
            body,
            code: [None, None],
            incoming: [Vec::new(), Vec::new()],
        }
    }

    /// Marks the function as not usable with `new`.
    pub fn non_constructible(mut self) -> Self {
        self.constructible = false;
        self
    }

    /// Function id.
    pub fn id(&self) -> FunctionId {
        self.id
    }

    /// Function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameter count.
    pub fn parameter_count(&self) -> u32 {
        self.parameter_count
    }

    /// Whether `new` may be used.
    pub fn is_constructible(&self) -> bool {
        self.constructible
    }

    /// Compiler-facing body.
    pub fn body(&self) -> &FunctionBody {
        &self.body
    }

    /// Compiled unit for `kind`, if compiled.
    pub fn code_for(&self, kind: CodeSpecializationKind) -> Option<CodeBlockId> {
        self.code[kind.index()]
    }

    pub(crate) fn set_code(&mut self, kind: CodeSpecializationKind, code: Option<CodeBlockId>) {
        self.code[kind.index()] = code;
    }

    /// Call sites linked to the code for `kind`.
    pub fn incoming_calls(&self, kind: CodeSpecializationKind) -> &[IncomingCall] {
        &self.incoming[kind.index()]
    }

    pub(crate) fn add_incoming_call(&mut self, kind: CodeSpecializationKind, call: IncomingCall) {
        let list = &mut self.incoming[kind.index()];
        if !list.contains(&call) {
            list.push(call);
        }
    }

    pub(crate) fn take_incoming_calls(&mut self, kind: CodeSpecializationKind) -> Vec<IncomingCall> {
        std::mem::take(&mut self.incoming[kind.index()])
    }

    /// Forgets every incoming call whose site lies in `caller`.
    pub(crate) fn remove_incoming_calls_from(&mut self, caller: CodeBlockId) {
        for list in &mut self.incoming {
            list.retain(|call| call.caller != caller);
        }
    }
}
