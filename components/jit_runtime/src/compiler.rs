//! Lazy compilation.
//!
//! The runtime does not generate code itself. When a call needs code that
//! does not exist yet it asks a [`LazyCompiler`] for machine code plus the
//! layout of its patchable sites, then installs the result in the
//! executable pool.

use core_types::FunctionId;
use thiserror::Error;

use crate::function::{CodeSpecializationKind, FunctionExecutable, HandlerRange};

/// Compilation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The executable pool could not fit the code
    #[error("executable memory exhausted while compiling {0}")]
    OutOfExecutableMemory(String),

    /// The function cannot be compiled for the requested specialization
    #[error("cannot compile {function}: {reason}")]
    Unsupported {
        /// Function name
        function: String,
        /// Why not
        reason: String,
    },

    /// No such function is registered
    #[error("unknown function {0}")]
    UnknownFunction(FunctionId),

    /// Compiler output does not describe the function body
    #[error("invalid code layout: {0}")]
    InvalidLayout(String),
}

/// Placement of one patchable site in the generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteLayout {
    /// Offset of the word-sized target slot
    pub patch_offset: usize,
    /// Offset of the instruction after the site's call
    pub return_offset: usize,
}

/// Machine code for one function, before installation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCode {
    /// Raw code bytes
    pub bytes: Vec<u8>,
    /// Offset of the normal entry point
    pub entry_offset: usize,
    /// Offset of the entry point that pads missing arguments
    pub arity_check_offset: usize,
    /// One layout per call site in body order
    pub call_sites: Vec<SiteLayout>,
    /// One layout per access site in body order
    pub access_sites: Vec<SiteLayout>,
    /// Catch entry offset for each of the body's own handlers
    pub handler_entries: Vec<usize>,
    /// For each inlined frame, the callee's handlers with their catch entry
    /// offsets in this code
    pub inline_handlers: Vec<Vec<(HandlerRange, usize)>>,
}

/// Compiles a function on first call.
pub trait LazyCompiler {
    /// Produces code for `function` specialized for `kind`.
    fn compile_for(
        &mut self,
        functions: &[FunctionExecutable],
        function: FunctionId,
        kind: CodeSpecializationKind,
    ) -> Result<CompiledCode, CompileError>;
}

const INT3: u8 = 0xCC;
const NOP: u8 = 0x90;
const PROLOGUE_SIZE: usize = 32;
const SITE_SIZE: usize = 16;
const PATCH_SLOT_SIZE: usize = 8;
const LANDING_PAD_SIZE: usize = 16;

/// Template compiler: fixed-size blocks per site, no optimization.
///
/// Layout is an arity-fixup prologue, the normal entry prologue, one block
/// per call site, one per access site, then one landing pad per handler.
/// Each site block starts with its patch slot followed by the call that
/// reads it.
#[derive(Debug, Default)]
pub struct TemplateCompiler {
    compilations: u64,
    bytes_emitted: usize,
}

impl TemplateCompiler {
    /// Creates a compiler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful compilations.
    pub fn compilations(&self) -> u64 {
        self.compilations
    }

    /// Total bytes of code produced.
    pub fn bytes_emitted(&self) -> usize {
        self.bytes_emitted
    }
}

impl LazyCompiler for TemplateCompiler {
    fn compile_for(
        &mut self,
        functions: &[FunctionExecutable],
        function: FunctionId,
        kind: CodeSpecializationKind,
    ) -> Result<CompiledCode, CompileError> {
        let executable = functions
            .get(function.index())
            .ok_or(CompileError::UnknownFunction(function))?;
        if kind == CodeSpecializationKind::Construct && !executable.is_constructible() {
            return Err(CompileError::Unsupported {
                function: executable.name().to_string(),
                reason: "not a constructor".to_string(),
            });
        }
        let body = executable.body();

        let mut bytes = Vec::new();
        let arity_check_offset = emit_block(&mut bytes, PROLOGUE_SIZE, NOP);
        let entry_offset = emit_block(&mut bytes, PROLOGUE_SIZE, NOP);

        let emit_site = |bytes: &mut Vec<u8>| {
            let start = emit_block(bytes, SITE_SIZE, INT3);
            bytes[start..start + PATCH_SLOT_SIZE].fill(0);
            SiteLayout {
                patch_offset: start,
                return_offset: start + SITE_SIZE,
            }
        };
        let call_sites = body.call_sites.iter().map(|_| emit_site(&mut bytes)).collect();
        let access_sites = body
            .access_sites
            .iter()
            .map(|_| emit_site(&mut bytes))
            .collect();

        let handler_entries = body
            .handlers
            .iter()
            .map(|_| emit_block(&mut bytes, LANDING_PAD_SIZE, INT3))
            .collect();

        let mut inline_handlers = Vec::with_capacity(body.inlined.len());
        for inline in &body.inlined {
            let callee = functions
                .get(inline.callee.index())
                .ok_or(CompileError::UnknownFunction(inline.callee))?;
            let pads = callee
                .body()
                .handlers
                .iter()
                .map(|range| (*range, emit_block(&mut bytes, LANDING_PAD_SIZE, INT3)))
                .collect();
            inline_handlers.push(pads);
        }

        self.compilations += 1;
        self.bytes_emitted += bytes.len();
        tracing::debug!(
            function = executable.name(),
            ?kind,
            size = bytes.len(),
            "compiled function"
        );

        Ok(CompiledCode {
            bytes,
            entry_offset,
            arity_check_offset,
            call_sites,
            access_sites,
            handler_entries,
            inline_handlers,
        })
    }
}

fn emit_block(bytes: &mut Vec<u8>, size: usize, fill: u8) -> usize {
    let start = bytes.len();
    bytes.resize(start + size, fill);
    start
}
