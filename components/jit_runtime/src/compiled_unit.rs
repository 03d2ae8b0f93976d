//! Compiled units: installed machine code plus its runtime metadata.
//!
//! A unit owns its code's [`ExecutableMemoryHandle`] and the per-site
//! metadata the slow paths need, keyed by the return address of the call
//! instruction that enters the runtime from that site.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use core_types::{CodeBlockId, FunctionId};
use memory_manager::{AllocatorError, ExecutableMemoryHandle, PropertyName};

use crate::call_link::CallLinkInfo;
use crate::code_origin::{CodeOrigin, HandlerInfo, HandlerTable, InlineCallFrame};
use crate::compiler::{CompileError, CompiledCode};
use crate::function::{CodeSpecializationKind, FunctionBody};
use crate::stub_info::StubInfo;

/// Address of the instruction after a call into the runtime.
///
/// Identifies the site that made the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReturnAddress(pub usize);

impl fmt::Display for ReturnAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Where freshly installed sites initially point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialTargets {
    /// Target of unlinked call sites
    pub call: usize,
    /// Target of uncached access sites
    pub access: usize,
}

/// Installed code for one function specialization.
pub struct CompiledUnit {
    id: CodeBlockId,
    owner: FunctionId,
    kind: CodeSpecializationKind,
    parameter_count: u32,
    code: ExecutableMemoryHandle,
    entry_offset: usize,
    arity_check_offset: usize,
    call_links: BTreeMap<ReturnAddress, CallLinkInfo>,
    stub_infos: BTreeMap<ReturnAddress, StubInfo>,
    call_order: Vec<ReturnAddress>,
    access_order: Vec<ReturnAddress>,
    handlers: HandlerTable,
    inline_frames: Vec<Rc<InlineCallFrame>>,
    identifiers: Vec<PropertyName>,
}

fn layout_error(message: impl Into<String>) -> CompileError {
    CompileError::InvalidLayout(message.into())
}

impl CompiledUnit {
    /// Installs compiler output into `code` and builds the unit's metadata.
    ///
    /// Copies the machine code, resolves every code offset to an absolute
    /// address and points every patch slot at its initial target.
    #[allow(clippy::too_many_arguments)]
    pub fn link(
        id: CodeBlockId,
        owner: FunctionId,
        kind: CodeSpecializationKind,
        parameter_count: u32,
        mut code: ExecutableMemoryHandle,
        compiled: &CompiledCode,
        body: &FunctionBody,
        initial: InitialTargets,
        polymorphic_capacity: usize,
    ) -> Result<CompiledUnit, CompileError> {
        if compiled.call_sites.len() != body.call_sites.len()
            || compiled.access_sites.len() != body.access_sites.len()
            || compiled.handler_entries.len() != body.handlers.len()
            || compiled.inline_handlers.len() != body.inlined.len()
        {
            return Err(layout_error("site tables do not match the function body"));
        }
        let write_err = |err: AllocatorError| layout_error(err.to_string());
        code.write(0, &compiled.bytes).map_err(write_err)?;
        let base = code.start();

        let inline_frames = build_inline_frames(base, compiled, body)?;
        let origin = |bytecode_offset: u32, frame: Option<usize>| match frame {
            None => Ok(CodeOrigin::new(bytecode_offset)),
            Some(index) => inline_frames
                .get(index)
                .map(|frame| CodeOrigin::inlined(bytecode_offset, Rc::clone(frame)))
                .ok_or_else(|| layout_error(format!("no inlined frame {index}"))),
        };

        let mut call_links = BTreeMap::new();
        let mut call_order = Vec::with_capacity(body.call_sites.len());
        for (spec, layout) in body.call_sites.iter().zip(&compiled.call_sites) {
            code.write_word(layout.patch_offset, initial.call as u64)
                .map_err(write_err)?;
            let return_address = ReturnAddress(base + layout.return_offset);
            let info = CallLinkInfo::new(
                spec.kind,
                origin(spec.bytecode_offset, spec.inline_frame)?,
                layout.patch_offset,
            );
            call_links.insert(return_address, info);
            call_order.push(return_address);
        }

        let mut stub_infos = BTreeMap::new();
        let mut access_order = Vec::with_capacity(body.access_sites.len());
        let mut identifiers: Vec<PropertyName> = Vec::new();
        for (spec, layout) in body.access_sites.iter().zip(&compiled.access_sites) {
            code.write_word(layout.patch_offset, initial.access as u64)
                .map_err(write_err)?;
            if spec.kind.is_by_id() && spec.identifier.is_none() {
                return Err(layout_error(format!(
                    "by-id access at bytecode {} has no identifier",
                    spec.bytecode_offset
                )));
            }
            if let Some(name) = &spec.identifier {
                if !identifiers.contains(name) {
                    identifiers.push(Rc::clone(name));
                }
            }
            let return_address = ReturnAddress(base + layout.return_offset);
            let info = StubInfo::new(
                spec.kind,
                spec.identifier.clone(),
                origin(spec.bytecode_offset, spec.inline_frame)?,
                layout.patch_offset,
                polymorphic_capacity,
            );
            stub_infos.insert(return_address, info);
            access_order.push(return_address);
        }

        let handlers = HandlerTable::new(
            body.handlers
                .iter()
                .zip(&compiled.handler_entries)
                .map(|(range, &entry)| HandlerInfo {
                    start: range.start,
                    end: range.end,
                    target: range.target,
                    catch_entry: base + entry,
                })
                .collect(),
        );

        Ok(CompiledUnit {
            id,
            owner,
            kind,
            parameter_count,
            code,
            entry_offset: compiled.entry_offset,
            arity_check_offset: compiled.arity_check_offset,
            call_links,
            stub_infos,
            call_order,
            access_order,
            handlers,
            inline_frames,
            identifiers,
        })
    }

    /// Unit id.
    pub fn id(&self) -> CodeBlockId {
        self.id
    }

    /// Function this unit was compiled from.
    pub fn owner(&self) -> FunctionId {
        self.owner
    }

    /// Call or construct specialization.
    pub fn kind(&self) -> CodeSpecializationKind {
        self.kind
    }

    /// Declared parameter count of the owner.
    pub fn parameter_count(&self) -> u32 {
        self.parameter_count
    }

    /// First byte of the unit's code.
    pub fn code_start(&self) -> usize {
        self.code.start()
    }

    /// Returns true if `address` is inside the unit's code.
    pub fn contains(&self, address: usize) -> bool {
        self.code.contains(address)
    }

    /// Entry point for calls that pass at least `parameter_count` arguments.
    pub fn entry_address(&self) -> usize {
        self.code.start() + self.entry_offset
    }

    /// Entry point that pads missing arguments first.
    pub fn arity_check_address(&self) -> usize {
        self.code.start() + self.arity_check_offset
    }

    /// Entry point for a call passing `argument_count` arguments.
    pub fn entry_for(&self, argument_count: u32) -> usize {
        if argument_count < self.parameter_count {
            self.arity_check_address()
        } else {
            self.entry_address()
        }
    }

    /// Call-site metadata.
    pub fn call_link_info(&self, return_address: ReturnAddress) -> Option<&CallLinkInfo> {
        self.call_links.get(&return_address)
    }

    /// Call-site metadata, mutably.
    pub fn call_link_info_mut(
        &mut self,
        return_address: ReturnAddress,
    ) -> Option<&mut CallLinkInfo> {
        self.call_links.get_mut(&return_address)
    }

    /// All call sites.
    pub fn call_links(&self) -> impl Iterator<Item = (&ReturnAddress, &CallLinkInfo)> {
        self.call_links.iter()
    }

    /// Return address of the `index`th call site in body order.
    pub fn call_site(&self, index: usize) -> Option<ReturnAddress> {
        self.call_order.get(index).copied()
    }

    /// Access-site metadata.
    pub fn stub_info(&self, return_address: ReturnAddress) -> Option<&StubInfo> {
        self.stub_infos.get(&return_address)
    }

    /// Access-site metadata, mutably.
    pub fn stub_info_mut(&mut self, return_address: ReturnAddress) -> Option<&mut StubInfo> {
        self.stub_infos.get_mut(&return_address)
    }

    /// All access sites.
    pub fn stub_infos(&self) -> impl Iterator<Item = (&ReturnAddress, &StubInfo)> {
        self.stub_infos.iter()
    }

    /// Return address of the `index`th access site in body order.
    pub fn access_site(&self, index: usize) -> Option<ReturnAddress> {
        self.access_order.get(index).copied()
    }

    /// The owner's own handler table.
    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Records of functions inlined into this unit.
    pub fn inline_frames(&self) -> &[Rc<InlineCallFrame>] {
        &self.inline_frames
    }

    /// Property names used by by-id sites.
    pub fn identifiers(&self) -> &[PropertyName] {
        &self.identifiers
    }

    /// Bytecode position of the site that returns to `return_address`.
    pub fn code_origin_for(&self, return_address: ReturnAddress) -> Option<CodeOrigin> {
        self.call_links
            .get(&return_address)
            .map(|info| info.origin().clone())
            .or_else(|| {
                self.stub_infos
                    .get(&return_address)
                    .map(|info| info.origin().clone())
            })
    }

    /// Reads a patch slot.
    pub fn read_patch_slot(&self, offset: usize) -> Option<usize> {
        self.code.read_word(offset).ok().map(|word| word as usize)
    }

    /// Points a patch slot at `target`.
    pub fn write_patch_slot(&mut self, offset: usize, target: usize) -> Result<(), AllocatorError> {
        self.code.write_word(offset, target as u64)
    }

    /// Drops the metadata and stub routines, keeping only the code range.
    pub fn into_code(self) -> ExecutableMemoryHandle {
        self.code
    }
}

fn build_inline_frames(
    base: usize,
    compiled: &CompiledCode,
    body: &FunctionBody,
) -> Result<Vec<Rc<InlineCallFrame>>, CompileError> {
    let mut frames: Vec<Rc<InlineCallFrame>> = Vec::with_capacity(body.inlined.len());
    for (index, (spec, handlers)) in body.inlined.iter().zip(&compiled.inline_handlers).enumerate() {
        let caller = match spec.parent {
            None => CodeOrigin::new(spec.call_bytecode_offset),
            Some(parent) if parent < index => {
                CodeOrigin::inlined(spec.call_bytecode_offset, Rc::clone(&frames[parent]))
            }
            Some(parent) => {
                return Err(layout_error(format!(
                    "inlined frame {index} names later parent {parent}"
                )))
            }
        };
        let handlers = HandlerTable::new(
            handlers
                .iter()
                .map(|(range, entry)| HandlerInfo {
                    start: range.start,
                    end: range.end,
                    target: range.target,
                    catch_entry: base + entry,
                })
                .collect(),
        );
        frames.push(Rc::new(InlineCallFrame {
            callee: spec.callee,
            caller,
            handlers,
        }));
    }
    Ok(frames)
}

impl fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("code", &self.code)
            .field("call_sites", &self.call_links.len())
            .field("access_sites", &self.stub_infos.len())
            .finish()
    }
}
