//! The operation catalogue generated code calls into.
//!
//! Every runtime entry point generated code can reach is listed in
//! [`OperationId`] with a fixed [`OperationSignature`]: the calling frame,
//! zero to three operand words, and an encoded value, pointer, boolean or
//! nothing in return. [`OperationBridge::call`] is the single place the
//! calling convention is implemented. It runs the architecture prologue,
//! records the calling frame, and turns a failed operation into a pending
//! exception plus a zero sentinel word, so no operation can return to
//! generated code with an exception pending and a usable result.

use core_types::{EncodedValue, JsError, Value};

use crate::call_frame::FrameIndex;
use crate::call_link::{
    operation_get_host_call_return_value, operation_link_call, operation_link_construct,
    operation_virtual_call, operation_virtual_construct, CodePtr,
};
use crate::compiled_unit::ReturnAddress;
use crate::context::VmContext;
use crate::exception::{
    operation_lookup_exception_handler, operation_lookup_exception_handler_from_caller,
    PackedHandler,
};
use crate::property_access::{
    operation_get_by_id, operation_get_by_id_optimize, operation_get_by_val,
    operation_get_by_val_optimize, operation_has_property, operation_put_by_id_direct_non_strict,
    operation_put_by_id_direct_strict, operation_put_by_id_non_strict,
    operation_put_by_id_optimize, operation_put_by_id_strict, operation_put_by_val_non_strict,
    operation_put_by_val_optimize, operation_put_by_val_strict,
};
use crate::trampoline::{emit_operation_call, enter_operation, Architecture};

/// Where an operation was called from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSite {
    /// Frame the call was made for
    pub frame: FrameIndex,
    /// Return address of the call; zero for operations that do not
    /// capture it
    pub return_address: ReturnAddress,
}

/// What an operation hands back in the return register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    /// Nothing
    Void,
    /// An encoded value; empty on exception
    EncodedValue,
    /// A code or data pointer; null on exception
    Pointer,
    /// A boolean; false on exception
    Boolean,
}

/// Shape of one operation's native signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSignature {
    /// Operand words after the frame
    pub arity: usize,
    /// Return kind
    pub returns: ReturnKind,
    /// Whether the prologue captures the return address
    pub needs_return_address: bool,
    /// Whether the operation runs with an exception already pending
    pub expects_pending_exception: bool,
}

/// Every operation generated code can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationId {
    /// Unlinked call site
    LinkCall,
    /// Unlinked `new` site
    LinkConstruct,
    /// Call that re-resolves every time
    VirtualCall,
    /// `new` that re-resolves every time
    VirtualConstruct,
    /// Reads the host-call return slot
    GetHostCallReturnValue,
    /// Generic `base.name`
    GetById,
    /// Caching `base.name`
    GetByIdOptimize,
    /// Generic strict assignment
    PutByIdStrict,
    /// Generic sloppy assignment
    PutByIdNonStrict,
    /// Generic strict definition
    PutByIdDirectStrict,
    /// Generic sloppy definition
    PutByIdDirectNonStrict,
    /// Caching put-by-id
    PutByIdOptimize,
    /// Generic `base[subscript]`
    GetByVal,
    /// Caching `base[subscript]`
    GetByValOptimize,
    /// Generic strict indexed store
    PutByValStrict,
    /// Generic sloppy indexed store
    PutByValNonStrict,
    /// Caching indexed store
    PutByValOptimize,
    /// `subscript in base`
    HasProperty,
    /// Handler lookup for a throw at a site
    LookupExceptionHandler,
    /// Handler lookup starting in the caller
    LookupExceptionHandlerFromCaller,
}

impl OperationId {
    /// All operations, in table order.
    pub const ALL: [OperationId; 20] = [
        OperationId::LinkCall,
        OperationId::LinkConstruct,
        OperationId::VirtualCall,
        OperationId::VirtualConstruct,
        OperationId::GetHostCallReturnValue,
        OperationId::GetById,
        OperationId::GetByIdOptimize,
        OperationId::PutByIdStrict,
        OperationId::PutByIdNonStrict,
        OperationId::PutByIdDirectStrict,
        OperationId::PutByIdDirectNonStrict,
        OperationId::PutByIdOptimize,
        OperationId::GetByVal,
        OperationId::GetByValOptimize,
        OperationId::PutByValStrict,
        OperationId::PutByValNonStrict,
        OperationId::PutByValOptimize,
        OperationId::HasProperty,
        OperationId::LookupExceptionHandler,
        OperationId::LookupExceptionHandlerFromCaller,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Decodes an operand word.
pub trait AbiArgument: Sized {
    /// Decodes `word`.
    fn from_word(word: u64) -> Self;
}

impl AbiArgument for Value {
    fn from_word(word: u64) -> Self {
        EncodedValue(word).decode()
    }
}

/// Encodes a result word.
pub trait AbiResult {
    /// How the result travels.
    const KIND: ReturnKind;

    /// Encodes the result.
    fn into_word(self) -> u64;
}

impl AbiResult for () {
    const KIND: ReturnKind = ReturnKind::Void;

    fn into_word(self) -> u64 {
        0
    }
}

impl AbiResult for Value {
    const KIND: ReturnKind = ReturnKind::EncodedValue;

    fn into_word(self) -> u64 {
        self.encode().bits()
    }
}

impl AbiResult for bool {
    const KIND: ReturnKind = ReturnKind::Boolean;

    fn into_word(self) -> u64 {
        u64::from(self)
    }
}

impl AbiResult for CodePtr {
    const KIND: ReturnKind = ReturnKind::Pointer;

    fn into_word(self) -> u64 {
        self.0 as u64
    }
}

impl AbiResult for PackedHandler {
    const KIND: ReturnKind = ReturnKind::Pointer;

    fn into_word(self) -> u64 {
        self.0
    }
}

/// Most operands any operation takes.
const MAX_OPERANDS: usize = 3;

/// Operand words as delivered by the prologue; slots past the operation's
/// arity are zero.
type Operands = [u64; MAX_OPERANDS];

type Handler = Box<dyn Fn(&mut VmContext, OperationSite, Operands) -> Result<u64, JsError>>;

/// One catalogue entry.
pub struct OperationEntry {
    signature: OperationSignature,
    handler: Handler,
}

impl OperationEntry {
    /// The entry's signature.
    pub fn signature(&self) -> OperationSignature {
        self.signature
    }
}

fn signature<R: AbiResult>(arity: usize, needs_return_address: bool) -> OperationSignature {
    OperationSignature {
        arity,
        returns: R::KIND,
        needs_return_address,
        expects_pending_exception: false,
    }
}

fn wrap0<R: AbiResult + 'static>(
    needs_return_address: bool,
    f: fn(&mut VmContext, OperationSite) -> Result<R, JsError>,
) -> OperationEntry {
    OperationEntry {
        signature: signature::<R>(0, needs_return_address),
        handler: Box::new(move |ctx, site, _: Operands| f(ctx, site).map(R::into_word)),
    }
}

fn wrap1<A: AbiArgument + 'static, R: AbiResult + 'static>(
    needs_return_address: bool,
    f: fn(&mut VmContext, OperationSite, A) -> Result<R, JsError>,
) -> OperationEntry {
    OperationEntry {
        signature: signature::<R>(1, needs_return_address),
        handler: Box::new(move |ctx, site, [a, _, _]: Operands| {
            f(ctx, site, A::from_word(a)).map(R::into_word)
        }),
    }
}

fn wrap2<A: AbiArgument + 'static, B: AbiArgument + 'static, R: AbiResult + 'static>(
    needs_return_address: bool,
    f: fn(&mut VmContext, OperationSite, A, B) -> Result<R, JsError>,
) -> OperationEntry {
    OperationEntry {
        signature: signature::<R>(2, needs_return_address),
        handler: Box::new(move |ctx, site, [a, b, _]: Operands| {
            f(ctx, site, A::from_word(a), B::from_word(b)).map(R::into_word)
        }),
    }
}

fn wrap3<
    A: AbiArgument + 'static,
    B: AbiArgument + 'static,
    C: AbiArgument + 'static,
    R: AbiResult + 'static,
>(
    needs_return_address: bool,
    f: fn(&mut VmContext, OperationSite, A, B, C) -> Result<R, JsError>,
) -> OperationEntry {
    OperationEntry {
        signature: signature::<R>(3, needs_return_address),
        handler: Box::new(move |ctx, site, [a, b, c]: Operands| {
            f(ctx, site, A::from_word(a), B::from_word(b), C::from_word(c)).map(R::into_word)
        }),
    }
}

fn expecting_exception(mut entry: OperationEntry) -> OperationEntry {
    entry.signature.expects_pending_exception = true;
    entry
}

/// The operation catalogue.
pub struct OperationTable {
    entries: Vec<OperationEntry>,
}

impl OperationTable {
    /// Builds the table of every [`OperationId`].
    pub fn standard() -> Self {
        let entries = OperationId::ALL.iter().map(|&id| Self::entry(id)).collect();
        Self { entries }
    }

    fn entry(id: OperationId) -> OperationEntry {
        match id {
            OperationId::LinkCall => wrap0(true, operation_link_call),
            OperationId::LinkConstruct => wrap0(true, operation_link_construct),
            OperationId::VirtualCall => wrap0(true, operation_virtual_call),
            OperationId::VirtualConstruct => wrap0(true, operation_virtual_construct),
            OperationId::GetHostCallReturnValue => {
                wrap0(false, |ctx, _| Ok(operation_get_host_call_return_value(ctx)))
            }
            OperationId::GetById => wrap1(true, operation_get_by_id),
            OperationId::GetByIdOptimize => wrap1(true, operation_get_by_id_optimize),
            OperationId::PutByIdStrict => wrap2(true, operation_put_by_id_strict),
            OperationId::PutByIdNonStrict => wrap2(true, operation_put_by_id_non_strict),
            OperationId::PutByIdDirectStrict => wrap2(true, operation_put_by_id_direct_strict),
            OperationId::PutByIdDirectNonStrict => {
                wrap2(true, operation_put_by_id_direct_non_strict)
            }
            OperationId::PutByIdOptimize => wrap2(true, operation_put_by_id_optimize),
            OperationId::GetByVal => wrap2(false, operation_get_by_val),
            OperationId::GetByValOptimize => wrap2(true, operation_get_by_val_optimize),
            OperationId::PutByValStrict => wrap3(false, operation_put_by_val_strict),
            OperationId::PutByValNonStrict => wrap3(false, operation_put_by_val_non_strict),
            OperationId::PutByValOptimize => wrap3(true, operation_put_by_val_optimize),
            OperationId::HasProperty => wrap2(false, operation_has_property),
            OperationId::LookupExceptionHandler => expecting_exception(wrap0(true, |ctx, site| {
                Ok(operation_lookup_exception_handler(ctx, site))
            })),
            OperationId::LookupExceptionHandlerFromCaller => {
                expecting_exception(wrap0(false, |ctx, site| {
                    Ok(operation_lookup_exception_handler_from_caller(ctx, site.frame))
                }))
            }
        }
    }

    /// Looks up an operation.
    pub fn get(&self, id: OperationId) -> &OperationEntry {
        &self.entries[id.index()]
    }
}

/// Result of one operation call as generated code sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationOutcome {
    /// The return register
    pub word: u64,
    /// Whether the exception slot is set
    pub exception_pending: bool,
}

impl OperationOutcome {
    fn sentinel() -> Self {
        OperationOutcome {
            word: 0,
            exception_pending: true,
        }
    }

    /// The result as an encoded value; `None` for the empty sentinel.
    pub fn value(self) -> Option<Value> {
        let encoded = EncodedValue(self.word);
        (!encoded.is_empty()).then(|| encoded.decode())
    }

    /// The result as a code pointer.
    pub fn code_ptr(self) -> CodePtr {
        CodePtr(self.word as usize)
    }

    /// The result as a boolean.
    pub fn boolean(self) -> bool {
        self.word != 0
    }

    /// The result as a packed handler.
    pub fn handler(self) -> PackedHandler {
        PackedHandler(self.word)
    }
}

/// Calls operations through the host architecture's prologues.
pub struct OperationBridge {
    arch: Architecture,
    table: OperationTable,
}

impl OperationBridge {
    /// Creates a bridge for `arch`.
    pub fn new(arch: Architecture) -> Self {
        Self {
            arch,
            table: OperationTable::standard(),
        }
    }

    /// Architecture the prologues model.
    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    /// The catalogue.
    pub fn table(&self) -> &OperationTable {
        &self.table
    }

    /// Performs one operation call.
    ///
    /// `operands` are the encoded operand words after the frame. On failure
    /// the exception slot is set and the result word is zero.
    pub fn call(
        &self,
        ctx: &mut VmContext,
        id: OperationId,
        site: OperationSite,
        operands: &[u64],
    ) -> OperationOutcome {
        let entry = self.table.get(id);
        let signature = entry.signature;

        let mut words = Vec::with_capacity(operands.len() + 1);
        words.push(site.frame.to_word());
        words.extend_from_slice(operands);
        let state = emit_operation_call(self.arch, &words, site.return_address);
        let native = match enter_operation(
            self.arch,
            &state,
            signature.arity + 1,
            signature.needs_return_address,
        ) {
            Ok(native) => native,
            Err(err) => {
                ctx.throw(JsError::internal(err.to_string()));
                return OperationOutcome::sentinel();
            }
        };

        let frame = FrameIndex::from_word(native.arguments[0]);
        let site = OperationSite {
            frame,
            return_address: native.return_address.unwrap_or(ReturnAddress(0)),
        };
        let mut operands: Operands = [0; MAX_OPERANDS];
        operands[..signature.arity].copy_from_slice(&native.arguments[1..=signature.arity]);
        ctx.set_top_call_frame(frame);

        if signature.expects_pending_exception {
            let word = (entry.handler)(ctx, site, operands).unwrap_or_default();
            return OperationOutcome {
                word,
                exception_pending: ctx.has_exception(),
            };
        }

        debug_assert!(
            !ctx.has_exception(),
            "{id:?} entered with an exception pending"
        );
        match (entry.handler)(ctx, site, operands) {
            Ok(_) if ctx.has_exception() => OperationOutcome::sentinel(),
            Ok(word) => OperationOutcome {
                word,
                exception_pending: false,
            },
            Err(error) => {
                tracing::trace!(operation = ?id, %error, "operation threw");
                ctx.throw(error);
                OperationOutcome::sentinel()
            }
        }
    }
}

impl std::fmt::Debug for OperationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationBridge")
            .field("arch", &self.arch)
            .field("operations", &self.table.entries.len())
            .finish()
    }
}
