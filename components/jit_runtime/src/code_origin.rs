//! Code origins and exception handler tables.
//!
//! A [`CodeOrigin`] names a bytecode position, possibly inside a function
//! the optimizer inlined. Inlined positions carry a chain of
//! [`InlineCallFrame`]s leading back to the machine code's own function.

use std::rc::Rc;

use core_types::FunctionId;

/// One try range and its landing pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerInfo {
    /// First bytecode offset covered
    pub start: u32,
    /// One past the last bytecode offset covered
    pub end: u32,
    /// Bytecode offset of the catch block
    pub target: u32,
    /// Absolute address of the machine-code catch entry
    pub catch_entry: usize,
}

impl HandlerInfo {
    /// Returns true if `offset` is inside the try range.
    pub fn covers(&self, offset: u32) -> bool {
        self.start <= offset && offset < self.end
    }
}

/// Handler table for one function, innermost ranges first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerTable {
    handlers: Vec<HandlerInfo>,
}

impl HandlerTable {
    /// Creates a table from handlers listed innermost first.
    pub fn new(handlers: Vec<HandlerInfo>) -> Self {
        Self { handlers }
    }

    /// Finds the innermost handler covering `offset`.
    pub fn handler_for(&self, offset: u32) -> Option<&HandlerInfo> {
        self.handlers.iter().find(|handler| handler.covers(offset))
    }

    /// Returns all handlers.
    pub fn handlers(&self) -> &[HandlerInfo] {
        &self.handlers
    }

    /// Returns true if the table has no handlers.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Record of a function body the optimizer inlined into its caller.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineCallFrame {
    /// The inlined function
    pub callee: FunctionId,
    /// Position of the inlined call in the caller
    pub caller: CodeOrigin,
    /// The inlined function's handlers, with catch entries in the host unit
    pub handlers: HandlerTable,
}

/// A bytecode position, possibly within inlined code.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeOrigin {
    /// Bytecode offset in the innermost function
    pub bytecode_offset: u32,
    /// The inlined frame this offset belongs to, if any
    pub inline_call_frame: Option<Rc<InlineCallFrame>>,
}

impl CodeOrigin {
    /// Creates an origin in the machine code's own function.
    pub fn new(bytecode_offset: u32) -> Self {
        Self {
            bytecode_offset,
            inline_call_frame: None,
        }
    }

    /// Creates an origin inside an inlined frame.
    pub fn inlined(bytecode_offset: u32, frame: Rc<InlineCallFrame>) -> Self {
        Self {
            bytecode_offset,
            inline_call_frame: Some(frame),
        }
    }

    /// Number of inlined frames between this origin and the machine frame.
    pub fn inline_depth(&self) -> usize {
        let mut depth = 0;
        let mut frame = self.inline_call_frame.as_ref();
        while let Some(inline) = frame {
            depth += 1;
            frame = inline.caller.inline_call_frame.as_ref();
        }
        depth
    }
}
