//! Call frames for the execution stack.
//!
//! Frames live in an arena indexed by [`FrameIndex`] rather than in raw
//! stack memory, so a frame's fields are reached by name and every access is
//! bounds checked.

use core_types::{CodeBlockId, JsError, Value};

use crate::code_origin::CodeOrigin;

/// Index of a frame in the [`FrameStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameIndex(pub u32);

impl FrameIndex {
    /// Encodes the index as a machine word for the operation ABI.
    pub fn to_word(self) -> u64 {
        u64::from(self.0)
    }

    /// Decodes a machine word produced by [`to_word`](Self::to_word).
    pub fn from_word(word: u64) -> Self {
        FrameIndex(word as u32)
    }
}

/// Call frame representing one activation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFrame {
    /// The function value being run
    pub callee: Value,
    /// The frame that made this call, if any
    pub caller: Option<FrameIndex>,
    /// Scope object the function runs in
    pub scope: Value,
    /// The `this` value
    pub this: Value,
    /// Arguments as supplied by the caller
    pub arguments: Vec<Value>,
    /// Compiled unit running in this frame, once its code has been entered
    pub code_block: Option<CodeBlockId>,
    /// Where in the caller this frame was called from
    pub call_site: Option<CodeOrigin>,
}

impl CallFrame {
    /// Creates a frame for calling `callee` with `arguments`.
    pub fn new(callee: Value, this: Value, arguments: Vec<Value>) -> Self {
        Self {
            callee,
            caller: None,
            scope: Value::Undefined,
            this,
            arguments,
            code_block: None,
            call_site: None,
        }
    }

    /// Number of arguments the caller passed.
    pub fn argument_count(&self) -> u32 {
        self.arguments.len() as u32
    }
}

/// Arena of live frames, innermost last.
#[derive(Debug)]
pub struct FrameStack {
    frames: Vec<CallFrame>,
    max_depth: usize,
}

impl FrameStack {
    /// Creates an empty stack that overflows beyond `max_depth` frames.
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::with_capacity(64.min(max_depth)),
            max_depth,
        }
    }

    /// Pushes a frame, linking it to the current top as its caller.
    ///
    /// Fails with a stack overflow error once the depth limit is reached.
    pub fn push(&mut self, mut frame: CallFrame) -> Result<FrameIndex, JsError> {
        if self.frames.len() >= self.max_depth {
            return Err(JsError::stack_overflow());
        }
        frame.caller = self.top();
        let index = FrameIndex(self.frames.len() as u32);
        self.frames.push(frame);
        Ok(index)
    }

    /// Pops the innermost frame.
    pub fn pop(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    /// Pops frames until `index` is the innermost.
    pub fn unwind_to(&mut self, index: FrameIndex) {
        self.frames.truncate(index.0 as usize + 1);
    }

    /// Returns the innermost frame's index.
    pub fn top(&self) -> Option<FrameIndex> {
        self.frames
            .len()
            .checked_sub(1)
            .map(|i| FrameIndex(i as u32))
    }

    /// Returns a frame by index.
    pub fn get(&self, index: FrameIndex) -> Option<&CallFrame> {
        self.frames.get(index.0 as usize)
    }

    /// Returns a frame by index, mutably.
    pub fn get_mut(&mut self, index: FrameIndex) -> Option<&mut CallFrame> {
        self.frames.get_mut(index.0 as usize)
    }

    /// Current depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if any live frame runs code from `code_block`.
    pub fn is_running(&self, code_block: CodeBlockId) -> bool {
        self.frames
            .iter()
            .any(|frame| frame.code_block == Some(code_block))
    }
}
