//! Language-level error types.
//!
//! These are the recoverable exceptions a running script can observe:
//! calling a non-callable value, writing a read-only property in strict
//! code, running out of stack while compiling lazily. They travel through
//! the runtime as `Result<T, JsError>` and end up in the VM's exception slot
//! at the operation boundary.

use std::fmt;
use thiserror::Error;

/// The kind of a language-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Type error (e.g., calling a non-function)
    TypeError,
    /// Reference to an undefined binding
    ReferenceError,
    /// Value out of range, including stack exhaustion
    RangeError,
    /// Internal engine error
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

/// A language-level error with its message.
///
/// # Examples
///
/// ```
/// use core_types::{ErrorKind, JsError};
///
/// let error = JsError::type_error("undefined is not a function");
/// assert_eq!(error.kind, ErrorKind::TypeError);
/// assert_eq!(error.to_string(), "TypeError: undefined is not a function");
/// ```
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct JsError {
    /// The type of error
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
}

impl JsError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        JsError {
            kind,
            message: message.into(),
        }
    }

    /// Creates a `TypeError`.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    /// Creates a `RangeError`.
    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RangeError, message)
    }

    /// Creates the stack-overflow `RangeError` raised when a call cannot
    /// get a frame or its code cannot be compiled.
    pub fn stack_overflow() -> Self {
        Self::range_error("Maximum call stack size exceeded")
    }

    /// Creates an `InternalError`.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// Returns true if this is the stack-overflow error.
    pub fn is_stack_overflow(&self) -> bool {
        self.kind == ErrorKind::RangeError && self.message == "Maximum call stack size exceeded"
    }
}
