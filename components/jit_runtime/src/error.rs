//! Runtime construction errors and the thrown-value slot contents.

use std::fmt;

use core_types::{JsError, Value};
use memory_manager::AllocatorError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors creating a VM context.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Executable pool could not be reserved
    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    /// The pool is too small to hold the shared thunks
    #[error("executable pool too small for the runtime thunks")]
    ThunkAllocation,
}

/// What the exception slot holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Exception {
    /// An error raised by the runtime or a host function
    Error(JsError),
    /// A value thrown by script code
    Value(Value),
}

impl Exception {
    /// Returns the runtime error, if this is one.
    pub fn as_error(&self) -> Option<&JsError> {
        match self {
            Exception::Error(error) => Some(error),
            Exception::Value(_) => None,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exception::Error(error) => write!(f, "{error}"),
            Exception::Value(value) => write!(f, "Uncaught {value}"),
        }
    }
}

impl From<JsError> for Exception {
    fn from(error: JsError) -> Self {
        Exception::Error(error)
    }
}
