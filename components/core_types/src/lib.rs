//! Core value types and error handling for the JIT runtime.
//!
//! This crate provides the foundational types shared by every runtime
//! component: the value representation and its machine encoding, the
//! arena identifiers, and the language-level error type.
//!
//! # Overview
//!
//! - [`Value`] - Decoded VM value
//! - [`EncodedValue`] - 64-bit machine encoding passed to and from generated code
//! - [`JsError`] - Language-level error
//! - [`ErrorKind`] - Types of language-level errors
//! - [`CellId`], [`FunctionId`], [`HostFunctionId`], [`CodeBlockId`] - Arena ids
//!
//! # Examples
//!
//! ```
//! use core_types::{JsError, Value};
//!
//! let value = Value::Smi(42);
//! let word = value.encode();
//! assert_eq!(word.decode(), value);
//!
//! let error = JsError::type_error("undefined is not a function");
//! assert_eq!(error.message, "undefined is not a function");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod error;
mod ids;
mod value;

pub use error::{ErrorKind, JsError};
pub use ids::{CellId, CodeBlockId, FunctionId, HostFunctionId};
pub use value::{EncodedValue, Value};
