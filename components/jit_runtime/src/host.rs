//! Host (native) functions callable from compiled code.

use std::fmt;
use std::rc::Rc;

use core_types::{JsError, Value};
use memory_manager::ObjectHeap;

/// Arguments of one host call.
pub struct HostCall<'a> {
    /// The heap, for functions that allocate or inspect objects
    pub heap: &'a mut ObjectHeap,
    /// The `this` value
    pub this: Value,
    /// Arguments as passed
    pub arguments: &'a [Value],
}

impl HostCall<'_> {
    /// Returns argument `index`, or undefined if it was not passed.
    pub fn argument(&self, index: usize) -> Value {
        self.arguments.get(index).copied().unwrap_or_default()
    }
}

/// Signature of a host function.
pub type NativeFunction = fn(&mut HostCall<'_>) -> Result<Value, JsError>;

/// A registered host function.
#[derive(Clone)]
pub struct HostFunction {
    name: Rc<str>,
    function: NativeFunction,
    constructible: bool,
}

impl HostFunction {
    /// Wraps a native function.
    pub fn new(name: &str, function: NativeFunction) -> Self {
        Self {
            name: name.into(),
            function,
            constructible: false,
        }
    }

    /// Allows the function to be used with `new`.
    pub fn constructible(mut self) -> Self {
        self.constructible = true;
        self
    }

    /// Function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `new` may be used.
    pub fn is_constructible(&self) -> bool {
        self.constructible
    }

    /// Runs the function.
    pub fn invoke(&self, call: &mut HostCall<'_>) -> Result<Value, JsError> {
        (self.function)(call)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("constructible", &self.constructible)
            .finish()
    }
}
