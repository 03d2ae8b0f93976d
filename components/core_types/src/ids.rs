//! Strongly typed identifiers shared across the runtime components.
//!
//! Cells, functions and compiled units live in arenas owned by the VM
//! instance; these ids index into those arenas instead of carrying raw
//! pointers around.

use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            /// Index of this id inside its owning arena.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifier of a heap cell (object, array, function object or string).
    CellId,
    "cell"
);

define_id!(
    /// Identifier of a function executable registered with the VM.
    FunctionId,
    "function"
);

define_id!(
    /// Identifier of a native host function.
    HostFunctionId,
    "host"
);

define_id!(
    /// Identifier of a compiled unit (code block) owned by the VM.
    CodeBlockId,
    "codeblock"
);
