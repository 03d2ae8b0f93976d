//! VM value representation and its 64-bit machine encoding.
//!
//! Generated code only ever sees [`EncodedValue`] words. The runtime decodes
//! them into the [`Value`] enum to do real work and encodes results back
//! before returning across the operation boundary.
//!
//! # Encoding
//!
//! - Top 16 bits `0xFFFF`: 32-bit integer in the low word
//! - Top 16 bits `0x0000`: cell reference or immediate
//! - Anything else: double, stored as its bit pattern plus `2^49`
//!
//! Immediates use the low four bits (`null = 0x02`, `false = 0x06`,
//! `true = 0x07`, `undefined = 0x0A`) and the all-zero word is the empty
//! value that operations return when an exception is pending.

use crate::ids::CellId;
use std::fmt;

const NUMBER_TAG: u64 = 0xFFFF_0000_0000_0000;
const DOUBLE_ENCODE_OFFSET: u64 = 1 << 49;
const VALUE_NULL: u64 = 0x02;
const VALUE_FALSE: u64 = 0x06;
const VALUE_TRUE: u64 = 0x07;
const VALUE_UNDEFINED: u64 = 0x0A;
const CELL_SHIFT: u32 = 4;

/// Represents any value the VM manipulates.
///
/// # Examples
///
/// ```
/// use core_types::Value;
///
/// let number = Value::Smi(42);
/// assert!(number.is_number());
/// assert_eq!(number.encode().decode(), number);
/// ```
#[derive(Clone, Copy)]
pub enum Value {
    /// The undefined value
    Undefined,
    /// The null value
    Null,
    /// Boolean true or false
    Boolean(bool),
    /// Small integer that fits in 32 bits
    Smi(i32),
    /// IEEE 754 double-precision number
    Double(f64),
    /// Reference to a heap cell
    Cell(CellId),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Boolean(b) => f.debug_tuple("Boolean").field(b).finish(),
            Value::Smi(n) => f.debug_tuple("Smi").field(n).finish(),
            Value::Double(n) => f.debug_tuple("Double").field(n).finish(),
            Value::Cell(id) => f.debug_tuple("Cell").field(&id.0).finish(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Smi(a), Value::Smi(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Cell(a), Value::Cell(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Encodes this value into its 64-bit machine form.
    pub fn encode(self) -> EncodedValue {
        let bits = match self {
            Value::Undefined => VALUE_UNDEFINED,
            Value::Null => VALUE_NULL,
            Value::Boolean(false) => VALUE_FALSE,
            Value::Boolean(true) => VALUE_TRUE,
            Value::Smi(n) => NUMBER_TAG | u64::from(n as u32),
            Value::Double(d) => d.to_bits().wrapping_add(DOUBLE_ENCODE_OFFSET),
            Value::Cell(id) => (u64::from(id.0) + 1) << CELL_SHIFT,
        };
        EncodedValue(bits)
    }

    /// Returns true for `Smi` and `Double` values.
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Smi(_) | Value::Double(_))
    }

    /// Returns true if this value references a heap cell.
    pub fn is_cell(&self) -> bool {
        matches!(self, Value::Cell(_))
    }

    /// Returns true for undefined and null.
    pub fn is_undefined_or_null(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Returns the referenced cell, if any.
    pub fn as_cell(&self) -> Option<CellId> {
        match self {
            Value::Cell(id) => Some(*id),
            _ => None,
        }
    }

    /// Interprets this value as an array index.
    ///
    /// Only non-negative integers qualify, including doubles with an exact
    /// integral value below `u32::MAX`.
    ///
    /// ```
    /// use core_types::Value;
    ///
    /// assert_eq!(Value::Smi(3).as_array_index(), Some(3));
    /// assert_eq!(Value::Double(4.0).as_array_index(), Some(4));
    /// assert_eq!(Value::Smi(-1).as_array_index(), None);
    /// assert_eq!(Value::Double(1.5).as_array_index(), None);
    /// ```
    pub fn as_array_index(&self) -> Option<u32> {
        match *self {
            Value::Smi(n) if n >= 0 => Some(n as u32),
            Value::Double(d) if d >= 0.0 && d < u32::MAX as f64 && d.fract() == 0.0 => {
                Some(d as u32)
            }
            _ => None,
        }
    }

    /// Returns the `typeof`-style name of the value's primitive type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Smi(_) | Value::Double(_) => "number",
            Value::Cell(_) => "object",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Smi(n) => write!(f, "{}", n),
            Value::Double(d) => {
                if d.is_nan() {
                    write!(f, "NaN")
                } else if d.is_infinite() {
                    write!(f, "{}Infinity", if *d < 0.0 { "-" } else { "" })
                } else if d.fract() == 0.0 && d.abs() < 1e21 {
                    write!(f, "{}", *d as i64)
                } else {
                    write!(f, "{}", d)
                }
            }
            Value::Cell(id) => write!(f, "[{}]", id),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Undefined
    }
}

/// A value in its 64-bit machine encoding.
///
/// This is what generated code passes in registers. The all-zero word is
/// [`EncodedValue::EMPTY`], which never decodes to a real value and is used
/// as the sentinel return when an operation leaves an exception pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodedValue(pub u64);

impl EncodedValue {
    /// The empty sentinel word.
    pub const EMPTY: EncodedValue = EncodedValue(0);

    /// Returns the raw machine word.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Returns true if this is the empty sentinel.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Decodes the word back into a [`Value`].
    ///
    /// The empty word and unrecognized immediates decode as `Undefined`.
    pub fn decode(self) -> Value {
        let bits = self.0;
        if bits & NUMBER_TAG == NUMBER_TAG {
            return Value::Smi(bits as u32 as i32);
        }
        if bits & NUMBER_TAG != 0 {
            return Value::Double(f64::from_bits(bits.wrapping_sub(DOUBLE_ENCODE_OFFSET)));
        }
        match bits {
            VALUE_NULL => Value::Null,
            VALUE_FALSE => Value::Boolean(false),
            VALUE_TRUE => Value::Boolean(true),
            VALUE_UNDEFINED => Value::Undefined,
            _ if bits >= 1 << CELL_SHIFT && bits.trailing_zeros() >= CELL_SHIFT => {
                Value::Cell(CellId(((bits >> CELL_SHIFT) - 1) as u32))
            }
            _ => Value::Undefined,
        }
    }
}

impl From<Value> for EncodedValue {
    fn from(value: Value) -> Self {
        value.encode()
    }
}
