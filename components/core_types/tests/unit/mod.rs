//! Unit tests for core_types

use core_types::{CellId, EncodedValue, ErrorKind, JsError, Value};

// ============================================================================
// Encoding Tests
// ============================================================================

#[test]
fn test_smi_extremes_round_trip() {
    for n in [i32::MIN, -1, 0, 1, i32::MAX] {
        assert_eq!(Value::Smi(n).encode().decode(), Value::Smi(n));
    }
}

#[test]
fn test_large_cell_ids_round_trip() {
    let id = CellId(u32::MAX - 1);
    assert_eq!(Value::Cell(id).encode().decode(), Value::Cell(id));
}

#[test]
fn test_encoded_words_are_distinct() {
    let words: Vec<EncodedValue> = [
        Value::Undefined,
        Value::Null,
        Value::Boolean(true),
        Value::Boolean(false),
        Value::Smi(0),
        Value::Double(0.0),
        Value::Cell(CellId(0)),
    ]
    .iter()
    .map(|v| v.encode())
    .collect();

    for (i, a) in words.iter().enumerate() {
        assert!(!a.is_empty());
        for b in &words[i + 1..] {
            assert_ne!(a, b);
        }
    }
}

#[test]
fn test_array_index_conversion() {
    assert_eq!(Value::Smi(0).as_array_index(), Some(0));
    assert_eq!(Value::Double(10.0).as_array_index(), Some(10));
    assert_eq!(Value::Double(-0.5).as_array_index(), None);
    assert_eq!(Value::Boolean(true).as_array_index(), None);
    assert_eq!(Value::Cell(CellId(1)).as_array_index(), None);
}

#[test]
fn test_value_predicates() {
    assert!(Value::Null.is_undefined_or_null());
    assert!(Value::Undefined.is_undefined_or_null());
    assert!(!Value::Smi(0).is_undefined_or_null());
    assert!(Value::Cell(CellId(2)).is_cell());
    assert_eq!(Value::Cell(CellId(2)).as_cell(), Some(CellId(2)));
    assert_eq!(Value::Double(1.0).type_name(), "number");
}

// ============================================================================
// Error Tests
// ============================================================================

#[test]
fn test_error_is_std_error() {
    fn assert_error<E: std::error::Error>(_: &E) {}
    let error = JsError::type_error("not a constructor");
    assert_error(&error);
    assert_eq!(error.kind, ErrorKind::TypeError);
}

#[test]
fn test_stack_overflow_message() {
    let error = JsError::stack_overflow();
    assert_eq!(error.kind, ErrorKind::RangeError);
    assert_eq!(error.to_string(), "RangeError: Maximum call stack size exceeded");
}
