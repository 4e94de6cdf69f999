// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ordering and coercion rules for the engine's scalar type.
//!
//! Rows flow through the scheduler as JSON values, both locally and on the wire between
//! shards. Ordering across differing types is defined by a type ordinal; values of the
//! same type compare by their underlying representation.

use serde_json::Value;

use crate::ErrorKind;

/// Compares two scalar values.
///
/// We can't implement [`Ord`] for [`Value`], because comparing non-primitive values
/// needs to be able to return an error.
pub fn compare(left: &Value, right: &Value) -> crate::Result<std::cmp::Ordering> {
    let left_ordinal = type_ordinal(left)?;
    let right_ordinal = type_ordinal(right)?;

    if left_ordinal != right_ordinal {
        return Ok(left_ordinal.cmp(&right_ordinal));
    }

    match (left, right) {
        (Value::Null, Value::Null) => Ok(std::cmp::Ordering::Equal),
        (Value::Bool(l), Value::Bool(r)) => Ok(l.cmp(r)),
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        (Value::Number(l), Value::Number(r)) => {
            // Try integer comparison first. This will fail if either value is not an integer.
            if let (Some(l_int), Some(r_int)) = (l.as_i64(), r.as_i64()) {
                Ok(l_int.cmp(&r_int))
            } else {
                let l = l.as_f64().ok_or_else(non_finite)?;
                let r = r.as_f64().ok_or_else(non_finite)?;
                l.partial_cmp(&r).ok_or_else(non_finite)
            }
        }

        // Shouldn't be possible to get here, since we've already checked the type ordinal.
        _ => unreachable!("encountered different types after comparing type ordinal"),
    }
}

fn non_finite() -> crate::Error {
    ErrorKind::RuntimeError.with_message("encountered NaN or Infinity while comparing values")
}

/// Gets the "Type Ordinal" for a value, used to order values of differing types.
fn type_ordinal(value: &Value) -> crate::Result<usize> {
    match value {
        Value::Null => Ok(1),
        Value::Bool(_) => Ok(2),
        Value::Number(_) => Ok(4),
        Value::String(_) => Ok(5),
        _ => Err(ErrorKind::RuntimeError.with_message("cannot compare non-primitive values")),
    }
}

/// SQL-style truthiness: `false`, `null`, and `0` are falsy, everything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Coerces a value to a float, for arithmetic and SUM/MEAN accumulation.
pub fn as_f64(value: &Value) -> crate::Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| ErrorKind::RuntimeError.with_message("expected a numeric value"))
}

/// Builds a JSON number from a float, rejecting NaN and Infinity.
pub fn number(value: f64) -> crate::Result<Value> {
    let number = serde_json::Number::from_f64(value)
        .ok_or_else(|| ErrorKind::RuntimeError.with_message("arithmetic produced a non-finite value"))?;
    Ok(Value::Number(number))
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use serde_json::json;

    use super::*;

    #[test]
    fn compare_numbers() {
        assert_eq!(compare(&json!(1), &json!(1)).unwrap(), Ordering::Equal);
        assert_eq!(compare(&json!(1), &json!(2)).unwrap(), Ordering::Less);
        assert_eq!(compare(&json!(2), &json!(1)).unwrap(), Ordering::Greater);
        assert_eq!(compare(&json!(1.5), &json!(1)).unwrap(), Ordering::Greater);
        assert_eq!(compare(&json!(-1), &json!(1)).unwrap(), Ordering::Less);
    }

    #[test]
    fn compare_strings_and_bools() {
        assert_eq!(compare(&json!("aaa"), &json!("aab")).unwrap(), Ordering::Less);
        assert_eq!(compare(&json!(true), &json!(false)).unwrap(), Ordering::Greater);
    }

    #[test]
    fn compare_mixed_types_by_ordinal() {
        assert_eq!(compare(&json!(null), &json!(true)).unwrap(), Ordering::Less);
        assert_eq!(compare(&json!(true), &json!(1)).unwrap(), Ordering::Less);
        assert_eq!(compare(&json!(1), &json!("a")).unwrap(), Ordering::Less);
    }

    #[test]
    fn cannot_compare_non_primitives() {
        assert!(compare(&json!({"a": 1}), &json!({"a": 2})).is_err());
        assert!(compare(&json!([1]), &json!([2])).is_err());
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
    }
}
