//! `CompareDepth`: the relational/equality dispatch behind `LT LE GT GE EQL
//! NEQ`. Same-type `Ordered` values delegate to a per-type comparator;
//! `Int`/`Float` mix by promoting the `Int`; everything else either falls
//! back to identity equality (`EQL`/`NEQ` only) or errors.

use std::{cmp::Ordering, rc::Rc};

use crate::{
    bytecode::Opcode,
    error::{ErrorKind, RunError},
    value::{RangeValue, Value},
};

fn type_error(op: Opcode, x: &Value, y: &Value) -> RunError {
    RunError::raised(
        ErrorKind::TypeError,
        format!("unsupported comparison: {} {} {}", x.type_name(), op_symbol(op), y.type_name()),
        None,
    )
}

fn op_symbol(op: Opcode) -> &'static str {
    match op {
        Opcode::Lt => "<",
        Opcode::Le => "<=",
        Opcode::Gt => ">",
        Opcode::Ge => ">=",
        Opcode::Eql => "==",
        Opcode::Neq => "!=",
        _ => "?",
    }
}

/// Total order over `f64` where NaN compares greater than every finite or
/// infinite value (including other NaNs, which compare equal to each
/// other under this order — `EQL`/`NEQ` bypass this function entirely and
/// use raw IEEE comparison instead, which is how `NaN == NaN` stays
/// false even though `NaN` "is greater than" every value for ordering).
fn float_order(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn from_ordering(op: Opcode, ord: Ordering) -> bool {
    match op {
        Opcode::Lt => ord == Ordering::Less,
        Opcode::Le => ord != Ordering::Greater,
        Opcode::Gt => ord == Ordering::Greater,
        Opcode::Ge => ord != Ordering::Less,
        Opcode::Eql => ord == Ordering::Equal,
        Opcode::Neq => ord != Ordering::Equal,
        _ => unreachable!("compare() called with non-comparison opcode"),
    }
}

fn is_relational(op: Opcode) -> bool {
    matches!(op, Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge)
}

/// `CompareDepth(op, x, y, max_depth)`. `max_depth` bounds the recursion
/// used by `Tuple`'s elementwise equality; exhausting it is a non-catchable
/// `RecursionLimit`, matching the VM's other recursion guards.
pub fn compare(op: Opcode, x: &Value, y: &Value, max_depth: u32) -> Result<bool, RunError> {
    if max_depth < 1 {
        return Err(RunError::raised(ErrorKind::RecursionLimit, "maximum comparison depth exceeded", None));
    }

    match (x, y) {
        (Value::Nil, Value::Nil) => Ok(matches!(op, Opcode::Eql | Opcode::Le | Opcode::Ge)),
        (Value::Bool(a), Value::Bool(b)) => Ok(from_ordering(op, a.cmp(b))),
        (Value::Int(a), Value::Int(b)) => Ok(from_ordering(op, a.cmp(b))),
        (Value::Float(a), Value::Float(b)) => {
            if op == Opcode::Eql {
                Ok(a == b)
            } else if op == Opcode::Neq {
                Ok(a != b)
            } else {
                Ok(from_ordering(op, float_order(*a, *b)))
            }
        }
        (Value::Str(a), Value::Str(b)) => Ok(from_ordering(op, a.as_bytes().cmp(b.as_bytes()))),
        (Value::Bytes(a), Value::Bytes(b)) => Ok(from_ordering(op, a.cmp(b))),
        (Value::Int(a), Value::Float(b)) => float_mixed(op, *a as f64, *b),
        (Value::Float(a), Value::Int(b)) => float_mixed(op, *a, *b as f64),
        (Value::Tuple(a), Value::Tuple(b)) if op == Opcode::Eql || op == Opcode::Neq => {
            Ok(tuple_eq(a, b, max_depth - 1)? == (op == Opcode::Eql))
        }
        (Value::Tuple(_), Value::Tuple(_)) => Err(type_error(op, x, y)),
        (Value::Array(a), Value::Array(b)) if op == Opcode::Eql || op == Opcode::Neq => {
            Ok(Rc::ptr_eq(a, b) == (op == Opcode::Eql))
        }
        (Value::Map(a), Value::Map(b)) if op == Opcode::Eql || op == Opcode::Neq => {
            Ok(Rc::ptr_eq(a, b) == (op == Opcode::Eql))
        }
        (Value::Function(a), Value::Function(b)) if op == Opcode::Eql || op == Opcode::Neq => {
            Ok(Rc::ptr_eq(a, b) == (op == Opcode::Eql))
        }
        (Value::Cell(a), Value::Cell(b)) if op == Opcode::Eql || op == Opcode::Neq => {
            Ok(Rc::ptr_eq(a, b) == (op == Opcode::Eql))
        }
        (Value::Range(a), Value::Range(b)) if op == Opcode::Eql || op == Opcode::Neq => {
            Ok((*a == *b) == (op == Opcode::Eql))
        }
        _ if is_relational(op) => Err(type_error(op, x, y)),
        _ => {
            // Different types (or a same non-Ordered, non-special-cased type
            // pair): EQL is always false, NEQ always true.
            Ok(op == Opcode::Neq)
        }
    }
}

fn float_mixed(op: Opcode, a: f64, b: f64) -> Result<bool, RunError> {
    if op == Opcode::Eql {
        Ok(a == b)
    } else if op == Opcode::Neq {
        Ok(a != b)
    } else {
        Ok(from_ordering(op, float_order(a, b)))
    }
}

fn tuple_eq(a: &[Value], b: &[Value], max_depth: u32) -> Result<bool, RunError> {
    if a.len() != b.len() {
        return Ok(false);
    }
    for (x, y) in a.iter().zip(b.iter()) {
        if !compare(Opcode::Eql, x, y, max_depth)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Membership test for `in` (`Opcode::In`): `lhs in rhs`. Dispatches on
/// `rhs`'s type per the value-model table (Array, Tuple, Mapping, String,
/// Bytes, Range).
pub fn contains(needle: &Value, haystack: &Value, max_depth: u32) -> Result<bool, RunError> {
    match haystack {
        Value::Array(a) => {
            for v in a.borrow().iter() {
                if compare(Opcode::Eql, needle, v, max_depth)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Tuple(items) => {
            for v in items.iter() {
                if compare(Opcode::Eql, needle, v, max_depth)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Map(m) => {
            let key = crate::value::value_key(needle)?;
            Ok(m.borrow().get(&key).is_some())
        }
        Value::Str(s) => {
            let Value::Str(n) = needle else {
                return Err(RunError::raised(ErrorKind::TypeError, "'in <string>' requires string", None));
            };
            Ok(s.contains(n.as_ref()))
        }
        Value::Bytes(b) => {
            let Value::Bytes(n) = needle else {
                return Err(RunError::raised(ErrorKind::TypeError, "'in <bytes>' requires bytes", None));
            };
            Ok(contains_subsequence(b, n))
        }
        Value::Range(r) => {
            let Value::Int(n) = needle else {
                return Ok(false);
            };
            Ok(range_contains(r, *n))
        }
        other => Err(RunError::raised(
            ErrorKind::TypeError,
            format!("'in' not supported on type '{}'", other.type_name()),
            None,
        )),
    }
}

fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn range_contains(r: &RangeValue, n: i64) -> bool {
    if r.step > 0 {
        n >= r.start && n < r.stop && (n - r.start) % r.step == 0
    } else {
        n <= r.start && n > r.stop && (r.start - n) % (-r.step) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_greater_than_everything_but_unequal_to_itself() {
        let nan = Value::Float(f64::NAN);
        let inf = Value::Float(f64::INFINITY);
        assert!(compare(Opcode::Gt, &nan, &inf, 16).unwrap());
        assert!(!compare(Opcode::Eql, &nan, &nan, 16).unwrap());
        assert!(compare(Opcode::Neq, &nan, &nan, 16).unwrap());
    }

    #[test]
    fn mixed_int_float_promotes_int() {
        assert!(compare(Opcode::Lt, &Value::Int(1), &Value::Float(1.5), 16).unwrap());
        assert!(compare(Opcode::Eql, &Value::Int(2), &Value::Float(2.0), 16).unwrap());
    }

    #[test]
    fn tuples_compare_elementwise() {
        let a = Value::Tuple(Rc::from(vec![Value::Int(1), Value::Int(2)]));
        let b = Value::Tuple(Rc::from(vec![Value::Int(1), Value::Int(2)]));
        let c = Value::Tuple(Rc::from(vec![Value::Int(1), Value::Int(3)]));
        assert!(compare(Opcode::Eql, &a, &b, 16).unwrap());
        assert!(!compare(Opcode::Eql, &a, &c, 16).unwrap());
    }

    #[test]
    fn mismatched_types_eq_false_neq_true() {
        assert!(!compare(Opcode::Eql, &Value::Int(1), &Value::Str("1".into()), 16).unwrap());
        assert!(compare(Opcode::Neq, &Value::Int(1), &Value::Str("1".into()), 16).unwrap());
        assert!(compare(Opcode::Lt, &Value::Int(1), &Value::Str("1".into()), 16).is_err());
    }

    #[test]
    fn recursion_limit_is_noncatchable() {
        let a = Value::Tuple(Rc::from(vec![Value::Int(1)]));
        let err = compare(Opcode::Eql, &a, &a, 0).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::RecursionLimit));
        assert!(!err.is_catchable());
    }
}
