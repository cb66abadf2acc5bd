//! `Iterable`/`Indexable`/`Mapping` dispatch: `INDEX SETINDEX SETMAP ATTR
//! SETFIELD` plus the small internal iterators backing `ITERPUSH`/
//! `ITERJMP`/`ITERPOP`.

use std::{cell::RefCell, rc::Rc};

use crate::{
    error::{ErrorKind, RunError},
    value::{value_key, ArrayRef, RangeValue, Value, ValueMap},
};

/// One of the VM's small built-in iterators, or a host-provided one.
/// `ITERPUSH` constructs one of these from the top-of-stack iterable;
/// `ITERJMP` calls [`ValueIter::next`] each pass; a frame's exit path
/// calls [`ValueIter::done`] on every iterator it pushed, in reverse
/// order, regardless of which path it exits by.
pub enum ValueIter {
    /// `Int` iterates `0..n-1` (or is empty for `n <= 0`).
    IntRange { next: i64, end: i64 },
    Range(RangeValue),
    Array { arr: ArrayRef, next: usize },
    Tuple { items: Rc<[Value]>, next: usize },
    /// Map iteration order is unspecified (spec §9 Open Questions); this
    /// walks the underlying `IndexMap` in insertion order, which is simply
    /// whatever order happens to be convenient, not a guarantee.
    Map { map: Rc<RefCell<ValueMap>>, next: usize },
    Extern(Rc<RefCell<dyn ExternIter>>),
}

/// Host-provided iterator, the `Iterable` extension point for `Extern` values.
pub trait ExternIter {
    fn next(&mut self) -> Option<Value>;
    fn done(&mut self) {}
}

impl ValueIter {
    pub fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::IntRange { next, end } => {
                if *next >= *end {
                    None
                } else {
                    let v = *next;
                    *next += 1;
                    Some(Value::Int(v))
                }
            }
            ValueIter::Range(r) => {
                if r.is_empty() {
                    None
                } else {
                    let v = r.start;
                    r.start += r.step;
                    Some(Value::Int(v))
                }
            }
            ValueIter::Array { arr, next } => {
                let arr = arr.borrow();
                let v = arr.get(*next).cloned();
                if v.is_some() {
                    *next += 1;
                }
                v
            }
            ValueIter::Tuple { items, next } => {
                let v = items.get(*next).cloned();
                if v.is_some() {
                    *next += 1;
                }
                v
            }
            ValueIter::Map { map, next } => {
                let v = map.borrow().key_at(*next).cloned();
                if v.is_some() {
                    *next += 1;
                }
                v
            }
            ValueIter::Extern(it) => it.borrow_mut().next(),
        }
    }

    pub fn done(&mut self) {
        if let ValueIter::Extern(it) = self {
            it.borrow_mut().done();
        }
    }
}

/// Constructs an iterator over `v`, or a `TypeError` if `v` is not
/// `Iterable` (per the value-model table: `Int`, `Tuple`, `Array`, `Map`,
/// `Range`).
pub fn make_iter(v: &Value) -> Result<ValueIter, RunError> {
    match v {
        Value::Int(n) => Ok(ValueIter::IntRange { next: 0, end: (*n).max(0) }),
        Value::Range(r) => Ok(ValueIter::Range(*r)),
        Value::Array(a) => Ok(ValueIter::Array { arr: a.clone(), next: 0 }),
        Value::Tuple(t) => Ok(ValueIter::Tuple { items: t.clone(), next: 0 }),
        Value::Map(m) => Ok(ValueIter::Map { map: m.clone(), next: 0 }),
        Value::Extern(_) => Err(RunError::raised(ErrorKind::TypeError, "extern iteration not wired by this host", None)),
        other => Err(RunError::raised(ErrorKind::TypeError, format!("'{}' is not iterable", other.type_name()), None)),
    }
}

fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let idx = if i < 0 { i + len } else { i };
    if idx >= 0 && idx < len { Some(idx as usize) } else { None }
}

fn index_error(i: i64, type_name: &str) -> RunError {
    RunError::raised(ErrorKind::IndexError, format!("index {i} out of range for {type_name}"), None)
}

/// `getIndex`: `Mapping` (`Map`) does a key lookup; `Indexable` types do a
/// bounds-checked fetch supporting negative indices (`i + len`).
pub fn get_index(recv: &Value, key: &Value) -> Result<Value, RunError> {
    match recv {
        Value::Map(m) => {
            let k = value_key(key)?;
            m.borrow().get(&k).cloned().ok_or_else(|| {
                RunError::raised(ErrorKind::KeyError, format!("key not found: {}", key.to_display_string(4)), None)
            })
        }
        Value::Array(a) => {
            let i = expect_int(key)?;
            let a = a.borrow();
            let idx = normalize_index(i, a.len()).ok_or_else(|| index_error(i, "array"))?;
            Ok(a[idx].clone())
        }
        Value::Tuple(t) => {
            let i = expect_int(key)?;
            let idx = normalize_index(i, t.len()).ok_or_else(|| index_error(i, "tuple"))?;
            Ok(t[idx].clone())
        }
        Value::Str(s) => {
            let i = expect_int(key)?;
            let bytes = s.as_bytes();
            let idx = normalize_index(i, bytes.len()).ok_or_else(|| index_error(i, "string"))?;
            // `Value::Str` is a Rust `str` under the hood (valid UTF-8), so a
            // byte that isn't ASCII can't be returned as a literal one-byte
            // string without breaking that invariant; it's re-encoded as the
            // single-codepoint string for that byte value instead. A host
            // that needs true byte-indexed strings over non-ASCII text
            // should index the `Bytes` view instead.
            Ok(Value::Str(Rc::from((bytes[idx] as char).to_string())))
        }
        Value::Bytes(b) => {
            let i = expect_int(key)?;
            let idx = normalize_index(i, b.len()).ok_or_else(|| index_error(i, "bytes"))?;
            Ok(Value::Bytes(Rc::from([b[idx]])))
        }
        other => Err(RunError::raised(ErrorKind::TypeError, format!("'{}' is not indexable", other.type_name()), None)),
    }
}

fn expect_int(v: &Value) -> Result<i64, RunError> {
    match v {
        Value::Int(i) => Ok(*i),
        other => Err(RunError::raised(ErrorKind::TypeError, format!("index must be an int, not '{}'", other.type_name()), None)),
    }
}

/// `setIndex`: `HasSetKey` (`Map`) inserts/overwrites; `HasSetIndex`
/// (`Array`) is bounds-checked like `getIndex`, no negative-growth.
pub fn set_index(recv: &Value, key: Value, value: Value) -> Result<(), RunError> {
    match recv {
        Value::Map(m) => {
            let k = value_key(&key)?;
            m.borrow_mut().insert(k, key, value);
            Ok(())
        }
        Value::Array(a) => {
            let i = expect_int(&key)?;
            let mut a = a.borrow_mut();
            let idx = normalize_index(i, a.len()).ok_or_else(|| index_error(i, "array"))?;
            a[idx] = value;
            Ok(())
        }
        other => Err(RunError::raised(
            ErrorKind::TypeError,
            format!("'{}' does not support item assignment", other.type_name()),
            None,
        )),
    }
}

/// `SETMAP`: unconditional insert used only by the compiler's map/class
/// literal lowering (the receiver is always freshly constructed, so there
/// is no "key not found" case to report).
pub fn set_map_literal_entry(recv: &Value, key: Value, value: Value) -> Result<(), RunError> {
    let Value::Map(m) = recv else {
        return Err(RunError::Internal("SETMAP on a non-map receiver".to_owned()));
    };
    let k = value_key(&key)?;
    m.borrow_mut().insert(k, key, value);
    Ok(())
}

/// `getAttr`: only `HasAttrs` (`Extern`) values implement this in the
/// core; every built-in type errors (language built-in methods are
/// policy, per spec §1, not wired here).
pub fn get_attr(recv: &Value, name: &str) -> Result<Value, RunError> {
    match recv {
        Value::Extern(e) => e
            .borrow()
            .get_attr(name)
            .unwrap_or_else(|| Err(RunError::raised(ErrorKind::AttrError, format!("no attribute '{name}'"), None))),
        other => Err(RunError::raised(
            ErrorKind::AttrError,
            format!("'{}' has no attribute '{name}'", other.type_name()),
            None,
        )),
    }
}

/// `setField`: only `HasSetField` (`Extern`) values implement this.
pub fn set_field(recv: &Value, name: &str, value: Value) -> Result<(), RunError> {
    match recv {
        Value::Extern(e) => e
            .borrow_mut()
            .set_field(name, value)
            .unwrap_or_else(|| Err(RunError::raised(ErrorKind::AttrError, format!("cannot set attribute '{name}'"), None))),
        other => Err(RunError::raised(
            ErrorKind::AttrError,
            format!("'{}' does not support attribute assignment", other.type_name()),
            None,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_index_wraps_and_out_of_range_errors() {
        let arr = Value::Array(Rc::new(RefCell::new(vec![Value::Int(1), Value::Int(2), Value::Int(3)])));
        assert!(matches!(get_index(&arr, &Value::Int(-1)).unwrap(), Value::Int(3)));
        assert!(get_index(&arr, &Value::Int(-4)).is_err());
        assert!(get_index(&arr, &Value::Int(3)).is_err());
    }

    #[test]
    fn empty_sequence_index_errors() {
        let arr = Value::Array(Rc::new(RefCell::new(Vec::new())));
        let err = get_index(&arr, &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::IndexError));
    }

    #[test]
    fn int_iterates_zero_to_n_minus_one() {
        let mut it = make_iter(&Value::Int(3)).unwrap();
        let mut out = Vec::new();
        while let Some(v) = it.next() {
            out.push(v);
        }
        assert!(matches!(out[..], [Value::Int(0), Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn negative_int_iterates_zero_times() {
        let mut it = make_iter(&Value::Int(-1)).unwrap();
        assert!(it.next().is_none());
    }
}
