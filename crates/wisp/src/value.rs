//! The runtime value model and the extension hook surface
//! (`HasBinary`/`HasUnary`/`HasAttrs`/`HasSetField`) that lets a host
//! register opaque value types without the core growing a class system.
//! This is a tagged union with a small vtable per variant rather than a
//! deep trait-object hierarchy — the only trait object in the whole enum
//! is the one escape hatch, [`Value::Extern`].

use std::{cell::RefCell, fmt, rc::Rc};

use ahash::RandomState;
use indexmap::IndexMap;

use crate::{
    ast::{BinOp, UnOp},
    bytecode::code::Funcode,
    error::RunError,
};

/// A heap-boxed, mutable sequence (spec §3: "mutable sequence").
pub type ArrayRef = Rc<RefCell<Vec<Value>>>;
/// A single-slot box shared by an enclosing function and its closures.
pub type CellRef = Rc<RefCell<Value>>;

/// The closed set of first-class runtime values.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Tuple(Rc<[Value]>),
    Array(ArrayRef),
    Map(Rc<RefCell<ValueMap>>),
    Function(Rc<FunctionValue>),
    Cell(CellRef),
    /// An arithmetic sequence, e.g. produced by iterating an `Int` or by a
    /// host-exposed `range`-like builtin. Iterable, not Indexable/Ordered.
    Range(RangeValue),
    /// Host-provided opaque value implementing some subset of the
    /// capability hooks below. Not produced by any core opcode; only a
    /// `Predeclared` binding or a `HasBinary`/`HasAttrs` hook handler can
    /// introduce one.
    Extern(Rc<RefCell<dyn ExternValue>>),
}

/// A half-open arithmetic sequence `start, start+step, ... < stop` (for
/// positive `step`) or `> stop` (for negative `step`). `step` is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    #[must_use]
    pub fn len(&self) -> i64 {
        if self.step > 0 {
            if self.stop <= self.start { 0 } else { (self.stop - self.start - 1) / self.step + 1 }
        } else if self.stop >= self.start {
            0
        } else {
            (self.start - self.stop - 1) / (-self.step) + 1
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A compiled function plus the cells it closes over.
pub struct FunctionValue {
    pub funcode: Rc<Funcode>,
    /// Captured cells, in `Funcode.Freevars` order.
    pub freevars: Vec<CellRef>,
}

impl fmt::Debug for FunctionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionValue").field("name", &self.funcode.name).finish()
    }
}

/// A map key: the subset of values for which equality is defined (every
/// primitive type, plus a `Tuple` built entirely from such values).
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Nil,
    Bool(bool),
    Int(i64),
    /// Bit pattern of an `f64`, so `Key` can be `Hash`/`Eq`. Two distinct
    /// NaN bit patterns hash/compare unequal, matching IEEE bit identity
    /// rather than IEEE `==` (which has no reflexive NaN anyway).
    FloatBits(u64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Tuple(Rc<[Key]>),
}

/// Converts a `Value` into a `Key`, or a `TypeError` for an unhashable value
/// (any container that isn't itself a `Tuple` of hashable values).
pub fn value_key(v: &Value) -> Result<Key, RunError> {
    Ok(match v {
        Value::Nil => Key::Nil,
        Value::Bool(b) => Key::Bool(*b),
        Value::Int(i) => Key::Int(*i),
        Value::Float(f) => Key::FloatBits(f.to_bits()),
        Value::Str(s) => Key::Str(s.clone()),
        Value::Bytes(b) => Key::Bytes(b.clone()),
        Value::Tuple(items) => {
            let keys: Result<Vec<Key>, RunError> = items.iter().map(value_key).collect();
            Key::Tuple(Rc::from(keys?))
        }
        other => {
            return Err(RunError::raised(
                crate::error::ErrorKind::TypeError,
                format!("unhashable type: '{}'", other.type_name()),
                None,
            ));
        }
    })
}

/// A mutable, insertion-ordered mapping.
///
/// Keeps both the original `Value` key (for iteration/display, so a
/// `Float` key round-trips as a float rather than a raw bit pattern) and
/// the value under [`Key`].
#[derive(Default)]
pub struct ValueMap {
    entries: IndexMap<Key, (Value, Value), RandomState>,
}

impl ValueMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: Key, key_value: Value, value: Value) {
        self.entries.insert(key, (key_value, value));
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        self.entries.shift_remove(key).map(|(_, v)| v)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> + '_ {
        self.entries.values().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> + '_ {
        self.entries.values().map(|(k, v)| (k, v))
    }

    pub fn key_at(&self, idx: usize) -> Option<&Value> {
        self.entries.get_index(idx).map(|(_, (k, _))| k)
    }
}

/// Extension hooks a host-registered opaque value type may implement.
///
/// Every hook defaults to "not handled" (`None`), at which point the VM
/// falls through to a `TypeError`/`AttrError`.
pub trait ExternValue: fmt::Debug {
    fn type_name(&self) -> &'static str;
    fn to_display_string(&self) -> String;

    fn get_attr(&self, _name: &str) -> Option<Result<Value, RunError>> {
        None
    }
    fn set_field(&mut self, _name: &str, _value: Value) -> Option<Result<(), RunError>> {
        None
    }
    /// `lhs_is_self` is `true` when `self` was the left operand; the hook
    /// is tried on the left operand first, then the right.
    fn binary(&self, _op: BinOp, _other: &Value, _lhs_is_self: bool) -> Option<Result<Value, RunError>> {
        None
    }
    fn unary(&self, _op: UnOp) -> Option<Result<Value, RunError>> {
        None
    }
}

impl Value {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Function(_) => "function",
            Value::Cell(_) => "cell",
            Value::Range(_) => "range",
            Value::Extern(e) => e.borrow().type_name(),
        }
    }

    /// Whether the value is truthy, for `NOT`, `and`/`or`, and `CJMP`.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Array(a) => !a.borrow().is_empty(),
            Value::Map(m) => !m.borrow().is_empty(),
            Value::Range(r) => !r.is_empty(),
            Value::Function(_) | Value::Cell(_) | Value::Extern(_) => true,
        }
    }

    /// Bounded-depth display string. Containers stop recursing past
    /// `max_depth` and print `...` instead of looping forever on a cycle.
    #[must_use]
    pub fn to_display_string(&self, max_depth: u32) -> String {
        if max_depth == 0 {
            return "...".to_owned();
        }
        match self {
            Value::Nil => "nil".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => format!("{s:?}"),
            Value::Bytes(b) => format!("b{:?}", String::from_utf8_lossy(b)),
            Value::Tuple(items) => display_seq('(', ')', items.iter(), max_depth),
            Value::Array(a) => display_seq('[', ']', a.borrow().iter(), max_depth),
            Value::Map(m) => {
                let m = m.borrow();
                let mut s = String::from("{");
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        s.push_str(", ");
                    }
                    s.push_str(&k.to_display_string(max_depth - 1));
                    s.push_str(": ");
                    s.push_str(&v.to_display_string(max_depth - 1));
                }
                s.push('}');
                s
            }
            Value::Function(f) => format!("<function {}>", f.funcode.name),
            Value::Cell(c) => c.borrow().to_display_string(max_depth - 1),
            Value::Range(r) => format!("range({}, {}, {})", r.start, r.stop, r.step),
            Value::Extern(e) => e.borrow().to_display_string(),
        }
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_owned()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".to_owned() } else { "-inf".to_owned() }
    } else if f == f.trunc() && f.abs() < 1e17 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn display_seq<'a>(open: char, close: char, items: impl Iterator<Item = &'a Value>, max_depth: u32) -> String {
    let mut s = String::new();
    s.push(open);
    for (i, v) in items.enumerate() {
        if i > 0 {
            s.push_str(", ");
        }
        s.push_str(&v.to_display_string(max_depth - 1));
    }
    s.push(close);
    s
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string(16))
    }
}
