//! `Binary(op, x, y)`: arithmetic, bitwise, and concatenation dispatch for
//! `PLUS MINUS STAR SLASH SLASHSLASH PERCENT CIRCUMFLEX AMPERSAND PIPE LTLT
//! GTGT`. Unhandled concrete-type pairs fall through to the left then
//! right operand's [`crate::value::ExternValue::binary`] hook; a `None`
//! from both means "unknown binary op".
//!
//! Integer arithmetic overflows as two's-complement 64-bit (Rust's
//! `wrapping_*`). `SLASH` is true division and always yields a `Float`;
//! `SLASHSLASH`/`PERCENT` floor towards negative infinity (so
//! `(-7).floordiv(2) == -4` and `(-7) % 2 == 1`, the divisor's sign),
//! matching the pairing used by most dynamically-typed scripting
//! languages with both a `/` and a `//` operator.

use std::rc::Rc;

use crate::{
    ast::{BinOp, UnOp},
    bytecode::Opcode,
    error::{ErrorKind, RunError},
    value::Value,
};

const MAX_SHIFT: i64 = 512;

fn op_symbol(op: Opcode) -> &'static str {
    match op {
        Opcode::Plus => "+",
        Opcode::Minus => "-",
        Opcode::Star => "*",
        Opcode::Slash => "/",
        Opcode::SlashSlash => "//",
        Opcode::Percent => "%",
        Opcode::Circumflex => "^",
        Opcode::Ampersand => "&",
        Opcode::Pipe => "|",
        Opcode::LtLt => "<<",
        Opcode::GtGt => ">>",
        _ => "?",
    }
}

fn divide_by_zero(op: Opcode) -> RunError {
    RunError::raised(ErrorKind::DivideByZero, format!("division by zero in '{}'", op_symbol(op)), None)
}

/// `opcode_to_binop` is the compiler's forward mapping; the VM only needs
/// the opcode, so binary dispatch is written directly over `Opcode`
/// rather than re-threading a `BinOp`.
pub fn binary(op: Opcode, x: &Value, y: &Value) -> Result<Option<Value>, RunError> {
    use Value::{Array, Bytes, Float, Int, Str, Tuple};
    let result = match (op, x, y) {
        (Opcode::Plus, Int(a), Int(b)) => Int(a.wrapping_add(*b)),
        (Opcode::Plus, Float(a), Float(b)) => Float(a + b),
        (Opcode::Plus, Int(a), Float(b)) => Float(*a as f64 + b),
        (Opcode::Plus, Float(a), Int(b)) => Float(a + *b as f64),
        (Opcode::Plus, Str(a), Str(b)) => Str(Rc::from(format!("{a}{b}"))),
        (Opcode::Plus, Bytes(a), Bytes(b)) => Bytes(Rc::from([a.as_ref(), b.as_ref()].concat())),
        (Opcode::Plus, Tuple(a), Tuple(b)) => Tuple(Rc::from([a.as_ref(), b.as_ref()].concat())),
        (Opcode::Plus, Array(a), Array(b)) => {
            let mut v = a.borrow().clone();
            v.extend(b.borrow().iter().cloned());
            Array(Rc::new(std::cell::RefCell::new(v)))
        }

        (Opcode::Minus, Int(a), Int(b)) => Int(a.wrapping_sub(*b)),
        (Opcode::Minus, Float(a), Float(b)) => Float(a - b),
        (Opcode::Minus, Int(a), Float(b)) => Float(*a as f64 - b),
        (Opcode::Minus, Float(a), Int(b)) => Float(a - *b as f64),

        (Opcode::Star, Int(a), Int(b)) => Int(a.wrapping_mul(*b)),
        (Opcode::Star, Float(a), Float(b)) => Float(a * b),
        (Opcode::Star, Int(a), Float(b)) => Float(*a as f64 * b),
        (Opcode::Star, Float(a), Int(b)) => Float(a * *b as f64),

        (Opcode::Slash, Int(a), Int(b)) => {
            if *b == 0 {
                return Err(divide_by_zero(op));
            }
            Float(*a as f64 / *b as f64)
        }
        (Opcode::Slash, Float(a), Float(b)) => {
            if *b == 0.0 {
                return Err(divide_by_zero(op));
            }
            Float(a / b)
        }
        (Opcode::Slash, Int(a), Float(b)) => {
            if *b == 0.0 {
                return Err(divide_by_zero(op));
            }
            Float(*a as f64 / b)
        }
        (Opcode::Slash, Float(a), Int(b)) => {
            if *b == 0 {
                return Err(divide_by_zero(op));
            }
            Float(a / *b as f64)
        }

        (Opcode::SlashSlash, Int(a), Int(b)) => {
            if *b == 0 {
                return Err(divide_by_zero(op));
            }
            Int(floor_div(*a, *b))
        }
        (Opcode::SlashSlash, Float(a), Float(b)) => {
            if *b == 0.0 {
                return Err(divide_by_zero(op));
            }
            Float((a / b).floor())
        }
        (Opcode::SlashSlash, Int(a), Float(b)) => {
            if *b == 0.0 {
                return Err(divide_by_zero(op));
            }
            Float((*a as f64 / b).floor())
        }
        (Opcode::SlashSlash, Float(a), Int(b)) => {
            if *b == 0 {
                return Err(divide_by_zero(op));
            }
            Float((a / *b as f64).floor())
        }

        (Opcode::Percent, Int(a), Int(b)) => {
            if *b == 0 {
                return Err(divide_by_zero(op));
            }
            Int(floor_mod(*a, *b))
        }
        (Opcode::Percent, Float(a), Float(b)) => {
            if *b == 0.0 {
                return Err(divide_by_zero(op));
            }
            Float(a - (a / b).floor() * b)
        }
        (Opcode::Percent, Int(a), Float(b)) => {
            if *b == 0.0 {
                return Err(divide_by_zero(op));
            }
            let a = *a as f64;
            Float(a - (a / b).floor() * b)
        }
        (Opcode::Percent, Float(a), Int(b)) => {
            if *b == 0 {
                return Err(divide_by_zero(op));
            }
            let b = *b as f64;
            Float(a - (a / b).floor() * b)
        }

        (Opcode::Circumflex, Int(a), Int(b)) => Int(a ^ b),
        (Opcode::Ampersand, Int(a), Int(b)) => Int(a & b),
        (Opcode::Pipe, Int(a), Int(b)) => Int(a | b),

        (Opcode::LtLt, Int(a), Int(b)) => Int(shift(*a, *b, true)?),
        (Opcode::GtGt, Int(a), Int(b)) => Int(shift(*a, *b, false)?),

        _ => return Ok(None),
    };
    Ok(Some(result))
}

/// Integer division rounded towards negative infinity (so the quotient
/// and remainder pair with [`floor_mod`], whose sign always matches `b`).
/// Uses `wrapping_div` so `i64::MIN / -1` wraps instead of panicking,
/// consistent with the rest of this module's two's-complement overflow.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q }
}

fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) { r + b } else { r }
}

fn shift(value: i64, amount: i64, left: bool) -> Result<i64, RunError> {
    if !(0..MAX_SHIFT).contains(&amount) {
        return Err(RunError::raised(
            ErrorKind::TypeError,
            format!("shift count {amount} out of range [0, {MAX_SHIFT})"),
            None,
        ));
    }
    #[allow(clippy::cast_possible_truncation)]
    let amount = amount as u32;
    Ok(if left { value.wrapping_shl(amount) } else { value.wrapping_shr(amount) })
}

/// `NOT` is handled directly by the VM (universal truthiness inversion,
/// per spec §4.5 "Unary"); every other unary opcode lands here first and
/// falls through to [`crate::value::ExternValue::unary`] on a miss.
pub fn unary(op: UnOp, x: &Value) -> Result<Option<Value>, RunError> {
    let result = match (op, x) {
        (UnOp::Plus, Value::Int(a)) => Value::Int(*a),
        (UnOp::Plus, Value::Float(a)) => Value::Float(*a),
        (UnOp::Minus, Value::Int(a)) => Value::Int(a.wrapping_neg()),
        (UnOp::Minus, Value::Float(a)) => Value::Float(-a),
        (UnOp::BitNot, Value::Int(a)) => Value::Int(!a),
        (UnOp::Len, Value::Str(s)) => Value::Int(s.len() as i64),
        (UnOp::Len, Value::Bytes(b)) => Value::Int(b.len() as i64),
        (UnOp::Len, Value::Tuple(t)) => Value::Int(t.len() as i64),
        (UnOp::Len, Value::Array(a)) => Value::Int(a.borrow().len() as i64),
        (UnOp::Len, Value::Map(m)) => Value::Int(m.borrow().len() as i64),
        _ => return Ok(None),
    };
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_add_wraps_on_overflow() {
        let r = binary(Opcode::Plus, &Value::Int(i64::MAX), &Value::Int(1)).unwrap().unwrap();
        assert!(matches!(r, Value::Int(v) if v == i64::MIN));
    }

    #[test]
    fn division_by_zero_errors() {
        let err = binary(Opcode::Slash, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::DivideByZero));
        let err = binary(Opcode::Percent, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::DivideByZero));
    }

    #[test]
    fn floor_div_and_mod_match_divisor_sign() {
        assert!(matches!(binary(Opcode::SlashSlash, &Value::Int(-7), &Value::Int(2)).unwrap(), Some(Value::Int(-4))));
        assert!(matches!(binary(Opcode::Percent, &Value::Int(-7), &Value::Int(2)).unwrap(), Some(Value::Int(1))));
    }

    #[test]
    fn shift_out_of_range_errors() {
        assert!(shift(1, -1, true).is_err());
        assert!(shift(1, 512, true).is_err());
        assert!(shift(1, 511, true).is_ok());
    }

    #[test]
    fn string_plus_concatenates() {
        let r = binary(Opcode::Plus, &Value::Str("a".into()), &Value::Str("b".into())).unwrap().unwrap();
        assert!(matches!(&r, Value::Str(s) if &**s == "ab"));
    }

    #[test]
    fn unhandled_pair_returns_none() {
        assert!(binary(Opcode::Plus, &Value::Str("a".into()), &Value::Int(1)).unwrap().is_none());
    }
}
