// Arithmetic and comparison fast paths.
//
// Pure numeric rules live here; the VM layers metamethod fallback on top.
// Integer arithmetic stays exact (wrapping on overflow, like the
// reference semantics); mixing with floats widens. Division and
// exponentiation always produce floats; floor division and modulo follow
// the sign of the divisor.

use crate::lua_value::{LuaValue, float_to_integer};
use crate::lua_vm::{ArithOp, CmpOp};

/// Attempt a binary arithmetic operation on raw values. Returns None when
/// an operand does not coerce to a number (or integer, for bitwise ops);
/// the caller then tries the metamethod.
pub fn raw_arith(op: ArithOp, a: &LuaValue, b: &LuaValue) -> Option<LuaValue> {
    match op {
        ArithOp::Add | ArithOp::Sub | ArithOp::Mul | ArithOp::IDiv | ArithOp::Mod => {
            match coerce_pair(a, b)? {
                NumPair::Ints(i, j) => int_arith(op, i, j),
                NumPair::Floats(f, g) => Some(LuaValue::Float(float_arith(op, f, g))),
            }
        }
        ArithOp::Div => {
            let f = coerce_float(a)?;
            let g = coerce_float(b)?;
            Some(LuaValue::Float(f / g))
        }
        ArithOp::Pow => {
            let f = coerce_float(a)?;
            let g = coerce_float(b)?;
            Some(LuaValue::Float(f.powf(g)))
        }
        ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr => {
            let i = coerce_int(a)?;
            let j = coerce_int(b)?;
            Some(LuaValue::Integer(bit_arith(op, i, j)))
        }
    }
}

enum NumPair {
    Ints(i64, i64),
    Floats(f64, f64),
}

fn coerce_pair(a: &LuaValue, b: &LuaValue) -> Option<NumPair> {
    let a = coerce_number(a)?;
    let b = coerce_number(b)?;
    match (a, b) {
        (LuaValue::Integer(i), LuaValue::Integer(j)) => Some(NumPair::Ints(i, j)),
        _ => Some(NumPair::Floats(a.as_number()?, b.as_number()?)),
    }
}

/// Number coercion for arithmetic: numbers pass through, strings parse.
fn coerce_number(v: &LuaValue) -> Option<LuaValue> {
    match v {
        LuaValue::Integer(_) | LuaValue::Float(_) => Some(*v),
        _ => None,
    }
}

fn coerce_float(v: &LuaValue) -> Option<f64> {
    v.as_number()
}

/// Integer coercion for bitwise operators: exact floats only.
fn coerce_int(v: &LuaValue) -> Option<i64> {
    match v {
        LuaValue::Integer(i) => Some(*i),
        LuaValue::Float(f) => float_to_integer(*f),
        _ => None,
    }
}

fn int_arith(op: ArithOp, i: i64, j: i64) -> Option<LuaValue> {
    Some(match op {
        ArithOp::Add => LuaValue::Integer(i.wrapping_add(j)),
        ArithOp::Sub => LuaValue::Integer(i.wrapping_sub(j)),
        ArithOp::Mul => LuaValue::Integer(i.wrapping_mul(j)),
        ArithOp::IDiv => {
            if j == 0 {
                return None; // reported as "attempt to perform n//0"
            }
            LuaValue::Integer(floor_div(i, j))
        }
        ArithOp::Mod => {
            if j == 0 {
                return None;
            }
            LuaValue::Integer(floor_mod(i, j))
        }
        _ => unreachable!(),
    })
}

/// Floor division, rounding toward negative infinity.
fn floor_div(i: i64, j: i64) -> i64 {
    let q = i.wrapping_div(j);
    if (i % j != 0) && ((i < 0) != (j < 0)) { q - 1 } else { q }
}

/// Modulo with the divisor's sign.
fn floor_mod(i: i64, j: i64) -> i64 {
    let r = i.wrapping_rem(j);
    if r != 0 && (r < 0) != (j < 0) { r + j } else { r }
}

fn float_arith(op: ArithOp, f: f64, g: f64) -> f64 {
    match op {
        ArithOp::Add => f + g,
        ArithOp::Sub => f - g,
        ArithOp::Mul => f * g,
        ArithOp::IDiv => (f / g).floor(),
        ArithOp::Mod => {
            // Result keeps the divisor's sign.
            let r = f % g;
            if r != 0.0 && (r < 0.0) != (g < 0.0) { r + g } else { r }
        }
        _ => unreachable!(),
    }
}

fn bit_arith(op: ArithOp, i: i64, j: i64) -> i64 {
    match op {
        ArithOp::BAnd => i & j,
        ArithOp::BOr => i | j,
        ArithOp::BXor => i ^ j,
        ArithOp::Shl => shift_left(i, j),
        ArithOp::Shr => shift_left(i, j.wrapping_neg()),
        _ => unreachable!(),
    }
}

/// Logical shift with the full-range rule: shifts of 64 or more produce 0,
/// negative amounts shift the other way.
fn shift_left(i: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((i as u64) << n) as i64
    } else {
        ((i as u64) >> (-n)) as i64
    }
}

/// Numeric/string comparison without metamethods. Returns None when the
/// operands are not comparable natively (mixed or object types).
pub fn raw_compare(op: CmpOp, a: &LuaValue, b: &LuaValue, str_cmp: Option<std::cmp::Ordering>) -> Option<bool> {
    use std::cmp::Ordering;
    let ord: Ordering = match (a, b) {
        (LuaValue::Integer(i), LuaValue::Integer(j)) => i.cmp(j),
        (LuaValue::Float(f), LuaValue::Float(g)) => f.partial_cmp(g)?,
        (LuaValue::Integer(i), LuaValue::Float(g)) => (*i as f64).partial_cmp(g)?,
        (LuaValue::Float(f), LuaValue::Integer(j)) => f.partial_cmp(&(*j as f64))?,
        (LuaValue::String(_), LuaValue::String(_)) => str_cmp?,
        _ => return None,
    };
    Some(match op {
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
    })
}

/// Unary minus fast path.
pub fn raw_negate(v: &LuaValue) -> Option<LuaValue> {
    match v {
        LuaValue::Integer(i) => Some(LuaValue::Integer(i.wrapping_neg())),
        LuaValue::Float(f) => Some(LuaValue::Float(-f)),
        _ => None,
    }
}

/// Bitwise not fast path.
pub fn raw_bnot(v: &LuaValue) -> Option<LuaValue> {
    coerce_int(v).map(|i| LuaValue::Integer(!i))
}
