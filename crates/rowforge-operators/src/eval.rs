//! Dynamic value semantics shared by the interpreter and the generic parts of
//! compiled code.
//!
//! Rules follow Python: bools are ints in arithmetic, `/` always yields a float,
//! `//` and `%` floor toward negative infinity, `None` in arithmetic is a
//! `TypeError`, integer overflow is an `OverflowError`.

use rowforge_core::exception::ExceptionCode;
use rowforge_core::expr::{BinaryOp, Function, UnaryOp};
use rowforge_core::types::Scalar;

use ExceptionCode::*;

type EvalResult = Result<Scalar, ExceptionCode>;

fn int_like(v: &Scalar) -> Option<i64> {
    match v {
        Scalar::Bool(b) => Some(i64::from(*b)),
        Scalar::I64(i) => Some(*i),
        _ => None,
    }
}

/// Arithmetic and comparison operators. `and`/`or` short-circuit and are
/// handled by the evaluators, but are accepted here for completeness.
pub fn binary(op: BinaryOp, l: Scalar, r: Scalar) -> EvalResult {
    match op {
        BinaryOp::And => Ok(if l.truthy() { r } else { l }),
        BinaryOp::Or => Ok(if l.truthy() { l } else { r }),
        op if op.is_comparison() => compare(op, &l, &r).map(Scalar::Bool),
        op => arith(op, &l, &r),
    }
}

pub fn arith(op: BinaryOp, l: &Scalar, r: &Scalar) -> EvalResult {
    match (l, r) {
        (Scalar::Str(a), Scalar::Str(b)) if op == BinaryOp::Add => {
            Ok(Scalar::Str(format!("{a}{b}")))
        }
        (Scalar::Str(s), n) | (n, Scalar::Str(s)) if op == BinaryOp::Mul => match int_like(n) {
            Some(times) => repeat(s, times),
            None => Err(TypeError),
        },
        _ => {
            if let (Some(a), Some(b)) = (int_like(l), int_like(r)) {
                return int_arith(op, a, b);
            }
            match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => float_arith(op, a, b),
                _ => Err(TypeError),
            }
        }
    }
}

/// Longest string `str * int` may build.
pub const MAX_REPEAT_BYTES: usize = 1 << 30;

fn repeat(s: &str, times: i64) -> EvalResult {
    let times = usize::try_from(times.max(0)).map_err(|_| OverflowError)?;
    match s.len().checked_mul(times) {
        Some(len) if len <= MAX_REPEAT_BYTES => Ok(Scalar::Str(s.repeat(times))),
        _ => Err(OverflowError),
    }
}

pub fn int_arith(op: BinaryOp, a: i64, b: i64) -> EvalResult {
    let v = match op {
        BinaryOp::Add => a.checked_add(b).ok_or(OverflowError)?,
        BinaryOp::Sub => a.checked_sub(b).ok_or(OverflowError)?,
        BinaryOp::Mul => a.checked_mul(b).ok_or(OverflowError)?,
        BinaryOp::Div => {
            if b == 0 {
                return Err(ZeroDivisionError);
            }
            return Ok(Scalar::F64(a as f64 / b as f64));
        }
        BinaryOp::FloorDiv => floor_div(a, b)?,
        BinaryOp::Mod => floor_mod(a, b)?,
        _ => return Err(TypeError),
    };
    Ok(Scalar::I64(v))
}

pub fn float_arith(op: BinaryOp, a: f64, b: f64) -> EvalResult {
    let v = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(ZeroDivisionError);
            }
            a / b
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Err(ZeroDivisionError);
            }
            (a / b).floor()
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(ZeroDivisionError);
            }
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) {
                r + b
            } else {
                r
            }
        }
        _ => return Err(TypeError),
    };
    Ok(Scalar::F64(v))
}

fn floor_div(a: i64, b: i64) -> Result<i64, ExceptionCode> {
    if b == 0 {
        return Err(ZeroDivisionError);
    }
    let q = a.checked_div(b).ok_or(OverflowError)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

fn floor_mod(a: i64, b: i64) -> Result<i64, ExceptionCode> {
    if b == 0 {
        return Err(ZeroDivisionError);
    }
    if b == -1 {
        return Ok(0);
    }
    let r = a % b;
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

/// Equality never fails; ordering of incomparable values is a `TypeError`.
pub fn compare(op: BinaryOp, l: &Scalar, r: &Scalar) -> Result<bool, ExceptionCode> {
    use std::cmp::Ordering;

    let ord: Option<Ordering> = match (l, r) {
        (Scalar::Null, Scalar::Null) => Some(Ordering::Equal),
        (Scalar::Null, _) | (_, Scalar::Null) => None,
        (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
        _ => match (int_like(l), int_like(r)) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        },
    };

    match op {
        BinaryOp::Eq => Ok(ord == Some(Ordering::Equal)),
        BinaryOp::NotEq => Ok(ord != Some(Ordering::Equal)),
        _ => {
            let comparable = !l.is_null()
                && !r.is_null()
                && (matches!((l, r), (Scalar::Str(_), Scalar::Str(_)))
                    || (l.as_f64().is_some() && r.as_f64().is_some()));
            if !comparable {
                return Err(TypeError);
            }
            // NaN compares false on every ordering.
            let Some(ord) = ord else { return Ok(false) };
            Ok(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::LtEq => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                BinaryOp::GtEq => ord != Ordering::Less,
                _ => return Err(TypeError),
            })
        }
    }
}

pub fn unary(op: UnaryOp, v: Scalar) -> EvalResult {
    match op {
        UnaryOp::Not => Ok(Scalar::Bool(!v.truthy())),
        UnaryOp::Neg => match v {
            Scalar::Bool(b) => Ok(Scalar::I64(-i64::from(b))),
            Scalar::I64(i) => i.checked_neg().map(Scalar::I64).ok_or(OverflowError),
            Scalar::F64(f) => Ok(Scalar::F64(-f)),
            _ => Err(TypeError),
        },
    }
}

fn float_to_int(f: f64) -> Result<i64, ExceptionCode> {
    if f.is_nan() {
        return Err(ValueError);
    }
    if !f.is_finite() || f >= i64::MAX as f64 || f < i64::MIN as f64 {
        return Err(OverflowError);
    }
    Ok(f as i64)
}

fn numeric_arg(v: &Scalar) -> Result<f64, ExceptionCode> {
    v.as_f64().ok_or(TypeError)
}

pub fn call(func: Function, mut args: Vec<Scalar>) -> EvalResult {
    if func == Function::Coalesce {
        return Ok(args
            .into_iter()
            .find(|a| !a.is_null())
            .unwrap_or(Scalar::Null));
    }
    if args.len() != 1 {
        return Err(TypeError);
    }
    let v = args.swap_remove(0);

    match func {
        Function::Int => match v {
            Scalar::Null => Err(TypeError),
            Scalar::Str(s) => s.trim().parse::<i64>().map(Scalar::I64).map_err(|_| ValueError),
            Scalar::F64(f) => float_to_int(f.trunc()).map(Scalar::I64),
            other => int_like(&other).map(Scalar::I64).ok_or(TypeError),
        },
        Function::Float => match v {
            Scalar::Null => Err(TypeError),
            Scalar::Str(s) => s.trim().parse::<f64>().map(Scalar::F64).map_err(|_| ValueError),
            other => numeric_arg(&other).map(Scalar::F64),
        },
        Function::Str => Ok(Scalar::Str(v.to_string())),
        Function::Bool => Ok(Scalar::Bool(v.truthy())),
        Function::Len => match v {
            Scalar::Str(s) => Ok(Scalar::I64(s.chars().count() as i64)),
            _ => Err(TypeError),
        },
        Function::Upper => match v {
            Scalar::Str(s) => Ok(Scalar::Str(s.to_uppercase())),
            _ => Err(TypeError),
        },
        Function::Lower => match v {
            Scalar::Str(s) => Ok(Scalar::Str(s.to_lowercase())),
            _ => Err(TypeError),
        },
        Function::Strip => match v {
            Scalar::Str(s) => Ok(Scalar::Str(s.trim().to_string())),
            _ => Err(TypeError),
        },
        Function::Abs => match v {
            Scalar::F64(f) => Ok(Scalar::F64(f.abs())),
            other => int_like(&other)
                .ok_or(TypeError)?
                .checked_abs()
                .map(Scalar::I64)
                .ok_or(OverflowError),
        },
        Function::Round => match v {
            Scalar::F64(f) => float_to_int(f.round_ties_even()).map(Scalar::I64),
            other => int_like(&other).map(Scalar::I64).ok_or(TypeError),
        },
        Function::Sqrt => {
            let x = numeric_arg(&v)?;
            if x < 0.0 {
                return Err(ValueError);
            }
            Ok(Scalar::F64(x.sqrt()))
        }
        Function::Log => {
            let x = numeric_arg(&v)?;
            if x <= 0.0 {
                return Err(ValueError);
            }
            Ok(Scalar::F64(x.ln()))
        }
        Function::Exp => {
            let x = numeric_arg(&v)?;
            let y = x.exp();
            if y.is_infinite() && x.is_finite() {
                return Err(OverflowError);
            }
            Ok(Scalar::F64(y))
        }
        Function::Sin | Function::Cos => {
            let x = numeric_arg(&v)?;
            if x.is_infinite() {
                return Err(ValueError);
            }
            Ok(Scalar::F64(if func == Function::Sin { x.sin() } else { x.cos() }))
        }
        Function::IsNull => Ok(Scalar::Bool(v.is_null())),
        Function::Coalesce => Ok(v),
    }
}
