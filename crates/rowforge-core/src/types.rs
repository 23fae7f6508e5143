//! Row-oriented values.
//!
//! A row is a plain `Vec<Scalar>` positioned by the schema that travels with it.
//! Values serialize untagged so YAML/JSON literals map onto them naturally.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::schema::DataType;

pub type Row = Vec<Scalar>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
}

impl Scalar {
    /// Runtime type of the value; `Null` reports `Any`.
    pub fn data_type(&self) -> DataType {
        match self {
            Scalar::Null => DataType::Any,
            Scalar::Bool(_) => DataType::Boolean,
            Scalar::I64(_) => DataType::Int64,
            Scalar::F64(_) => DataType::Float64,
            Scalar::Str(_) => DataType::Utf8,
        }
    }

    /// Short type name used in exception payloads and diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Scalar::Null => "null",
            Scalar::Bool(_) => "bool",
            Scalar::I64(_) => "int",
            Scalar::F64(_) => "float",
            Scalar::Str(_) => "str",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Does the value fit a column declared as `dt`? Nulls fit nullable columns.
    pub fn conforms_to(&self, dt: DataType, nullable: bool) -> bool {
        match (self, dt) {
            (_, DataType::Any) => true,
            (Scalar::Null, _) => nullable,
            (v, dt) => v.data_type() == dt,
        }
    }

    /// Truthiness: null, false, zero and the empty string are false.
    pub fn truthy(&self) -> bool {
        match self {
            Scalar::Null => false,
            Scalar::Bool(b) => *b,
            Scalar::I64(i) => *i != 0,
            Scalar::F64(f) => *f != 0.0,
            Scalar::Str(s) => !s.is_empty(),
        }
    }

    /// Numeric view; bools count as 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Scalar::I64(i) => Some(*i as f64),
            Scalar::F64(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Bool(b) => Some(i64::from(*b)),
            Scalar::I64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Normalised, hashable and totally ordered key for grouping and joins.
    pub fn key(&self) -> ScalarKey {
        match self {
            Scalar::Null => ScalarKey::Null,
            Scalar::Bool(b) => ScalarKey::Bool(*b),
            Scalar::I64(i) => ScalarKey::Int(*i),
            Scalar::F64(f) => float_key(*f),
            Scalar::Str(s) => ScalarKey::Str(s.clone()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("None"),
            Scalar::Bool(true) => f.write_str("True"),
            Scalar::Bool(false) => f.write_str("False"),
            Scalar::I64(i) => write!(f, "{i}"),
            Scalar::F64(x) => f.write_str(&format_float(*x)),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::I64(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::F64(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

/// Floats print with a trailing `.0` when integral so they stay distinguishable
/// from ints after a CSV round trip.
pub fn format_float(x: f64) -> String {
    if x.is_nan() {
        "nan".to_string()
    } else if x.is_infinite() {
        if x > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{x:.1}")
    } else {
        format!("{x}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
}

fn float_key(f: f64) -> ScalarKey {
    if f.is_nan() {
        return ScalarKey::Float(f64::NAN.to_bits());
    }
    // Integral floats group with the equal int.
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        return ScalarKey::Int(f as i64);
    }
    ScalarKey::Float(f.to_bits())
}

/// Compare two scalars for sorting. Nulls sort first, ints and floats compare
/// numerically, other mixed types order by variant.
pub fn scalar_cmp(a: &Scalar, b: &Scalar) -> Ordering {
    use Scalar::*;

    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Bool(x), Bool(y)) => x.cmp(y),
        (I64(x), I64(y)) => x.cmp(y),
        (Str(x), Str(y)) => x.cmp(y),
        (I64(_) | F64(_), I64(_) | F64(_)) => {
            let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        _ => type_order(a).cmp(&type_order(b)),
    }
}

/// Lexicographic row comparison built on [`scalar_cmp`].
pub fn row_cmp(a: &[Scalar], b: &[Scalar]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match scalar_cmp(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

fn type_order(s: &Scalar) -> u8 {
    match s {
        Scalar::Null => 0,
        Scalar::Bool(_) => 1,
        Scalar::I64(_) | Scalar::F64(_) => 2,
        Scalar::Str(_) => 3,
    }
}
