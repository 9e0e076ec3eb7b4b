//! Owned values produced by expression evaluation.
//!
//! Records store values in place; the evaluator boxes them into this owned
//! form at its boundary, which is the only place evaluation is allowed to
//! allocate (besides string-producing methods).

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sluice_core::types::{ticks_to_datetime, FieldValue};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Str(String),
    /// 100 ns ticks since 0001-01-01T00:00:00 UTC.
    DateTime(i64),
    Guid(Uuid),
}

impl Value {
    /// Human-readable type name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Str(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Guid(_) => "guid",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<FieldValue<'_>> for Value {
    fn from(v: FieldValue<'_>) -> Self {
        match v {
            FieldValue::Null => Value::Null,
            FieldValue::Int16(n) => Value::Int(n.into()),
            FieldValue::Int32(n) => Value::Int(n.into()),
            FieldValue::Int64(n) => Value::Int(n),
            FieldValue::Byte(n) => Value::Int(n.into()),
            FieldValue::Float32(n) => Value::Float(n.into()),
            FieldValue::Float64(n) => Value::Float(n),
            FieldValue::Boolean(b) => Value::Bool(b),
            FieldValue::DateTime(t) => Value::DateTime(t),
            FieldValue::Decimal(d) => Value::Decimal(d),
            FieldValue::Guid(g) => Value::Guid(g),
            FieldValue::Str(s) => Value::Str(s.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Str(s) => f.write_str(s),
            Value::DateTime(ticks) => match ticks_to_datetime(*ticks) {
                Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.7fZ")),
                None => write!(f, "{ticks}t"),
            },
            Value::Guid(g) => write!(f, "{g}"),
        }
    }
}

/// Two numerics promoted to a common representation. Any float operand
/// promotes to floats; otherwise a decimal operand promotes to decimals.
pub(crate) enum NumericPair {
    Ints(i64, i64),
    Floats(f64, f64),
    Decimals(Decimal, Decimal),
}

pub(crate) fn numeric_pair(a: &Value, b: &Value) -> Option<NumericPair> {
    use Value::*;
    Some(match (a, b) {
        (Int(x), Int(y)) => NumericPair::Ints(*x, *y),
        (Float(x), Float(y)) => NumericPair::Floats(*x, *y),
        (Float(x), Int(y)) => NumericPair::Floats(*x, *y as f64),
        (Int(x), Float(y)) => NumericPair::Floats(*x as f64, *y),
        (Float(x), Decimal(y)) => NumericPair::Floats(*x, y.to_f64()?),
        (Decimal(x), Float(y)) => NumericPair::Floats(x.to_f64()?, *y),
        (Decimal(x), Decimal(y)) => NumericPair::Decimals(*x, *y),
        (Decimal(x), Int(y)) => NumericPair::Decimals(*x, rust_decimal::Decimal::from(*y)),
        (Int(x), Decimal(y)) => NumericPair::Decimals(rust_decimal::Decimal::from(*x), *y),
        _ => return None,
    })
}
