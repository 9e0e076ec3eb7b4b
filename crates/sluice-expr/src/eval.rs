//! Evaluation of a compiled expression tree against one record.
//!
//! Evaluation is synchronous and never suspends; failures surface as plain
//! messages here and are wrapped with the source expression and line number
//! at the crate boundary.

use crate::parser::{BinaryOp, Expr, UnaryOp};
use crate::value::{numeric_pair, NumericPair, Value};
use chrono::{Datelike, Duration, Months};
use sluice_core::record::Record;
use sluice_core::types::{datetime_to_ticks, ticks_to_datetime};

pub(crate) fn eval(expr: &Expr, record: &Record<'_>) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Row => Err("`row` is a container, not a value".into()),
        Expr::Index(recv, key) => {
            if !matches!(recv.as_ref(), Expr::Row) {
                return Err("only the `row` container is indexable".into());
            }
            let key = eval(key, record)?;
            let Value::Str(name) = key else {
                return Err(format!("row index must be a string, got {}", key.kind()));
            };
            let field = record
                .get_by_name(&name)
                .map_err(|e| e.to_string())?;
            Ok(Value::from(field))
        }
        Expr::Unary(op, inner) => {
            let v = eval(inner, record)?;
            match op {
                UnaryOp::Not => match v {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(format!("`!` needs a boolean, got {}", other.kind())),
                },
                UnaryOp::Neg => match v {
                    Value::Int(n) => n
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| "integer overflow in negation".into()),
                    Value::Float(n) => Ok(Value::Float(-n)),
                    Value::Decimal(d) => Ok(Value::Decimal(-d)),
                    other => Err(format!("`-` needs a number, got {}", other.kind())),
                },
            }
        }
        Expr::Binary(BinaryOp::And, left, right) => match eval(left, record)? {
            Value::Bool(false) => Ok(Value::Bool(false)),
            Value::Bool(true) => expect_bool(eval(right, record)?, "&&"),
            other => Err(format!("`&&` needs booleans, got {}", other.kind())),
        },
        Expr::Binary(BinaryOp::Or, left, right) => match eval(left, record)? {
            Value::Bool(true) => Ok(Value::Bool(true)),
            Value::Bool(false) => expect_bool(eval(right, record)?, "||"),
            other => Err(format!("`||` needs booleans, got {}", other.kind())),
        },
        Expr::Binary(BinaryOp::Coalesce, left, right) => {
            let v = eval(left, record)?;
            if v.is_null() {
                eval(right, record)
            } else {
                Ok(v)
            }
        }
        Expr::Binary(op, left, right) => {
            let a = eval(left, record)?;
            let b = eval(right, record)?;
            binary(*op, a, b)
        }
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => match eval(cond, record)? {
            Value::Bool(true) => eval(then, record),
            Value::Bool(false) => eval(otherwise, record),
            other => Err(format!(
                "conditional needs a boolean condition, got {}",
                other.kind()
            )),
        },
        Expr::Member { recv, name } => {
            let v = receiver_value(recv, record)?;
            member(&v, name)
        }
        Expr::Call { recv, name, args } => {
            // `row.ContainsKey(...)` acts on the container itself.
            if matches!(recv.as_ref(), Expr::Row) {
                if name == "ContainsKey" {
                    let [arg] = args.as_slice() else {
                        return Err("ContainsKey takes exactly one argument".into());
                    };
                    let Value::Str(key) = eval(arg, record)? else {
                        return Err("ContainsKey takes a string".into());
                    };
                    return Ok(Value::Bool(record.schema().contains(&key)));
                }
                return Err(format!("unknown method `{name}` on the row container"));
            }
            let v = eval(recv, record)?;
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval(arg, record)?);
            }
            call(&v, name, &evaluated)
        }
    }
}

fn receiver_value(recv: &Expr, record: &Record<'_>) -> Result<Value, String> {
    if matches!(recv, Expr::Row) {
        return Err("the row container has no properties".into());
    }
    eval(recv, record)
}

fn expect_bool(v: Value, op: &str) -> Result<Value, String> {
    match v {
        Value::Bool(_) => Ok(v),
        other => Err(format!("`{op}` needs booleans, got {}", other.kind())),
    }
}

fn binary(op: BinaryOp, a: Value, b: Value) -> Result<Value, String> {
    match op {
        BinaryOp::Add => add(a, b),
        BinaryOp::Sub => arith(op, a, b),
        BinaryOp::Mul => arith(op, a, b),
        BinaryOp::Div => arith(op, a, b),
        BinaryOp::Eq => Ok(Value::Bool(equal(&a, &b))),
        BinaryOp::Ne => Ok(Value::Bool(!equal(&a, &b))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => order(op, &a, &b),
        // Short-circuit forms are handled before operand evaluation.
        BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => {
            Err(format!("operator {op:?} must not reach binary()"))
        }
    }
}

fn add(a: Value, b: Value) -> Result<Value, String> {
    if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) {
        return Ok(Value::Str(format!("{a}{b}")));
    }
    match numeric_pair(&a, &b) {
        Some(NumericPair::Ints(x, y)) => x
            .checked_add(y)
            .map(Value::Int)
            .ok_or_else(|| "integer overflow in `+`".into()),
        Some(NumericPair::Floats(x, y)) => Ok(Value::Float(x + y)),
        Some(NumericPair::Decimals(x, y)) => x
            .checked_add(y)
            .map(Value::Decimal)
            .ok_or_else(|| "decimal overflow in `+`".into()),
        None => Err(format!("cannot add {} and {}", a.kind(), b.kind())),
    }
}

fn arith(op: BinaryOp, a: Value, b: Value) -> Result<Value, String> {
    let symbol = match op {
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        _ => unreachable!(),
    };
    let pair = numeric_pair(&a, &b)
        .ok_or_else(|| format!("cannot apply `{symbol}` to {} and {}", a.kind(), b.kind()))?;
    match pair {
        NumericPair::Ints(x, y) => {
            let result = match op {
                BinaryOp::Sub => x.checked_sub(y),
                BinaryOp::Mul => x.checked_mul(y),
                BinaryOp::Div => {
                    if y == 0 {
                        return Err("division by zero".into());
                    }
                    x.checked_div(y)
                }
                _ => unreachable!(),
            };
            result
                .map(Value::Int)
                .ok_or_else(|| format!("integer overflow in `{symbol}`"))
        }
        NumericPair::Floats(x, y) => Ok(Value::Float(match op {
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            _ => unreachable!(),
        })),
        NumericPair::Decimals(x, y) => {
            let result = match op {
                BinaryOp::Sub => x.checked_sub(y),
                BinaryOp::Mul => x.checked_mul(y),
                BinaryOp::Div => {
                    if y.is_zero() {
                        return Err("division by zero".into());
                    }
                    x.checked_div(y)
                }
                _ => unreachable!(),
            };
            result
                .map(Value::Decimal)
                .ok_or_else(|| format!("decimal overflow in `{symbol}`"))
        }
    }
}

/// Equality never errors: unrelated types are simply not equal.
fn equal(a: &Value, b: &Value) -> bool {
    if let Some(pair) = numeric_pair(a, b) {
        return match pair {
            NumericPair::Ints(x, y) => x == y,
            NumericPair::Floats(x, y) => x == y,
            NumericPair::Decimals(x, y) => x == y,
        };
    }
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::DateTime(x), Value::DateTime(y)) => x == y,
        (Value::Guid(x), Value::Guid(y)) => x == y,
        _ => false,
    }
}

fn order(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, String> {
    use std::cmp::Ordering;
    let ordering = if let Some(pair) = numeric_pair(a, b) {
        match pair {
            NumericPair::Ints(x, y) => x.cmp(&y),
            NumericPair::Floats(x, y) => x
                .partial_cmp(&y)
                .ok_or_else(|| "cannot order NaN".to_string())?,
            NumericPair::Decimals(x, y) => x.cmp(&y),
        }
    } else {
        match (a, b) {
            (Value::Str(x), Value::Str(y)) => x.cmp(y),
            (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
            _ => {
                return Err(format!(
                    "cannot order {} against {}",
                    a.kind(),
                    b.kind()
                ))
            }
        }
    };
    Ok(Value::Bool(match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Ge => ordering != Ordering::Less,
        _ => unreachable!(),
    }))
}

fn member(v: &Value, name: &str) -> Result<Value, String> {
    match (v, name) {
        (Value::Str(s), "Length") => Ok(Value::Int(s.chars().count() as i64)),
        (Value::DateTime(ticks), "Year" | "Month" | "Day") => {
            let dt = ticks_to_datetime(*ticks)
                .ok_or_else(|| "datetime out of calendar range".to_string())?;
            Ok(Value::Int(match name {
                "Year" => dt.year() as i64,
                "Month" => dt.month() as i64,
                _ => dt.day() as i64,
            }))
        }
        _ => Err(format!("unknown property `{name}` on {}", v.kind())),
    }
}

fn call(v: &Value, name: &str, args: &[Value]) -> Result<Value, String> {
    match name {
        "ToString" => {
            expect_no_args(name, args)?;
            Ok(Value::Str(v.to_string()))
        }
        "ToUpper" => Ok(Value::Str(as_str(v, name)?.to_uppercase())),
        "ToLower" => Ok(Value::Str(as_str(v, name)?.to_lowercase())),
        "StartsWith" => {
            let needle = one_str_arg(name, args)?;
            Ok(Value::Bool(as_str(v, name)?.starts_with(needle)))
        }
        "EndsWith" => {
            let needle = one_str_arg(name, args)?;
            Ok(Value::Bool(as_str(v, name)?.ends_with(needle)))
        }
        "Contains" => {
            let needle = one_str_arg(name, args)?;
            Ok(Value::Bool(as_str(v, name)?.contains(needle)))
        }
        "AddYears" | "AddDays" => {
            let Value::DateTime(ticks) = v else {
                return Err(format!("{name} needs a datetime, got {}", v.kind()));
            };
            let [Value::Int(n)] = args else {
                return Err(format!("{name} takes one integer argument"));
            };
            let dt = ticks_to_datetime(*ticks)
                .ok_or_else(|| "datetime out of calendar range".to_string())?;
            let shifted = if name == "AddYears" {
                // Clamp past chrono's representable range; the shift below
                // reports those as out of range anyway.
                let years = n.unsigned_abs().min(300_000) as u32;
                let months = Months::new(years * 12);
                if *n >= 0 {
                    dt.checked_add_months(months)
                } else {
                    dt.checked_sub_months(months)
                }
            } else {
                dt.checked_add_signed(Duration::days(*n))
            };
            let shifted =
                shifted.ok_or_else(|| format!("{name}({n}) leaves the calendar range"))?;
            Ok(Value::DateTime(datetime_to_ticks(&shifted)))
        }
        _ => Err(format!("unknown method `{name}` on {}", v.kind())),
    }
}

fn expect_no_args(name: &str, args: &[Value]) -> Result<(), String> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(format!("{name} takes no arguments"))
    }
}

fn as_str<'v>(v: &'v Value, method: &str) -> Result<&'v str, String> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(format!("{method} needs a string, got {}", other.kind())),
    }
}

fn one_str_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a str, String> {
    match args {
        [Value::Str(s)] => Ok(s),
        _ => Err(format!("{name} takes one string argument")),
    }
}
