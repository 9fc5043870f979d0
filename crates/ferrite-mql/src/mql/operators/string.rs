//! String expression operators
//!
//! Indices and lengths count Unicode code points.

use serde_json::Value;

use crate::mql::context::Context;
use crate::mql::error::{MqlError, Result};
use crate::mql::expression::Expr;
use crate::mql::registry::Operator;
use crate::mql::value;

use super::{evaluate_args, evaluate_exact};

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    vec![
        ("$concat", Operator::expression(concat)),
        ("$toUpper", Operator::expression(|d, a, c| case("$toUpper", d, a, c, str::to_uppercase))),
        ("$toLower", Operator::expression(|d, a, c| case("$toLower", d, a, c, str::to_lowercase))),
        ("$substrCP", Operator::expression(substr_cp)),
        ("$strLenCP", Operator::expression(str_len_cp)),
        ("$split", Operator::expression(split)),
    ]
}

fn type_error(name: &str, expected: &str, found: &Value) -> MqlError {
    MqlError::Type(format!(
        "{} requires {}, found {}",
        name,
        expected,
        value::type_of(found).name()
    ))
}

/// String form used by the case operators: null is empty, numbers print
fn coerce(name: &str, v: &Value) -> Result<String> {
    match v {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(type_error(name, "a string", other)),
    }
}

fn concat(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let mut out = String::new();
    for v in evaluate_args(doc, args, ctx)? {
        match v {
            Value::Null => return Ok(Value::Null),
            Value::String(s) => out.push_str(&s),
            other => return Err(type_error("$concat", "string arguments", &other)),
        }
    }
    Ok(Value::String(out))
}

fn case(
    name: &str,
    doc: &Value,
    args: &Expr,
    ctx: &Context<'_>,
    convert: fn(&str) -> String,
) -> Result<Value> {
    let values = evaluate_exact(name, doc, args, ctx, 1)?;
    let s = match values.first() {
        Some(v) => coerce(name, v)?,
        None => String::new(),
    };
    Ok(Value::String(convert(&s)))
}

fn non_negative(name: &str, what: &str, v: &Value) -> Result<usize> {
    match value::as_f64(v) {
        Some(f) if f >= 0.0 && f.fract() == 0.0 => Ok(f as usize),
        _ => Err(MqlError::Type(format!(
            "{} {} must be a non-negative integer, found {}",
            name, what, v
        ))),
    }
}

/// `$substrCP: [string, start, count]`
fn substr_cp(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let values = evaluate_exact("$substrCP", doc, args, ctx, 3)?;
    let s = coerce("$substrCP", &values[0])?;
    let start = non_negative("$substrCP", "start index", &values[1])?;
    let count = non_negative("$substrCP", "length", &values[2])?;
    Ok(Value::String(s.chars().skip(start).take(count).collect()))
}

fn str_len_cp(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let values = evaluate_exact("$strLenCP", doc, args, ctx, 1)?;
    match values.first() {
        Some(Value::String(s)) => Ok(Value::from(s.chars().count())),
        Some(other) => Err(type_error("$strLenCP", "a string", other)),
        None => Ok(Value::from(0)),
    }
}

/// `$split: [string, delimiter]`
fn split(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let values = evaluate_exact("$split", doc, args, ctx, 2)?;
    match (&values[0], &values[1]) {
        (Value::Null, _) => Ok(Value::Null),
        (Value::String(_), Value::String(d)) if d.is_empty() => Err(MqlError::Type(
            "$split requires a non-empty separator".into(),
        )),
        (Value::String(s), Value::String(d)) => Ok(Value::Array(
            s.split(d.as_str()).map(|part| Value::String(part.to_string())).collect(),
        )),
        (Value::String(_), other) => Err(type_error("$split", "a string separator", other)),
        (other, _) => Err(type_error("$split", "a string input", other)),
    }
}
