//! Arithmetic expression operators
//!
//! A null or absent argument makes the result null. Dates take part in
//! `$add` and `$subtract` as epoch milliseconds.

use chrono::DateTime;
use serde_json::Value;

use crate::mql::context::Context;
use crate::mql::error::{MqlError, Result};
use crate::mql::expression::Expr;
use crate::mql::registry::Operator;
use crate::mql::value;

use super::{evaluate_args, evaluate_exact};

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    vec![
        ("$add", Operator::expression(add)),
        ("$subtract", Operator::expression(subtract)),
        ("$multiply", Operator::expression(multiply)),
        ("$divide", Operator::expression(|d, a, c| binary("$divide", d, a, c, divide))),
        ("$mod", Operator::expression(|d, a, c| binary("$mod", d, a, c, modulo))),
        ("$pow", Operator::expression(|d, a, c| binary("$pow", d, a, c, pow))),
        ("$abs", Operator::expression(|d, a, c| unary("$abs", d, a, c, |x| Ok(x.abs())))),
        ("$ceil", Operator::expression(|d, a, c| unary("$ceil", d, a, c, |x| Ok(x.ceil())))),
        ("$floor", Operator::expression(|d, a, c| unary("$floor", d, a, c, |x| Ok(x.floor())))),
        ("$sqrt", Operator::expression(|d, a, c| unary("$sqrt", d, a, c, sqrt))),
        ("$round", Operator::expression(round)),
    ]
}

fn numeric(name: &str, v: &Value) -> Result<f64> {
    value::as_f64(v).ok_or_else(|| {
        MqlError::Type(format!(
            "{} only supports numeric types, not {}",
            name,
            value::type_of(v).name()
        ))
    })
}

fn date_from_millis(ms: f64) -> Result<Value> {
    DateTime::from_timestamp_millis(ms as i64)
        .map(value::date_value)
        .ok_or_else(|| MqlError::Type(format!("{} is outside the supported date range", ms)))
}

fn add(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let values = evaluate_args(doc, args, ctx)?;
    if values.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }

    let mut total = 0.0;
    let mut has_date = false;
    for v in &values {
        if let Some(dt) = value::as_date(v) {
            if has_date {
                return Err(MqlError::Type("only one date allowed in an $add expression".into()));
            }
            has_date = true;
            total += dt.timestamp_millis() as f64;
        } else {
            total += numeric("$add", v)?;
        }
    }
    if has_date {
        date_from_millis(total)
    } else {
        Ok(value::number(total))
    }
}

fn subtract(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let values = evaluate_exact("$subtract", doc, args, ctx, 2)?;
    let (a, b) = (&values[0], &values[1]);
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    match (value::as_date(a), value::as_date(b)) {
        (Some(x), Some(y)) => Ok(Value::from(x.timestamp_millis() - y.timestamp_millis())),
        (Some(x), None) => date_from_millis(x.timestamp_millis() as f64 - numeric("$subtract", b)?),
        (None, Some(_)) => Err(MqlError::Type("cannot subtract a date from a number".into())),
        (None, None) => Ok(value::number(numeric("$subtract", a)? - numeric("$subtract", b)?)),
    }
}

fn multiply(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let values = evaluate_args(doc, args, ctx)?;
    if values.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }
    let mut product = 1.0;
    for v in &values {
        product *= numeric("$multiply", v)?;
    }
    Ok(value::number(product))
}

fn binary(
    name: &str,
    doc: &Value,
    args: &Expr,
    ctx: &Context<'_>,
    f: fn(f64, f64) -> Result<f64>,
) -> Result<Value> {
    let values = evaluate_exact(name, doc, args, ctx, 2)?;
    if values.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }
    let (a, b) = (numeric(name, &values[0])?, numeric(name, &values[1])?);
    Ok(value::number(f(a, b)?))
}

fn unary(
    name: &str,
    doc: &Value,
    args: &Expr,
    ctx: &Context<'_>,
    f: impl Fn(f64) -> Result<f64>,
) -> Result<Value> {
    let values = evaluate_exact(name, doc, args, ctx, 1)?;
    match values.first() {
        None | Some(Value::Null) => Ok(Value::Null),
        Some(v) => Ok(value::number(f(numeric(name, v)?)?)),
    }
}

fn divide(a: f64, b: f64) -> Result<f64> {
    if b == 0.0 {
        return Err(MqlError::Type("can't $divide by zero".into()));
    }
    Ok(a / b)
}

fn modulo(a: f64, b: f64) -> Result<f64> {
    if b == 0.0 {
        return Err(MqlError::Type("can't $mod by zero".into()));
    }
    Ok(a % b)
}

fn pow(base: f64, exponent: f64) -> Result<f64> {
    if base == 0.0 && exponent < 0.0 {
        return Err(MqlError::Type("$pow cannot take a base of 0 and a negative exponent".into()));
    }
    Ok(base.powf(exponent))
}

fn sqrt(x: f64) -> Result<f64> {
    if x < 0.0 {
        return Err(MqlError::Type("$sqrt's argument must be greater than or equal to 0".into()));
    }
    Ok(x.sqrt())
}

/// `$round: [number, place]`, rounding half to even
fn round(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let values = evaluate_args(doc, args, ctx)?;
    let (number, place) = match values.as_slice() {
        [n] => (n, 0),
        [n, place] => {
            let place = place
                .as_i64()
                .filter(|p| (-20..100).contains(p))
                .ok_or_else(|| MqlError::Type("$round place must be an integer in [-20, 100)".into()))?;
            (n, place)
        }
        _ => {
            return Err(MqlError::InvalidExpression(
                "$round takes a number and an optional place".into(),
            ))
        }
    };
    if number.is_null() {
        return Ok(Value::Null);
    }
    let x = numeric("$round", number)?;
    let scale = 10f64.powi(place.unsigned_abs() as i32);
    let rounded = if place >= 0 {
        (x * scale).round_ties_even() / scale
    } else {
        (x / scale).round_ties_even() * scale
    };
    Ok(value::number(rounded))
}

#[cfg(test)]
mod tests {
    use crate::mql::error::MqlError;
    use crate::mql::Engine;
    use serde_json::{json, Value};

    fn eval(expr: Value) -> crate::mql::Result<Value> {
        let doc = json!({ "a": 7, "b": 2, "f": 2.5, "d": { "$date": "2024-01-01T00:00:00.000Z" } });
        Engine::default().evaluate(&doc, &expr)
    }

    #[test]
    fn test_basic_arithmetic() {
        assert_eq!(eval(json!({ "$add": ["$a", "$b", 1] })).unwrap(), json!(10));
        assert_eq!(eval(json!({ "$subtract": ["$a", "$b"] })).unwrap(), json!(5));
        assert_eq!(eval(json!({ "$multiply": ["$f", "$b"] })).unwrap(), json!(5));
        assert_eq!(eval(json!({ "$divide": ["$a", "$b"] })).unwrap(), json!(3.5));
        assert_eq!(eval(json!({ "$mod": ["$a", "$b"] })).unwrap(), json!(1));
        assert_eq!(eval(json!({ "$mod": [-7, 2] })).unwrap(), json!(-1));
        assert_eq!(eval(json!({ "$pow": ["$b", 10] })).unwrap(), json!(1024));
        assert_eq!(eval(json!({ "$sqrt": 16 })).unwrap(), json!(4));
        assert_eq!(eval(json!({ "$abs": -3 })).unwrap(), json!(3));
        assert_eq!(eval(json!({ "$ceil": "$f" })).unwrap(), json!(3));
        assert_eq!(eval(json!({ "$floor": ["$f"] })).unwrap(), json!(2));
    }

    #[test]
    fn test_null_propagates() {
        assert_eq!(eval(json!({ "$add": ["$a", "$missing"] })).unwrap(), Value::Null);
        assert_eq!(eval(json!({ "$divide": [null, 2] })).unwrap(), Value::Null);
        assert_eq!(eval(json!({ "$abs": "$missing" })).unwrap(), Value::Null);
        assert_eq!(eval(json!({ "$round": [null, 1] })).unwrap(), Value::Null);
    }

    #[test]
    fn test_round_half_to_even() {
        assert_eq!(eval(json!({ "$round": 2.5 })).unwrap(), json!(2));
        assert_eq!(eval(json!({ "$round": 3.5 })).unwrap(), json!(4));
        assert_eq!(eval(json!({ "$round": [1.2345, 2] })).unwrap(), json!(1.23));
        assert_eq!(eval(json!({ "$round": [1250, -2] })).unwrap(), json!(1200));
    }

    #[test]
    fn test_dates() {
        assert_eq!(
            eval(json!({ "$add": ["$d", 86_400_000] })).unwrap(),
            json!({ "$date": "2024-01-02T00:00:00.000Z" })
        );
        assert_eq!(
            eval(json!({ "$subtract": [{ "$add": ["$d", 1000] }, "$d"] })).unwrap(),
            json!(1000)
        );
        assert!(eval(json!({ "$add": ["$d", "$d"] })).is_err());
    }

    #[test]
    fn test_type_errors() {
        assert!(matches!(eval(json!({ "$divide": [1, 0] })), Err(MqlError::Type(_))));
        assert!(matches!(eval(json!({ "$mod": [1, 0] })), Err(MqlError::Type(_))));
        assert!(matches!(eval(json!({ "$add": [1, "x"] })), Err(MqlError::Type(_))));
        assert!(matches!(eval(json!({ "$sqrt": -1 })), Err(MqlError::Type(_))));
        assert!(matches!(
            eval(json!({ "$subtract": [1] })),
            Err(MqlError::InvalidExpression(_))
        ));
    }
}
