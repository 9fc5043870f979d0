//! Comparison, boolean and conditional expression operators
//!
//! Comparisons use the cross-type BSON order and the engine collation.
//! `$and`, `$or`, `$cond`, `$ifNull` and `$switch` evaluate their arguments
//! lazily.

use std::cmp::Ordering;

use serde_json::Value;

use crate::mql::context::Context;
use crate::mql::error::{MqlError, Result};
use crate::mql::expression::{evaluate, evaluate_partial, Expr};
use crate::mql::registry::Operator;
use crate::mql::value;

use super::{evaluate_exact, object_args};

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    vec![
        ("$eq", Operator::expression(|d, a, c| compare("$eq", d, a, c, Ordering::is_eq))),
        ("$ne", Operator::expression(|d, a, c| compare("$ne", d, a, c, Ordering::is_ne))),
        ("$gt", Operator::expression(|d, a, c| compare("$gt", d, a, c, Ordering::is_gt))),
        ("$gte", Operator::expression(|d, a, c| compare("$gte", d, a, c, Ordering::is_ge))),
        ("$lt", Operator::expression(|d, a, c| compare("$lt", d, a, c, Ordering::is_lt))),
        ("$lte", Operator::expression(|d, a, c| compare("$lte", d, a, c, Ordering::is_le))),
        ("$cmp", Operator::expression(cmp)),
        ("$and", Operator::expression(|d, a, c| junction(d, a, c, true))),
        ("$or", Operator::expression(|d, a, c| junction(d, a, c, false))),
        ("$not", Operator::expression(not)),
        ("$cond", Operator::expression_partial(cond)),
        ("$ifNull", Operator::expression_partial(if_null)),
        ("$switch", Operator::expression_partial(switch)),
    ]
}

fn ordering(name: &str, doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Ordering> {
    let values = evaluate_exact(name, doc, args, ctx, 2)?;
    Ok(ctx.options().compare(&values[0], &values[1]))
}

fn compare(
    name: &str,
    doc: &Value,
    args: &Expr,
    ctx: &Context<'_>,
    test: fn(Ordering) -> bool,
) -> Result<Value> {
    Ok(Value::Bool(test(ordering(name, doc, args, ctx)?)))
}

fn cmp(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    Ok(Value::from(match ordering("$cmp", doc, args, ctx)? {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }))
}

/// `$and` stops at the first falsy argument, `$or` at the first truthy one
fn junction(doc: &Value, args: &Expr, ctx: &Context<'_>, all: bool) -> Result<Value> {
    let items = match args {
        Expr::Array(items) => items.as_slice(),
        single => std::slice::from_ref(single),
    };
    for item in items {
        if value::truthy(&evaluate(doc, item, ctx)?) != all {
            return Ok(Value::Bool(!all));
        }
    }
    Ok(Value::Bool(all))
}

fn not(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let values = evaluate_exact("$not", doc, args, ctx, 1)?;
    Ok(Value::Bool(!values.first().is_some_and(value::truthy)))
}

/// `$cond: [if, then, else]` or `$cond: {if, then, else}`
fn cond(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Option<Value>> {
    let (test, then, otherwise) = match args {
        Expr::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
        Expr::Object(_) => {
            let field = |key: &str| {
                args.get(key).ok_or_else(|| {
                    MqlError::InvalidExpression(format!("$cond requires '{}'", key))
                })
            };
            (field("if")?, field("then")?, field("else")?)
        }
        _ => {
            return Err(MqlError::InvalidExpression(
                "$cond takes [if, then, else] or {if, then, else}".into(),
            ))
        }
    };
    if value::truthy(&evaluate(doc, test, ctx)?) {
        evaluate_partial(doc, then, ctx)
    } else {
        evaluate_partial(doc, otherwise, ctx)
    }
}

/// First argument that is neither null nor absent; the last one is the
/// replacement
fn if_null(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Option<Value>> {
    let items = match args {
        Expr::Array(items) if items.len() >= 2 => items,
        _ => {
            return Err(MqlError::InvalidExpression(
                "$ifNull needs at least two arguments".into(),
            ))
        }
    };
    let (replacement, inputs) = match items.split_last() {
        Some(split) => split,
        None => return Ok(None),
    };
    for input in inputs {
        match evaluate_partial(doc, input, ctx)? {
            None | Some(Value::Null) => continue,
            Some(v) => return Ok(Some(v)),
        }
    }
    evaluate_partial(doc, replacement, ctx)
}

fn switch(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Option<Value>> {
    object_args("$switch", args)?;
    let branches = match args.get("branches") {
        Some(Expr::Array(branches)) => branches,
        _ => {
            return Err(MqlError::InvalidExpression(
                "$switch requires an array of branches".into(),
            ))
        }
    };
    for branch in branches {
        let (Some(case), Some(then)) = (branch.get("case"), branch.get("then")) else {
            return Err(MqlError::InvalidExpression(
                "$switch branches need 'case' and 'then'".into(),
            ));
        };
        if value::truthy(&evaluate(doc, case, ctx)?) {
            return evaluate_partial(doc, then, ctx);
        }
    }
    match args.get("default") {
        Some(default) => evaluate_partial(doc, default, ctx),
        None => Err(MqlError::InvalidExpression(
            "$switch could not find a matching branch for an input, and no default was specified"
                .into(),
        )),
    }
}
