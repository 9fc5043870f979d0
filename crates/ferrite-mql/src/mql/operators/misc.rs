//! Variable, type and script expression operators

use serde_json::Value;

use crate::mql::context::Context;
use crate::mql::error::{MqlError, Result};
use crate::mql::expression::{evaluate, evaluate_partial, Expr};
use crate::mql::registry::Operator;
use crate::mql::value;

use super::{evaluate_args, object_args, required, with_bindings};

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    vec![
        ("$let", Operator::expression_partial(let_in)),
        ("$type", Operator::expression(type_name)),
        ("$function", Operator::expression(function)),
    ]
}

/// `$let: {vars: {...}, in}`; every variable is evaluated in the outer scope
fn let_in(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Option<Value>> {
    let vars = match required("$let", args, "vars")? {
        Expr::Object(vars) => vars,
        _ => {
            return Err(MqlError::InvalidExpression(
                "$let 'vars' must be an object".into(),
            ))
        }
    };
    let body = required("$let", args, "in")?;

    let mut bindings = Vec::with_capacity(vars.len());
    for (name, expr) in vars {
        if name.starts_with(|c: char| c.is_ascii() && !c.is_ascii_lowercase()) {
            return Err(MqlError::InvalidExpression(format!(
                "'{}' starts with an invalid character for a user variable name",
                name
            )));
        }
        bindings.push((name.clone(), evaluate(doc, expr, ctx)?));
    }
    with_bindings(ctx, bindings, |scoped| evaluate_partial(doc, body, scoped))
}

/// `$type` reports `"missing"` for the absent value
fn type_name(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let target = match args {
        Expr::Array(items) if items.len() == 1 => &items[0],
        Expr::Array(items) => {
            return Err(MqlError::InvalidExpression(format!(
                "$type takes exactly 1 argument, got {}",
                items.len()
            )))
        }
        other => other,
    };
    Ok(Value::String(match evaluate_partial(doc, target, ctx)? {
        Some(v) => value::type_of(&v).name().to_string(),
        None => "missing".to_string(),
    }))
}

/// `$function: {body, args, lang}`; `body` names a registered script, called
/// with the document as `this`
fn function(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    object_args("$function", args)?;
    let name = match required("$function", args, "body")?.as_literal() {
        Some(Value::String(name)) => name,
        _ => {
            return Err(MqlError::InvalidExpression(
                "$function 'body' must name a registered script".into(),
            ))
        }
    };
    let script = ctx.options().script(name)?;
    let arguments = match args.get("args") {
        Some(list @ Expr::Array(_)) => evaluate_args(doc, list, ctx)?,
        Some(_) => {
            return Err(MqlError::InvalidExpression(
                "$function 'args' must be an array".into(),
            ))
        }
        None => Vec::new(),
    };
    script(doc, &arguments)
}
