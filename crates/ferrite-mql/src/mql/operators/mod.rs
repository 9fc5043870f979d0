//! Built-in query and expression operators
//!
//! Every operator here is registered through the same [`Registry`] API a
//! caller uses for extensions.

pub mod arithmetic;
pub mod array;
pub mod logic;
pub mod misc;
pub mod query;
pub mod string;

use serde_json::Value;

use super::context::{Context, Scope};
use super::error::{MqlError, Result};
use super::expression::{evaluate, Expr};
use super::registry::Registry;

/// Register every built-in query and expression operator
pub fn register(registry: &mut Registry) {
    registry.register_all(query::operators());
    registry.register_all(arithmetic::operators());
    registry.register_all(logic::operators());
    registry.register_all(string::operators());
    registry.register_all(array::operators());
    registry.register_all(misc::operators());
}

/// Evaluate an operator argument list. An array expression yields one value
/// per element; anything else is a single argument.
pub fn evaluate_args(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Vec<Value>> {
    match args {
        Expr::Array(items) => items.iter().map(|item| evaluate(doc, item, ctx)).collect(),
        other => Ok(vec![evaluate(doc, other, ctx)?]),
    }
}

/// Evaluate an argument list of exactly `n` values
pub fn evaluate_exact(
    name: &str,
    doc: &Value,
    args: &Expr,
    ctx: &Context<'_>,
    n: usize,
) -> Result<Vec<Value>> {
    let values = evaluate_args(doc, args, ctx)?;
    if values.len() != n {
        return Err(MqlError::InvalidExpression(format!(
            "{} requires exactly {} argument(s), got {}",
            name,
            n,
            values.len()
        )));
    }
    Ok(values)
}

/// Borrow the argument as an object expression
pub fn object_args<'e>(name: &str, args: &'e Expr) -> Result<&'e [(String, Expr)]> {
    match args {
        Expr::Object(fields) => Ok(fields),
        _ => Err(MqlError::InvalidExpression(format!(
            "{} requires an object argument",
            name
        ))),
    }
}

/// Required field of an object argument
pub fn required<'e>(name: &str, args: &'e Expr, field: &str) -> Result<&'e Expr> {
    object_args(name, args)?;
    args.get(field).ok_or_else(|| {
        MqlError::InvalidExpression(format!("{} requires '{}'", name, field))
    })
}

/// Evaluate the array argument of `$filter`, `$map`, `$reduce`; `None` for null
pub fn evaluate_array(
    name: &str,
    doc: &Value,
    expr: &Expr,
    ctx: &Context<'_>,
) -> Result<Option<Vec<Value>>> {
    match evaluate(doc, expr, ctx)? {
        Value::Array(items) => Ok(Some(items)),
        Value::Null => Ok(None),
        other => Err(MqlError::Type(format!(
            "{} requires an array input, found {}",
            name,
            super::value::type_of(&other).name()
        ))),
    }
}

/// Variable name given as `as`, defaulting to `this`
pub fn variable_name(name: &str, args: &Expr) -> Result<String> {
    match args.get("as") {
        None => Ok("this".to_string()),
        Some(Expr::Literal(Value::String(s))) => Ok(s.clone()),
        Some(_) => Err(MqlError::InvalidExpression(format!(
            "{} 'as' must be a string",
            name
        ))),
    }
}

/// Run `f` with `bindings` pushed as the innermost variable frame
pub(crate) fn with_bindings<T>(
    ctx: &Context<'_>,
    bindings: Vec<(String, Value)>,
    f: impl FnOnce(&Context<'_>) -> Result<T>,
) -> Result<T> {
    let scope = Scope::with_parent(ctx.scope(), bindings);
    f(&ctx.with_scope(&scope))
}
