//! Aggregation expressions
//!
//! An expression document is decoded once into an [`Expr`] tree, with every
//! operator resolved against the registry at compile time. Evaluation then
//! walks the tree per document and never re-inspects object shapes.

use std::fmt;

use chrono::Utc;
use serde_json::{Map, Value};

use super::context::Context;
use super::error::{MqlError, OperatorCategory, Result};
use super::registry::{AccumulatorOperator, ExpressionOperator, Registry};
use super::value;
use super::Engine;

/// Operator function bound into an [`Expr::Operator`] node
#[derive(Clone)]
pub enum OperatorKind {
    /// Expression operator
    Expression(ExpressionOperator),
    /// Accumulator; in expression context it reduces its evaluated arguments
    Accumulator(AccumulatorOperator),
}

/// Compiled expression
#[derive(Clone)]
pub enum Expr {
    /// Constant value
    Literal(Value),
    /// `"$a.b"` field path
    Field(String),
    /// `"$$name.path"` variable reference
    Variable {
        /// Variable name without `$$`
        name: String,
        /// Dotted continuation path
        path: Option<String>,
    },
    /// Element-wise array expression
    Array(Vec<Expr>),
    /// Field-wise object expression
    Object(Vec<(String, Expr)>),
    /// Operator call
    Operator {
        /// Operator name, e.g. `$add`
        name: String,
        /// Resolved operator function
        kind: OperatorKind,
        /// Compiled argument
        args: Box<Expr>,
    },
}

impl Expr {
    /// Compile an expression document
    pub fn compile(value: &Value, engine: &Engine) -> Result<Self> {
        Self::compile_with_hint(value, engine.registry(), None)
    }

    /// Compile a `{<accumulator>: <args>}` document, resolving the operator in
    /// the accumulator table
    pub fn compile_accumulator(value: &Value, engine: &Engine) -> Result<Self> {
        Self::compile_with_hint(value, engine.registry(), Some(OperatorCategory::Accumulator))
    }

    /// Compile with an optional category for the top-level operator key
    pub fn compile_with_hint(
        value: &Value,
        registry: &Registry,
        hint: Option<OperatorCategory>,
    ) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Self::compile_string(s, value)),
            Value::Array(items) => {
                let exprs: Result<Vec<_>> = items
                    .iter()
                    .map(|item| Self::compile_with_hint(item, registry, None))
                    .collect();
                Ok(Self::Array(exprs?))
            }
            Value::Object(map) if value::is_date(value) || value::is_regex(value) => {
                Ok(Self::Literal(Value::Object(map.clone())))
            }
            Value::Object(map) => {
                let Some(op_key) = map.keys().find(|k| k.starts_with('$')) else {
                    let mut fields = Vec::with_capacity(map.len());
                    for (key, val) in map {
                        fields.push((key.clone(), Self::compile_with_hint(val, registry, None)?));
                    }
                    return Ok(Self::Object(fields));
                };

                if map.len() != 1 {
                    return Err(MqlError::InvalidExpression(format!(
                        "an expression specification must contain exactly one field, \
                         the name of the expression; found {} alongside other fields",
                        op_key
                    )));
                }
                let (name, arg) = match map.iter().next() {
                    Some(entry) => entry,
                    None => return Err(MqlError::InvalidExpression("empty expression".into())),
                };

                if name == "$literal" {
                    return Ok(Self::Literal(arg.clone()));
                }

                let kind = Self::resolve_operator(name, registry, hint)?;
                let args = Self::compile_with_hint(arg, registry, None)?;
                Ok(Self::Operator {
                    name: name.clone(),
                    kind,
                    args: Box::new(args),
                })
            }
            _ => Ok(Self::Literal(value.clone())),
        }
    }

    fn compile_string(s: &str, original: &Value) -> Self {
        if let Some(var) = s.strip_prefix("$$") {
            let (name, path) = match var.split_once('.') {
                Some((name, path)) => (name.to_string(), Some(path.to_string())),
                None => (var.to_string(), None),
            };
            Self::Variable { name, path }
        } else if let Some(path) = s.strip_prefix('$').filter(|p| !p.is_empty()) {
            Self::Field(path.to_string())
        } else {
            Self::Literal(original.clone())
        }
    }

    fn resolve_operator(
        name: &str,
        registry: &Registry,
        hint: Option<OperatorCategory>,
    ) -> Result<OperatorKind> {
        if hint == Some(OperatorCategory::Accumulator) {
            return registry
                .accumulator(name)
                .map(|f| OperatorKind::Accumulator(f.clone()))
                .ok_or_else(|| MqlError::unknown(OperatorCategory::Accumulator, name));
        }
        if let Some(f) = registry.expression(name) {
            return Ok(OperatorKind::Expression(f.clone()));
        }
        registry
            .accumulator(name)
            .map(|f| OperatorKind::Accumulator(f.clone()))
            .ok_or_else(|| MqlError::unknown(OperatorCategory::Expression, name))
    }

    /// `$$CURRENT`
    pub fn current() -> Self {
        Self::Variable {
            name: "CURRENT".to_string(),
            path: None,
        }
    }

    /// Field of an object expression
    pub fn get(&self, key: &str) -> Option<&Expr> {
        match self {
            Self::Object(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, e)| e),
            _ => None,
        }
    }

    /// Constant value, if this is a literal
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Self::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// Operator name, if this is an operator call
    pub fn operator_name(&self) -> Option<&str> {
        match self {
            Self::Operator { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "Literal({})", v),
            Self::Field(p) => write!(f, "Field({})", p),
            Self::Variable { name, path } => match path {
                Some(p) => write!(f, "Variable({}.{})", name, p),
                None => write!(f, "Variable({})", name),
            },
            Self::Array(items) => f.debug_list().entries(items).finish(),
            Self::Object(fields) => f
                .debug_map()
                .entries(fields.iter().map(|(k, v)| (k, v)))
                .finish(),
            Self::Operator { name, args, .. } => write!(f, "{}({:?})", name, args),
        }
    }
}

/// Evaluate an expression; the absent value becomes `null`
pub fn evaluate(doc: &Value, expr: &Expr, ctx: &Context<'_>) -> Result<Value> {
    Ok(evaluate_partial(doc, expr, ctx)?.unwrap_or(Value::Null))
}

/// Evaluate an expression, keeping the absent value as `None`
pub fn evaluate_partial(doc: &Value, expr: &Expr, ctx: &Context<'_>) -> Result<Option<Value>> {
    match expr {
        Expr::Literal(v) => Ok(Some(v.clone())),
        Expr::Field(path) => Ok(value::resolve(doc, path)),
        Expr::Variable { name, path } => resolve_variable(doc, name, path.as_deref(), ctx),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate(doc, item, ctx)?);
            }
            Ok(Some(Value::Array(out)))
        }
        Expr::Object(fields) => {
            let mut map = Map::new();
            for (key, field) in fields {
                if let Some(v) = evaluate_partial(doc, field, ctx)? {
                    map.insert(key.clone(), v);
                }
            }
            Ok(Some(Value::Object(map)))
        }
        Expr::Operator {
            kind: OperatorKind::Expression(f),
            args,
            ..
        } => f(doc, args, ctx),
        Expr::Operator {
            kind: OperatorKind::Accumulator(f),
            args,
            ..
        } => reduce_arguments(doc, f, args, ctx).map(Some),
    }
}

fn resolve_variable(
    doc: &Value,
    name: &str,
    path: Option<&str>,
    ctx: &Context<'_>,
) -> Result<Option<Value>> {
    let base = match name {
        "ROOT" => ctx.root(),
        "CURRENT" => doc,
        "REMOVE" => return Ok(None),
        "NOW" => {
            let now = value::date_value(Utc::now());
            return Ok(match path {
                Some(p) => value::resolve(&now, p),
                None => Some(now),
            });
        }
        other => ctx.variable(other).ok_or_else(|| {
            MqlError::InvalidExpression(format!("Use of undefined variable: {}", other))
        })?,
    };
    Ok(match path {
        Some(p) => value::resolve(base, p),
        None => Some(base.clone()),
    })
}

/// Accumulator used as an expression: `{$sum: ["$a", "$b"]}` reduces the
/// listed values, `{$max: "$scores"}` reduces the array the argument yields,
/// and `{$firstN: {n, input}}` reduces `input`.
fn reduce_arguments(
    doc: &Value,
    f: &AccumulatorOperator,
    args: &Expr,
    ctx: &Context<'_>,
) -> Result<Value> {
    if let (Expr::Object(fields), Some(input)) = (args, args.get("input")) {
        let members = as_members(evaluate(doc, input, ctx)?);
        let rewritten: Vec<(String, Expr)> = fields
            .iter()
            .map(|(k, e)| {
                if k == "input" {
                    (k.clone(), Expr::current())
                } else {
                    (k.clone(), e.clone())
                }
            })
            .collect();
        return f(&members, &Expr::Object(rewritten), ctx);
    }

    let members = match args {
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate(doc, item, ctx)?);
            }
            out
        }
        other => as_members(evaluate(doc, other, ctx)?),
    };
    f(&members, &Expr::current(), ctx)
}

fn as_members(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}
