//! Built-in pipeline stages

pub mod basic;
pub mod bucket;
pub mod collections;
pub mod facet;
pub mod group;
pub mod sort;

use std::sync::Arc;

use serde_json::{Map, Value};

use super::accumulator::accumulate;
use super::context::{Context, Scope};
use super::error::{MqlError, Result};
use super::expression::{Expr, OperatorKind};
use super::options::Options;
use super::registry::Registry;
use super::Engine;

/// What a stage function sees besides its input and argument
#[derive(Clone)]
pub struct StageEnv {
    engine: Engine,
    variables: Arc<Scope<'static>>,
}

impl StageEnv {
    /// Environment with no variables
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            variables: Arc::new(Scope::default()),
        }
    }

    /// Same engine, different variables
    pub fn with_variables(&self, variables: Arc<Scope<'static>>) -> Self {
        Self {
            engine: self.engine.clone(),
            variables,
        }
    }

    /// Engine handle
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Engine options
    pub fn options(&self) -> &Options {
        self.engine.options()
    }

    /// Variables bound for this pipeline
    pub fn variables(&self) -> &Scope<'static> {
        &self.variables
    }

    /// Evaluation context rooted at `root` carrying the pipeline variables
    pub fn context<'a>(&'a self, root: &'a Value) -> Context<'a> {
        Context::new(&self.engine, root).with_scope(&self.variables)
    }
}

/// Register every built-in stage
pub fn register(registry: &mut Registry) {
    registry.register_all(basic::operators());
    registry.register_all(bucket::operators());
    registry.register_all(collections::operators());
    registry.register_all(facet::operators());
    registry.register_all(group::operators());
    registry.register_all(sort::operators());
}

/// Argument of `stage` as an object
pub(crate) fn stage_object<'a>(stage: &str, arg: &'a Value) -> Result<&'a Map<String, Value>> {
    arg.as_object()
        .ok_or_else(|| MqlError::InvalidStage(format!("{} must be an object", stage)))
}

/// Non-negative integer argument
pub(crate) fn stage_count(stage: &str, arg: &Value) -> Result<usize> {
    match arg {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .map(|n| n as usize)
            .ok_or_else(|| {
                MqlError::InvalidStage(format!("{} must be a non-negative integer", stage))
            }),
        _ => Err(MqlError::InvalidStage(format!(
            "{} must be a non-negative integer",
            stage
        ))),
    }
}

/// Compile `{field: {<accumulator>: args}}` output specifications, skipping
/// `reserved` keys
pub(crate) fn compile_accumulators(
    stage: &str,
    fields: &Map<String, Value>,
    reserved: &[&str],
    engine: &Engine,
) -> Result<Vec<(String, Expr)>> {
    let mut out = Vec::with_capacity(fields.len());
    for (field, spec) in fields {
        if reserved.contains(&field.as_str()) {
            continue;
        }
        if field.contains('.') {
            return Err(MqlError::InvalidStage(format!(
                "{}: the field name '{}' cannot contain '.'",
                stage, field
            )));
        }
        match spec {
            Value::Object(map) if map.len() == 1 => match Expr::compile_accumulator(spec, engine)? {
                expr @ Expr::Operator {
                    kind: OperatorKind::Accumulator(_),
                    ..
                } => out.push((field.clone(), expr)),
                _ => {
                    return Err(MqlError::InvalidStage(format!(
                        "{}: the field '{}' must specify one accumulator",
                        stage, field
                    )))
                }
            },
            Value::Object(_) => {
                return Err(MqlError::InvalidStage(format!(
                    "{}: the field '{}' must specify one accumulator",
                    stage, field
                )))
            }
            _ => {
                return Err(MqlError::InvalidStage(format!(
                    "{}: the field '{}' must be an accumulator object",
                    stage, field
                )))
            }
        }
    }
    Ok(out)
}

/// Build `{_id: id, <field>: <accumulated>...}` for one group. Accumulator
/// arguments evaluated once per group (such as `n`) see the group document
/// as `$$ROOT`.
pub(crate) fn group_output(
    id: Value,
    members: &[Value],
    accumulators: &[(String, Expr)],
    env: &StageEnv,
) -> Result<Value> {
    let mut out = Map::new();
    out.insert("_id".to_string(), id);
    let root = Value::Object(out.clone());
    let ctx = env.context(&root);
    for (field, expr) in accumulators {
        out.insert(field.clone(), accumulate(members, expr, &ctx)?);
    }
    Ok(Value::Object(out))
}
