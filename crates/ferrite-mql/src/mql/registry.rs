//! Operator registry
//!
//! Six independent name tables, one per [`OperatorCategory`]. A registry is
//! owned by one [`Engine`](super::Engine) and frozen when the engine is
//! built, so independent engines never share mutable state.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;

use super::context::Context;
use super::error::{MqlError, OperatorCategory, Result};
use super::expression::Expr;
use super::lazy::Lazy;
use super::stages::StageEnv;
use super::window::WindowInput;
use super::Engine;

static OPERATOR_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\w+$").expect("valid operator name regex"));

/// Compiled query predicate
pub type Predicate = Box<dyn Fn(&Value, &Context<'_>) -> Result<bool> + Send + Sync>;

/// Compiled projection of one output field; `None` omits the field
pub type Projector = Box<dyn Fn(&Value, &Context<'_>) -> Result<Option<Value>> + Send + Sync>;

/// Query operator: `(field, operand, engine) -> predicate`
pub type QueryOperator = Arc<dyn Fn(&str, &Value, &Engine) -> Result<Predicate> + Send + Sync>;

/// Expression operator: `(document, arguments, context) -> value`; `None` is
/// the absent value
pub type ExpressionOperator =
    Arc<dyn Fn(&Value, &Expr, &Context<'_>) -> Result<Option<Value>> + Send + Sync>;

/// Accumulator: `(members, arguments, context) -> value`
pub type AccumulatorOperator =
    Arc<dyn Fn(&[Value], &Expr, &Context<'_>) -> Result<Value> + Send + Sync>;

/// Pipeline stage: `(input, argument, environment) -> output`
pub type PipelineOperator = Arc<dyn Fn(Lazy, &Value, &StageEnv) -> Result<Lazy> + Send + Sync>;

/// Projection operator: `(field, operand, engine) -> projector`
pub type ProjectionOperator =
    Arc<dyn Fn(&str, &Value, &Engine) -> Result<Projector> + Send + Sync>;

/// Window function evaluated once per partition member
pub type WindowOperator = Arc<dyn Fn(&WindowInput<'_>) -> Result<Value> + Send + Sync>;

/// An operator tagged with its category
#[derive(Clone)]
pub enum Operator {
    /// Query predicate
    Query(QueryOperator),
    /// Expression operator
    Expression(ExpressionOperator),
    /// Accumulator
    Accumulator(AccumulatorOperator),
    /// Pipeline stage
    Pipeline(PipelineOperator),
    /// Projection operator
    Projection(ProjectionOperator),
    /// Window function
    Window(WindowOperator),
}

impl Operator {
    /// Category this operator registers into
    pub fn category(&self) -> OperatorCategory {
        match self {
            Self::Query(_) => OperatorCategory::Query,
            Self::Expression(_) => OperatorCategory::Expression,
            Self::Accumulator(_) => OperatorCategory::Accumulator,
            Self::Pipeline(_) => OperatorCategory::Pipeline,
            Self::Projection(_) => OperatorCategory::Projection,
            Self::Window(_) => OperatorCategory::Window,
        }
    }

    /// Wrap a query operator
    pub fn query<F>(f: F) -> Self
    where
        F: Fn(&str, &Value, &Engine) -> Result<Predicate> + Send + Sync + 'static,
    {
        Self::Query(Arc::new(f))
    }

    /// Wrap an expression operator that always produces a value
    pub fn expression<F>(f: F) -> Self
    where
        F: Fn(&Value, &Expr, &Context<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        Self::Expression(Arc::new(move |doc, args, ctx| f(doc, args, ctx).map(Some)))
    }

    /// Wrap an expression operator that may produce the absent value
    pub fn expression_partial<F>(f: F) -> Self
    where
        F: Fn(&Value, &Expr, &Context<'_>) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        Self::Expression(Arc::new(f))
    }

    /// Wrap an accumulator
    pub fn accumulator<F>(f: F) -> Self
    where
        F: Fn(&[Value], &Expr, &Context<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        Self::Accumulator(Arc::new(f))
    }

    /// Wrap a pipeline stage
    pub fn pipeline<F>(f: F) -> Self
    where
        F: Fn(Lazy, &Value, &StageEnv) -> Result<Lazy> + Send + Sync + 'static,
    {
        Self::Pipeline(Arc::new(f))
    }

    /// Wrap a projection operator
    pub fn projection<F>(f: F) -> Self
    where
        F: Fn(&str, &Value, &Engine) -> Result<Projector> + Send + Sync + 'static,
    {
        Self::Projection(Arc::new(f))
    }

    /// Wrap a window function
    pub fn window<F>(f: F) -> Self
    where
        F: Fn(&WindowInput<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        Self::Window(Arc::new(f))
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operator({})", self.category())
    }
}

/// Category-keyed operator tables
#[derive(Clone)]
pub struct Registry {
    query: HashMap<String, QueryOperator>,
    expression: HashMap<String, ExpressionOperator>,
    accumulator: HashMap<String, AccumulatorOperator>,
    pipeline: HashMap<String, PipelineOperator>,
    projection: HashMap<String, ProjectionOperator>,
    window: HashMap<String, WindowOperator>,
}

impl Registry {
    /// Registry with no operators at all
    pub fn empty() -> Self {
        Self {
            query: HashMap::new(),
            expression: HashMap::new(),
            accumulator: HashMap::new(),
            pipeline: HashMap::new(),
            projection: HashMap::new(),
            window: HashMap::new(),
        }
    }

    /// Registry holding every built-in operator
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        super::operators::register(&mut registry);
        super::accumulator::register(&mut registry);
        super::projection::register(&mut registry);
        super::stages::register(&mut registry);
        super::window::register(&mut registry);
        registry
    }

    /// Add an operator under `name` in the operator's category
    pub fn register(&mut self, name: &str, op: Operator) -> Result<()> {
        if !OPERATOR_NAME.is_match(name) {
            return Err(MqlError::InvalidOperatorName(name.to_string()));
        }
        let category = op.category();
        if self.contains(category, name) {
            return Err(MqlError::DuplicateOperator {
                category,
                name: name.to_string(),
            });
        }

        let name = name.to_string();
        match op {
            Operator::Query(f) => self.query.insert(name, f).map(|_| ()),
            Operator::Expression(f) => self.expression.insert(name, f).map(|_| ()),
            Operator::Accumulator(f) => self.accumulator.insert(name, f).map(|_| ()),
            Operator::Pipeline(f) => self.pipeline.insert(name, f).map(|_| ()),
            Operator::Projection(f) => self.projection.insert(name, f).map(|_| ()),
            Operator::Window(f) => self.window.insert(name, f).map(|_| ()),
        };
        Ok(())
    }

    /// Register a batch of built-ins; names are static and unique
    pub(crate) fn register_all(&mut self, ops: Vec<(&'static str, Operator)>) {
        for (name, op) in ops {
            if let Err(e) = self.register(name, op) {
                tracing::warn!(error = %e, "skipping built-in operator");
            }
        }
    }

    /// Check whether `name` is registered in `category`
    pub fn contains(&self, category: OperatorCategory, name: &str) -> bool {
        match category {
            OperatorCategory::Query => self.query.contains_key(name),
            OperatorCategory::Expression => self.expression.contains_key(name),
            OperatorCategory::Accumulator => self.accumulator.contains_key(name),
            OperatorCategory::Pipeline => self.pipeline.contains_key(name),
            OperatorCategory::Projection => self.projection.contains_key(name),
            OperatorCategory::Window => self.window.contains_key(name),
        }
    }

    /// Registered names in a category, sorted
    pub fn names(&self, category: OperatorCategory) -> Vec<&str> {
        let mut names: Vec<&str> = match category {
            OperatorCategory::Query => self.query.keys().map(String::as_str).collect(),
            OperatorCategory::Expression => self.expression.keys().map(String::as_str).collect(),
            OperatorCategory::Accumulator => self.accumulator.keys().map(String::as_str).collect(),
            OperatorCategory::Pipeline => self.pipeline.keys().map(String::as_str).collect(),
            OperatorCategory::Projection => self.projection.keys().map(String::as_str).collect(),
            OperatorCategory::Window => self.window.keys().map(String::as_str).collect(),
        };
        names.sort_unstable();
        names
    }

    /// Look up a query operator
    pub fn query(&self, name: &str) -> Option<&QueryOperator> {
        self.query.get(name)
    }

    /// Look up an expression operator
    pub fn expression(&self, name: &str) -> Option<&ExpressionOperator> {
        self.expression.get(name)
    }

    /// Look up an accumulator
    pub fn accumulator(&self, name: &str) -> Option<&AccumulatorOperator> {
        self.accumulator.get(name)
    }

    /// Look up a pipeline stage
    pub fn pipeline(&self, name: &str) -> Option<&PipelineOperator> {
        self.pipeline.get(name)
    }

    /// Look up a projection operator
    pub fn projection(&self, name: &str) -> Option<&ProjectionOperator> {
        self.projection.get(name)
    }

    /// Look up a window function
    pub fn window(&self, name: &str) -> Option<&WindowOperator> {
        self.window.get(name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("query", &self.query.len())
            .field("expression", &self.expression.len())
            .field("accumulator", &self.accumulator.len())
            .field("pipeline", &self.pipeline.len())
            .field("projection", &self.projection.len())
            .field("window", &self.window.len())
            .finish()
    }
}
