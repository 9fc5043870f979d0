//! In-memory MongoDB-style query and aggregation engine
//!
//! This module evaluates the MongoDB query language over documents held in
//! memory:
//! - Query criteria compiled into predicate closures (`find`)
//! - Aggregation pipelines driven by a lazy pull-based iterator
//! - Expressions decoded once into an AST and evaluated per document
//! - Group, sort, bucket, facet and window stages
//! - A per-engine operator registry open to caller extensions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │            Options  +  Registry (frozen at build)            │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │   Query ──► Cursor           │   Aggregator ──► Lazy         │
//! │   (predicates)               │   (stage per registry entry)  │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │      Expr evaluator  ·  Accumulators  ·  Window functions    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use ferrite_mql::Engine;
//! use serde_json::json;
//!
//! let engine = Engine::default();
//! let docs = vec![
//!     json!({ "k": "x", "v": 1 }),
//!     json!({ "k": "y", "v": 2 }),
//!     json!({ "k": "x", "v": 3 }),
//! ];
//!
//! let grouped = engine
//!     .aggregate(docs.clone(), &[json!({ "$group": { "_id": "$k", "total": { "$sum": "$v" } } })])
//!     .unwrap();
//! assert_eq!(grouped[0], json!({ "_id": "x", "total": 4 }));
//!
//! let found = engine.find(docs, &json!({ "v": { "$gt": 1 } }), None).unwrap().all().unwrap();
//! assert_eq!(found.len(), 2);
//! ```

pub mod accumulator;
pub mod aggregation;
pub mod collection;
pub mod context;
pub mod error;
pub mod expression;
pub mod lazy;
pub mod operators;
pub mod options;
pub mod projection;
pub mod query;
pub mod registry;
pub mod stages;
pub mod value;
pub mod window;

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

pub use accumulator::accumulate;
pub use aggregation::Aggregator;
pub use collection::Collection;
pub use context::{Context, Scope};
pub use error::{MqlError, OperatorCategory, Result};
pub use expression::{evaluate, Expr};
pub use lazy::{DocumentSource, First, Lazy};
pub use options::{Collation, Options, ProcessingMode};
pub use projection::Projection;
pub use query::{Cursor, Query};
pub use registry::{Operator, Registry};

struct EngineInner {
    options: Options,
    registry: Registry,
}

/// Query and aggregation engine
///
/// Cheap to clone; clones share the same options and frozen registry.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Engine with the built-in operators and `options`
    pub fn new(options: Options) -> Self {
        Self::builder().options(options).build()
    }

    /// Start building an engine with custom operators
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Engine options
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Operator registry
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Compile query criteria
    pub fn query(&self, criteria: &Value) -> Result<Query> {
        Query::new(criteria, self)
    }

    /// Open a cursor over the documents matching `criteria`
    pub fn find(
        &self,
        source: impl Into<DocumentSource>,
        criteria: &Value,
        projection: Option<&Value>,
    ) -> Result<Cursor> {
        self.query(criteria)?.find(source, projection)
    }

    /// Compile a pipeline
    pub fn aggregator(&self, pipeline: &[Value]) -> Result<Aggregator> {
        Aggregator::new(pipeline, self)
    }

    /// Run a pipeline to completion
    pub fn aggregate(
        &self,
        source: impl Into<DocumentSource>,
        pipeline: &[Value],
    ) -> Result<Vec<Value>> {
        self.aggregator(pipeline)?.run(source)
    }

    /// Evaluate a single expression against `doc`
    pub fn evaluate(&self, doc: &Value, expr: &Value) -> Result<Value> {
        let compiled = Expr::compile(expr, self)?;
        evaluate(doc, &compiled, &Context::new(self, doc))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("options", &self.inner.options)
            .field("registry", &self.inner.registry)
            .finish()
    }
}

/// Builder for an [`Engine`] with caller-supplied operators
pub struct EngineBuilder {
    options: Options,
    registry: Registry,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            options: Options::default(),
            registry: Registry::with_builtins(),
        }
    }
}

impl EngineBuilder {
    /// Set the options
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Start from an empty registry instead of the built-ins
    pub fn without_builtins(mut self) -> Self {
        self.registry = Registry::empty();
        self
    }

    /// Register an operator; fails on a malformed or duplicate name
    pub fn register(mut self, name: &str, op: Operator) -> Result<Self> {
        let category = op.category();
        self.registry.register(name, op)?;
        debug!(%category, name, "registered operator");
        Ok(self)
    }

    /// Freeze the registry and build the engine
    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                options: self.options,
                registry: self.registry,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_engine_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine>();
        assert_send_sync::<Query>();
        assert_send_sync::<Aggregator>();
    }

    #[test]
    fn test_custom_expression_operator() {
        let engine = Engine::builder()
            .register(
                "$double",
                Operator::expression(|doc, args, ctx| {
                    let v = evaluate(doc, args, ctx)?;
                    Ok(value::number(value::as_f64(&v).unwrap_or(0.0) * 2.0))
                }),
            )
            .unwrap()
            .build();

        let out = engine
            .aggregate(
                vec![json!({ "n": 21 })],
                &[json!({ "$project": { "_id": 0, "d": { "$double": "$n" } } })],
            )
            .unwrap();
        assert_eq!(out, vec![json!({ "d": 42 })]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let result = Engine::builder().register(
            "$match",
            Operator::pipeline(|lazy, _, _| Ok(lazy)),
        );
        assert!(matches!(result, Err(MqlError::DuplicateOperator { .. })));
    }

    #[test]
    fn test_engines_are_independent() {
        let custom = Engine::builder()
            .register("$one", Operator::expression(|_, _, _| Ok(json!(1))))
            .unwrap()
            .build();
        let plain = Engine::default();

        assert_eq!(custom.evaluate(&json!({}), &json!({ "$one": [] })).unwrap(), json!(1));
        assert!(plain.evaluate(&json!({}), &json!({ "$one": [] })).is_err());
    }
}
