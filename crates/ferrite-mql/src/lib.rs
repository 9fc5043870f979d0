#![forbid(unsafe_code)]
#![warn(missing_docs)]
//! # ferrite-mql
//!
//! In-memory MongoDB-style query and aggregation engine for Ferrite
//!
//! Documents are `serde_json::Value` trees. Query criteria compile into
//! predicates for [`Engine::find`]; aggregation pipelines compile into a lazy
//! chain of stages for [`Engine::aggregate`]. Every operator lives in a
//! per-engine [`Registry`] that callers extend through [`EngineBuilder`].

pub mod mql;

pub use mql::{
    Aggregator, Collation, Collection, Context, Cursor, DocumentSource, Engine, EngineBuilder,
    Expr, Lazy, MqlError, Operator, OperatorCategory, Options, ProcessingMode, Projection, Query,
    Registry, Result, Scope,
};
