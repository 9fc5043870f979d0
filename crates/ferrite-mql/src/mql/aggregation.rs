//! Aggregation pipeline sequencer
//!
//! A pipeline is an ordered list of single-key stage documents. `stream`
//! threads a [`Lazy`] through the registered stage functions; each stage
//! validates its argument when it is wired in, so a malformed pipeline fails
//! before any document is read.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::context::Scope;
use super::error::{MqlError, OperatorCategory, Result};
use super::lazy::{DocumentSource, Lazy};
use super::stages::StageEnv;
use super::Engine;

/// Stages that write to a collection and must end the pipeline
const TERMINAL_STAGES: [&str; 2] = ["$out", "$merge"];

/// Compiled aggregation pipeline
#[derive(Clone)]
pub struct Aggregator {
    stages: Vec<(String, Value)>,
    env: StageEnv,
}

impl Aggregator {
    /// Validate a pipeline against the engine's registry
    pub fn new(pipeline: &[Value], engine: &Engine) -> Result<Self> {
        let mut stages = Vec::with_capacity(pipeline.len());

        for (index, stage) in pipeline.iter().enumerate() {
            let obj = stage
                .as_object()
                .ok_or_else(|| MqlError::InvalidStage("Stage must be an object".into()))?;
            if obj.len() != 1 {
                return Err(MqlError::InvalidStage(
                    "Stage must have exactly one operator".into(),
                ));
            }
            let (name, arg) = obj
                .iter()
                .next()
                .ok_or_else(|| MqlError::InvalidStage("Empty stage operator".into()))?;

            if engine.registry().pipeline(name).is_none() {
                return Err(MqlError::unknown(OperatorCategory::Pipeline, name.as_str()));
            }
            if TERMINAL_STAGES.contains(&name.as_str()) && index + 1 != pipeline.len() {
                return Err(MqlError::InvalidStage(format!(
                    "{} can only be the final stage in the pipeline",
                    name
                )));
            }
            stages.push((name.clone(), arg.clone()));
        }

        debug!(
            stages = ?stages.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
            "compiled pipeline"
        );
        Ok(Self {
            stages,
            env: StageEnv::new(engine.clone()),
        })
    }

    /// Validate a pipeline given as a JSON array
    pub fn from_json(pipeline: &Value, engine: &Engine) -> Result<Self> {
        let stages = pipeline
            .as_array()
            .ok_or_else(|| MqlError::InvalidStage("Pipeline must be an array".into()))?;
        Self::new(stages, engine)
    }

    /// Bind variables visible as `$$name` to every stage
    pub fn with_variables(mut self, bindings: Vec<(String, Value)>) -> Self {
        self.env = self.env.with_variables(Arc::new(Scope::new(bindings)));
        self
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Check if the pipeline has no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Wire the pipeline onto `source` without pulling anything
    pub fn stream(&self, source: impl Into<DocumentSource>) -> Result<Lazy> {
        let registry = self.env.engine().registry();
        let mut lazy = source
            .into()
            .into_lazy(self.env.options().processing_mode);

        for (name, arg) in &self.stages {
            let stage = registry
                .pipeline(name)
                .ok_or_else(|| MqlError::unknown(OperatorCategory::Pipeline, name.as_str()))?;
            lazy = stage(lazy, arg, &self.env)?;
        }
        Ok(lazy)
    }

    /// Run the pipeline to completion
    pub fn run(&self, source: impl Into<DocumentSource>) -> Result<Vec<Value>> {
        self.stream(source)?.value()
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field(
                "stages",
                &self.stages.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
