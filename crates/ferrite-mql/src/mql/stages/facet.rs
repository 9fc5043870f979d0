//! `$facet`

use serde_json::{Map, Value};
use tracing::trace;

use crate::mql::aggregation::Aggregator;
use crate::mql::error::{MqlError, Result};
use crate::mql::lazy::Lazy;
use crate::mql::registry::Operator;

use super::{stage_object, StageEnv};

/// Stages not allowed inside a facet
const FORBIDDEN: [&str; 3] = ["$facet", "$out", "$merge"];

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    vec![("$facet", Operator::pipeline(facet_stage))]
}

fn facet_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let spec = stage_object("$facet", arg)?;
    let mut facets = Vec::with_capacity(spec.len());

    for (name, pipeline) in spec {
        let stages = pipeline.as_array().ok_or_else(|| {
            MqlError::InvalidStage(format!("$facet '{}' must be a pipeline array", name))
        })?;
        for stage in stages {
            if let Some(forbidden) = stage
                .as_object()
                .and_then(|s| s.keys().find(|k| FORBIDDEN.contains(&k.as_str())))
            {
                return Err(MqlError::InvalidStage(format!(
                    "{} is not allowed inside $facet '{}'",
                    forbidden, name
                )));
            }
        }
        let aggregator = Aggregator::new(stages, env.engine())?
            .with_variables(env.variables().flatten());
        // Wire once against an empty input so malformed sub-stages fail now.
        aggregator.stream(Lazy::empty())?;
        facets.push((name.clone(), aggregator));
    }

    Ok(lazy.transform(move |docs| {
        trace!(documents = docs.len(), facets = facets.len(), "$facet");
        let mut out = Map::new();
        for (name, aggregator) in &facets {
            out.insert(name.clone(), Value::Array(aggregator.run(docs.clone())?));
        }
        Ok(vec![Value::Object(out)])
    }))
}
