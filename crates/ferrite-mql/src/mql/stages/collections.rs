//! Stages that read or write caller-owned collections
//!
//! Collections are resolved by name through
//! [`Options::collection_resolver`](crate::mql::Options) when the stage is
//! wired. `$out` and `$merge` write when their input is exhausted and emit
//! nothing.

use std::iter;

use serde_json::{Map, Value};
use tracing::debug;

use crate::mql::aggregation::Aggregator;
use crate::mql::collection::Collection;
use crate::mql::error::{MqlError, Result};
use crate::mql::expression::{evaluate, Expr};
use crate::mql::lazy::Lazy;
use crate::mql::registry::Operator;
use crate::mql::value;

use super::{stage_object, StageEnv};

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    vec![
        ("$lookup", Operator::pipeline(lookup_stage)),
        ("$unionWith", Operator::pipeline(union_with_stage)),
        ("$out", Operator::pipeline(out_stage)),
        ("$merge", Operator::pipeline(merge_stage)),
    ]
}

fn string_field<'a>(stage: &str, spec: &'a Map<String, Value>, field: &str) -> Result<Option<&'a str>> {
    match spec.get(field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(MqlError::InvalidStage(format!(
            "{} '{}' must be a string",
            stage, field
        ))),
    }
}

/// Target collection given as a name or `{db, coll}`
fn resolve_target(stage: &str, target: &Value, env: &StageEnv) -> Result<(String, Collection)> {
    let name = match target {
        Value::String(name) => name.clone(),
        Value::Object(spec) => string_field(stage, spec, "coll")?
            .ok_or_else(|| MqlError::InvalidStage(format!("{} requires 'coll'", stage)))?
            .to_string(),
        _ => {
            return Err(MqlError::InvalidStage(format!(
                "{} target must be a collection name or {{db, coll}}",
                stage
            )))
        }
    };
    let collection = env.options().resolve_collection(&name)?;
    Ok((name, collection))
}

/// Compile a nested pipeline and wire it once so malformed stages fail now
fn sub_pipeline(stage: &str, pipeline: &Value, env: &StageEnv) -> Result<Aggregator> {
    let stages = pipeline
        .as_array()
        .ok_or_else(|| MqlError::InvalidStage(format!("{} 'pipeline' must be an array", stage)))?;
    let aggregator = Aggregator::new(stages, env.engine())?;
    aggregator.stream(Lazy::empty())?;
    Ok(aggregator)
}

fn compile_let(stage: &str, spec: &Map<String, Value>, env: &StageEnv) -> Result<Vec<(String, Expr)>> {
    match spec.get("let") {
        None => Ok(Vec::new()),
        Some(Value::Object(vars)) => vars
            .iter()
            .map(|(name, expr)| Ok((name.clone(), Expr::compile(expr, env.engine())?)))
            .collect(),
        Some(_) => Err(MqlError::InvalidStage(format!("{} 'let' must be an object", stage))),
    }
}

/// Evaluate `let` bindings against `doc`, layered over the pipeline variables
fn bind(vars: &[(String, Expr)], doc: &Value, env: &StageEnv) -> Result<Vec<(String, Value)>> {
    let mut bindings = env.variables().flatten();
    let ctx = env.context(doc);
    for (name, expr) in vars {
        bindings.push((name.clone(), evaluate(doc, expr, &ctx)?));
    }
    Ok(bindings)
}

/// True when `local` and `foreign` share a value, looking inside arrays on
/// either side
fn join_matches(local: &Value, foreign: Option<Value>) -> bool {
    let foreign = foreign.unwrap_or(Value::Null);
    let mut candidates = vec![&foreign];
    if let Value::Array(items) = &foreign {
        candidates.extend(items.iter());
    }
    let locals: Vec<&Value> = match local {
        Value::Array(items) if !items.is_empty() => items.iter().collect(),
        other => vec![other],
    };
    locals
        .iter()
        .any(|l| candidates.iter().any(|c| value::equals(l, c)))
}

fn lookup_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let spec = stage_object("$lookup", arg)?;
    let from = spec
        .get("from")
        .ok_or_else(|| MqlError::InvalidStage("$lookup requires 'from'".into()))?;
    let (_, collection) = resolve_target("$lookup", from, env)?;
    let as_field = string_field("$lookup", spec, "as")?
        .ok_or_else(|| MqlError::InvalidStage("$lookup requires 'as'".into()))?
        .to_string();

    let join = match (
        string_field("$lookup", spec, "localField")?,
        string_field("$lookup", spec, "foreignField")?,
    ) {
        (Some(local), Some(foreign)) => Some((local.to_string(), foreign.to_string())),
        (None, None) => None,
        _ => {
            return Err(MqlError::InvalidStage(
                "$lookup requires both 'localField' and 'foreignField'".into(),
            ))
        }
    };
    let pipeline = spec
        .get("pipeline")
        .map(|p| sub_pipeline("$lookup", p, env))
        .transpose()?;
    if join.is_none() && pipeline.is_none() {
        return Err(MqlError::InvalidStage(
            "$lookup requires either 'localField'/'foreignField' or 'pipeline'".into(),
        ));
    }
    let vars = compile_let("$lookup", spec, env)?;

    let env = env.clone();
    Ok(lazy.map(move |mut doc| {
        let mut foreign = collection.snapshot();
        if let Some((local_field, foreign_field)) = &join {
            let local = value::resolve(&doc, local_field).unwrap_or(Value::Null);
            foreign.retain(|f| join_matches(&local, value::resolve(f, foreign_field)));
        }
        if let Some(pipeline) = &pipeline {
            let bindings = bind(&vars, &doc, &env)?;
            foreign = pipeline.clone().with_variables(bindings).run(foreign)?;
        }
        value::set_path(&mut doc, &as_field, Value::Array(foreign));
        Ok(doc)
    }))
}

fn union_with_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let (target, pipeline) = match arg {
        Value::Object(spec) => {
            let coll = spec
                .get("coll")
                .ok_or_else(|| MqlError::InvalidStage("$unionWith requires 'coll'".into()))?;
            let pipeline = match spec.get("pipeline") {
                Some(p) => sub_pipeline("$unionWith", p, env)?,
                None => Aggregator::new(&[], env.engine())?,
            };
            (coll, pipeline)
        }
        other => (other, Aggregator::new(&[], env.engine())?),
    };
    let (_, collection) = resolve_target("$unionWith", target, env)?;

    let tail = iter::once_with(move || pipeline.stream(&collection)).flat_map(
        |stream| -> Box<dyn Iterator<Item = Result<Value>>> {
            match stream {
                Ok(lazy) => Box::new(lazy),
                Err(e) => Box::new(iter::once(Err(e))),
            }
        },
    );
    Ok(Lazy::from_results(lazy.chain(tail)))
}

fn out_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let (name, collection) = resolve_target("$out", arg, env)?;
    Ok(lazy.transform(move |docs| {
        debug!(collection = %name, documents = docs.len(), "$out replacing collection");
        collection.replace_all(docs);
        Ok(Vec::new())
    }))
}

/// `whenMatched` policy
enum WhenMatched {
    Replace,
    KeepExisting,
    Merge,
    Fail,
    Pipeline(Aggregator),
}

/// `whenNotMatched` policy
#[derive(Clone, Copy, PartialEq, Eq)]
enum WhenNotMatched {
    Insert,
    Discard,
    Fail,
}

/// Stages allowed in a `whenMatched` pipeline
const UPDATE_STAGES: [&str; 6] = [
    "$addFields",
    "$set",
    "$project",
    "$unset",
    "$replaceRoot",
    "$replaceWith",
];

fn parse_when_matched(spec: &Map<String, Value>, env: &StageEnv) -> Result<WhenMatched> {
    match spec.get("whenMatched") {
        None => Ok(WhenMatched::Merge),
        Some(Value::String(s)) => match s.as_str() {
            "replace" => Ok(WhenMatched::Replace),
            "keepExisting" => Ok(WhenMatched::KeepExisting),
            "merge" => Ok(WhenMatched::Merge),
            "fail" => Ok(WhenMatched::Fail),
            other => Err(MqlError::InvalidStage(format!(
                "$merge has an unknown whenMatched mode: {}",
                other
            ))),
        },
        Some(pipeline @ Value::Array(stages)) => {
            for stage in stages {
                let allowed = stage
                    .as_object()
                    .and_then(|s| s.keys().next())
                    .is_some_and(|name| UPDATE_STAGES.contains(&name.as_str()));
                if !allowed {
                    return Err(MqlError::InvalidStage(format!(
                        "$merge whenMatched pipelines may only use {}",
                        UPDATE_STAGES.join(", ")
                    )));
                }
            }
            Ok(WhenMatched::Pipeline(sub_pipeline("$merge", pipeline, env)?))
        }
        Some(_) => Err(MqlError::InvalidStage(
            "$merge whenMatched must be a string or a pipeline".into(),
        )),
    }
}

fn parse_when_not_matched(spec: &Map<String, Value>) -> Result<WhenNotMatched> {
    match string_field("$merge", spec, "whenNotMatched")? {
        None | Some("insert") => Ok(WhenNotMatched::Insert),
        Some("discard") => Ok(WhenNotMatched::Discard),
        Some("fail") => Ok(WhenNotMatched::Fail),
        Some(other) => Err(MqlError::InvalidStage(format!(
            "$merge has an unknown whenNotMatched mode: {}",
            other
        ))),
    }
}

struct Merge {
    name: String,
    target: Collection,
    on: Vec<String>,
    vars: Vec<(String, Expr)>,
    when_matched: WhenMatched,
    when_not_matched: WhenNotMatched,
}

impl Merge {
    fn parse(arg: &Value, env: &StageEnv) -> Result<Self> {
        let owned;
        let spec = match arg {
            Value::String(_) => {
                let mut spec = Map::new();
                spec.insert("into".to_string(), arg.clone());
                owned = spec;
                &owned
            }
            other => stage_object("$merge", other)?,
        };
        let into = spec
            .get("into")
            .ok_or_else(|| MqlError::InvalidStage("$merge requires 'into'".into()))?;
        let (name, target) = resolve_target("$merge", into, env)?;

        let on = match spec.get("on") {
            None => vec![env.options().id_key.clone()],
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) if !items.is_empty() => items
                .iter()
                .map(|f| f.as_str().map(str::to_string))
                .collect::<Option<_>>()
                .ok_or_else(|| MqlError::InvalidStage("$merge 'on' must list field names".into()))?,
            Some(_) => {
                return Err(MqlError::InvalidStage(
                    "$merge 'on' must be a field name or an array of field names".into(),
                ))
            }
        };

        let mut vars = compile_let("$merge", spec, env)?;
        if vars.is_empty() {
            vars.push(("new".to_string(), Expr::current()));
        }

        Ok(Self {
            name,
            target,
            on,
            vars,
            when_matched: parse_when_matched(spec, env)?,
            when_not_matched: parse_when_not_matched(spec)?,
        })
    }

    fn key(&self, doc: &Value) -> Vec<Value> {
        self.on
            .iter()
            .map(|f| value::resolve(doc, f).unwrap_or(Value::Null))
            .collect()
    }

    fn write(&self, doc: Value, env: &StageEnv) -> Result<()> {
        let key = self.key(&doc);
        let position = self.target.position(|existing| {
            self.key(existing)
                .iter()
                .zip(key.iter())
                .all(|(a, b)| value::equals(a, b))
        });

        let Some(index) = position else {
            return match self.when_not_matched {
                WhenNotMatched::Insert => {
                    self.target.extend(iter::once(doc));
                    Ok(())
                }
                WhenNotMatched::Discard => Ok(()),
                WhenNotMatched::Fail => Err(MqlError::InvalidStage(format!(
                    "$merge found no document in '{}' matching {:?}",
                    self.name, key
                ))),
            };
        };
        let existing = self.target.get(index).unwrap_or(Value::Null);

        let updated = match &self.when_matched {
            WhenMatched::Replace => doc,
            WhenMatched::KeepExisting => return Ok(()),
            WhenMatched::Merge => match (existing, doc) {
                (Value::Object(mut base), Value::Object(incoming)) => {
                    base.extend(incoming);
                    Value::Object(base)
                }
                (_, incoming) => incoming,
            },
            WhenMatched::Fail => {
                return Err(MqlError::InvalidStage(format!(
                    "$merge found an existing document in '{}' matching {:?}",
                    self.name, key
                )))
            }
            WhenMatched::Pipeline(pipeline) => {
                let bindings = bind(&self.vars, &doc, env)?;
                match pipeline.clone().with_variables(bindings).run(vec![existing])?.pop() {
                    Some(updated) => updated,
                    None => return Ok(()),
                }
            }
        };
        self.target.set(index, updated);
        Ok(())
    }
}

fn merge_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let merge = Merge::parse(arg, env)?;
    let env = env.clone();
    Ok(lazy.transform(move |docs| {
        debug!(collection = %merge.name, documents = docs.len(), "$merge writing documents");
        for doc in docs {
            merge.write(doc, &env)?;
        }
        Ok(Vec::new())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mql::options::Options;
    use crate::mql::Engine;
    use serde_json::json;
    use std::collections::HashMap;

    fn engine_with(collections: Vec<(&str, Collection)>) -> Engine {
        let table: HashMap<String, Collection> = collections
            .into_iter()
            .map(|(name, c)| (name.to_string(), c))
            .collect();
        Engine::new(Options::default().with_collection_resolver(move |name| table.get(name).cloned()))
    }

    fn inventory() -> Collection {
        Collection::from_docs(vec![
            json!({ "sku": "a", "stock": 5 }),
            json!({ "sku": "b", "stock": 0 }),
            json!({ "sku": ["a", "c"], "stock": 2 }),
        ])
    }

    #[test]
    fn test_lookup_equality() {
        let engine = engine_with(vec![("inventory", inventory())]);
        let out = engine
            .aggregate(
                vec![json!({ "item": "a" }), json!({ "item": "z" })],
                &[json!({ "$lookup": {
                    "from": "inventory", "localField": "item", "foreignField": "sku", "as": "stock"
                } })],
            )
            .unwrap();
        assert_eq!(out[0]["stock"].as_array().map(Vec::len), Some(2));
        assert_eq!(out[1]["stock"], json!([]));
    }

    #[test]
    fn test_lookup_pipeline_with_let() {
        let engine = engine_with(vec![("inventory", inventory())]);
        let out = engine
            .aggregate(
                vec![json!({ "min": 1 })],
                &[json!({ "$lookup": {
                    "from": "inventory",
                    "let": { "floor": "$min" },
                    "pipeline": [
                        { "$match": { "$expr": { "$gte": ["$stock", "$$floor"] } } },
                        { "$project": { "_id": 0, "stock": 1 } }
                    ],
                    "as": "available"
                } })],
            )
            .unwrap();
        assert_eq!(out[0]["available"], json!([{ "stock": 5 }, { "stock": 2 }]));
    }

    #[test]
    fn test_lookup_requires_resolver() {
        let engine = Engine::default();
        let aggregator = engine
            .aggregator(&[json!({ "$lookup": {
                "from": "x", "localField": "a", "foreignField": "b", "as": "c"
            } })])
            .unwrap();
        assert!(matches!(
            aggregator.stream(Vec::new()),
            Err(MqlError::MissingConfiguration(_))
        ));
    }

    #[test]
    fn test_union_with() {
        let engine = engine_with(vec![("inventory", inventory())]);
        let out = engine
            .aggregate(
                vec![json!({ "sku": "head" })],
                &[json!({ "$unionWith": {
                    "coll": "inventory",
                    "pipeline": [{ "$match": { "stock": { "$gt": 0 } } }]
                } })],
            )
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], json!({ "sku": "head" }));
    }

    #[test]
    fn test_out_replaces_and_emits_nothing() {
        let target = Collection::from_docs(vec![json!({ "old": true })]);
        let engine = engine_with(vec![("target", target.clone())]);
        let out = engine
            .aggregate(vec![json!({ "n": 1 }), json!({ "n": 2 })], &[json!({ "$out": "target" })])
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(target.snapshot(), vec![json!({ "n": 1 }), json!({ "n": 2 })]);
    }

    #[test]
    fn test_merge_modes() {
        let target = Collection::from_docs(vec![
            json!({ "_id": 1, "qty": 5, "note": "keep" }),
            json!({ "_id": 2, "qty": 1 }),
        ]);
        let engine = engine_with(vec![("target", target.clone())]);
        engine
            .aggregate(
                vec![json!({ "_id": 1, "qty": 7 }), json!({ "_id": 3, "qty": 9 })],
                &[json!({ "$merge": { "into": "target" } })],
            )
            .unwrap();
        assert_eq!(
            target.snapshot(),
            vec![
                json!({ "_id": 1, "qty": 7, "note": "keep" }),
                json!({ "_id": 2, "qty": 1 }),
                json!({ "_id": 3, "qty": 9 }),
            ]
        );

        engine
            .aggregate(
                vec![json!({ "_id": 2, "qty": 4 }), json!({ "_id": 4, "qty": 0 })],
                &[json!({ "$merge": {
                    "into": "target",
                    "whenMatched": [{ "$set": { "qty": { "$add": ["$qty", "$$new.qty"] } } }],
                    "whenNotMatched": "discard"
                } })],
            )
            .unwrap();
        assert_eq!(target.get(1), Some(json!({ "_id": 2, "qty": 5 })));
        assert_eq!(target.len(), 3);

        let err = engine.aggregate(
            vec![json!({ "_id": 1 })],
            &[json!({ "$merge": { "into": "target", "whenMatched": "fail" } })],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_merge_rejects_other_update_stages() {
        let engine = engine_with(vec![("target", Collection::new())]);
        let aggregator = engine
            .aggregator(&[json!({ "$merge": { "into": "target", "whenMatched": [{ "$group": { "_id": null } }] } })])
            .unwrap();
        assert!(aggregator.stream(Vec::new()).is_err());
    }
}
