//! Per-document stages and the small whole-input ones

use rand::seq::SliceRandom;
use serde_json::{json, Map, Value};
use tracing::{trace, warn};

use crate::mql::error::{MqlError, Result};
use crate::mql::expression::{evaluate, evaluate_partial, Expr};
use crate::mql::lazy::Lazy;
use crate::mql::projection::Projection;
use crate::mql::query::Query;
use crate::mql::registry::Operator;
use crate::mql::value;
use crate::mql::Engine;

use super::group::partition;
use super::sort::{sort_documents, SortKey};
use super::{stage_count, stage_object, StageEnv};

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    vec![
        ("$match", Operator::pipeline(match_stage)),
        ("$project", Operator::pipeline(project_stage)),
        ("$addFields", Operator::pipeline(|l, a, e| add_fields("$addFields", l, a, e))),
        ("$set", Operator::pipeline(|l, a, e| add_fields("$set", l, a, e))),
        ("$unset", Operator::pipeline(unset_stage)),
        ("$limit", Operator::pipeline(limit_stage)),
        ("$skip", Operator::pipeline(skip_stage)),
        ("$count", Operator::pipeline(count_stage)),
        ("$replaceRoot", Operator::pipeline(replace_root_stage)),
        ("$replaceWith", Operator::pipeline(|l, a, e| replace("$replaceWith", l, a, e))),
        ("$unwind", Operator::pipeline(unwind_stage)),
        ("$sample", Operator::pipeline(sample_stage)),
        ("$sortByCount", Operator::pipeline(sort_by_count_stage)),
    ]
}

fn match_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let query = Query::new(arg, env.engine())?;
    let env = env.clone();
    Ok(lazy.filter(move |doc| query.test_with(doc, &env.context(doc))))
}

fn project_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    if stage_object("$project", arg)?.is_empty() {
        return Err(MqlError::InvalidStage(
            "$project requires at least one output field".into(),
        ));
    }
    let projection = Projection::new(arg, env.engine())?;
    let env = env.clone();
    Ok(lazy.map(move |doc| projection.apply(&doc, &env.context(&doc))))
}

/// Flatten `{a: {b: expr}}` into `("a.b", expr)` so nested objects merge
/// into existing sub-documents
fn flatten_fields(
    stage: &str,
    prefix: Option<&str>,
    spec: &Map<String, Value>,
    engine: &Engine,
    out: &mut Vec<(String, Expr)>,
) -> Result<()> {
    for (key, val) in spec {
        if key.starts_with('$') {
            return Err(MqlError::InvalidStage(format!(
                "{}: field names may not start with '$': {}",
                stage, key
            )));
        }
        let path = match prefix {
            Some(p) => format!("{}.{}", p, key),
            None => key.clone(),
        };
        match val {
            Value::Object(inner)
                if !inner.is_empty()
                    && !inner.keys().any(|k| k.starts_with('$')) =>
            {
                flatten_fields(stage, Some(&path), inner, engine, out)?
            }
            _ => out.push((path, Expr::compile(val, engine)?)),
        }
    }
    Ok(())
}

fn add_fields(stage: &'static str, lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let spec = stage_object(stage, arg)?;
    let mut fields = Vec::with_capacity(spec.len());
    flatten_fields(stage, None, spec, env.engine(), &mut fields)?;

    let env = env.clone();
    Ok(lazy.map(move |mut doc| {
        let values = {
            let ctx = env.context(&doc);
            fields
                .iter()
                .map(|(path, expr)| Ok((path, evaluate_partial(&doc, expr, &ctx)?)))
                .collect::<Result<Vec<_>>>()?
        };
        for (path, v) in values {
            match v {
                Some(v) => value::set_path(&mut doc, path, v),
                None => value::remove_path(&mut doc, path),
            }
        }
        Ok(doc)
    }))
}

fn unset_stage(lazy: Lazy, arg: &Value, _env: &StageEnv) -> Result<Lazy> {
    let invalid = || MqlError::InvalidStage("$unset takes a field name or an array of field names".into());
    let paths: Vec<String> = match arg {
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| item.as_str().filter(|s| !s.is_empty()).map(str::to_string))
            .collect::<Option<_>>()
            .ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    Ok(lazy.map(move |mut doc| {
        for path in &paths {
            value::remove_path(&mut doc, path);
        }
        Ok(doc)
    }))
}

fn limit_stage(lazy: Lazy, arg: &Value, _env: &StageEnv) -> Result<Lazy> {
    Ok(lazy.take(stage_count("$limit", arg)?))
}

fn skip_stage(lazy: Lazy, arg: &Value, _env: &StageEnv) -> Result<Lazy> {
    Ok(lazy.skip(stage_count("$skip", arg)?))
}

fn count_stage(lazy: Lazy, arg: &Value, _env: &StageEnv) -> Result<Lazy> {
    let field = arg
        .as_str()
        .filter(|s| !s.is_empty() && !s.starts_with('$') && !s.contains('.'))
        .ok_or_else(|| {
            MqlError::InvalidStage(
                "$count takes a non-empty field name without '$' or '.'".into(),
            )
        })?
        .to_string();
    Ok(lazy.transform(move |docs| {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Map::new();
        out.insert(field, Value::from(docs.len()));
        Ok(vec![Value::Object(out)])
    }))
}

fn replace_root_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let new_root = stage_object("$replaceRoot", arg)?
        .get("newRoot")
        .ok_or_else(|| MqlError::InvalidStage("$replaceRoot requires 'newRoot'".into()))?;
    replace("$replaceRoot", lazy, new_root, env)
}

fn replace(stage: &'static str, lazy: Lazy, new_root: &Value, env: &StageEnv) -> Result<Lazy> {
    let expr = Expr::compile(new_root, env.engine())?;
    let env = env.clone();
    Ok(lazy.map(move |doc| match evaluate(&doc, &expr, &env.context(&doc))? {
        Value::Object(map) => Ok(Value::Object(map)),
        other => Err(MqlError::Type(format!(
            "{} requires the new root to be an object, found {}",
            stage,
            value::type_of(&other).name()
        ))),
    }))
}

struct Unwind {
    path: String,
    index_field: Option<String>,
    preserve: bool,
}

impl Unwind {
    fn parse(arg: &Value) -> Result<Self> {
        let field_path = |v: &Value| {
            v.as_str()
                .and_then(|s| s.strip_prefix('$'))
                .filter(|p| !p.is_empty() && !p.starts_with('$'))
                .map(str::to_string)
                .ok_or_else(|| {
                    MqlError::InvalidStage("$unwind path must be a field path starting with '$'".into())
                })
        };

        match arg {
            Value::String(_) => Ok(Self {
                path: field_path(arg)?,
                index_field: None,
                preserve: false,
            }),
            Value::Object(spec) => {
                let path = field_path(spec.get("path").unwrap_or(&Value::Null))?;
                let index_field = match spec.get("includeArrayIndex") {
                    None => None,
                    Some(Value::String(s)) if !s.is_empty() && !s.starts_with('$') => Some(s.clone()),
                    Some(_) => {
                        return Err(MqlError::InvalidStage(
                            "$unwind 'includeArrayIndex' must be a field name".into(),
                        ))
                    }
                };
                let preserve = match spec.get("preserveNullAndEmptyArrays") {
                    None => false,
                    Some(Value::Bool(b)) => *b,
                    Some(_) => {
                        return Err(MqlError::InvalidStage(
                            "$unwind 'preserveNullAndEmptyArrays' must be a boolean".into(),
                        ))
                    }
                };
                Ok(Self {
                    path,
                    index_field,
                    preserve,
                })
            }
            _ => Err(MqlError::InvalidStage(
                "$unwind takes a field path or an object".into(),
            )),
        }
    }

    fn with_index(&self, mut doc: Value, index: Value) -> Value {
        if let Some(field) = &self.index_field {
            value::set_path(&mut doc, field, index);
        }
        doc
    }

    fn apply(&self, doc: Value) -> Vec<Value> {
        match value::resolve(&doc, &self.path) {
            Some(Value::Array(items)) if !items.is_empty() => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    let mut copy = doc.clone();
                    value::set_path(&mut copy, &self.path, item);
                    self.with_index(copy, Value::from(i))
                })
                .collect(),
            Some(Value::Array(_)) if self.preserve => {
                let mut doc = doc;
                value::remove_path(&mut doc, &self.path);
                vec![self.with_index(doc, Value::Null)]
            }
            None | Some(Value::Null) if self.preserve => vec![self.with_index(doc, Value::Null)],
            None | Some(Value::Null) | Some(Value::Array(_)) => Vec::new(),
            Some(_) => vec![self.with_index(doc, Value::Null)],
        }
    }
}

fn unwind_stage(lazy: Lazy, arg: &Value, _env: &StageEnv) -> Result<Lazy> {
    let unwind = Unwind::parse(arg)?;
    Ok(Lazy::from_results(lazy.flat_map(move |item| match item {
        Ok(doc) => unwind.apply(doc).into_iter().map(Ok).collect::<Vec<_>>(),
        Err(e) => vec![Err(e)],
    })))
}

fn sample_stage(lazy: Lazy, arg: &Value, _env: &StageEnv) -> Result<Lazy> {
    let size = stage_object("$sample", arg)?
        .get("size")
        .ok_or_else(|| MqlError::InvalidStage("$sample requires 'size'".into()))
        .and_then(|size| stage_count("$sample 'size'", size))?;
    Ok(lazy.transform(move |docs| {
        if size > docs.len() {
            warn!(size, documents = docs.len(), "$sample size exceeds input, returning every document");
        }
        let mut rng = rand::thread_rng();
        Ok(docs.choose_multiple(&mut rng, size).cloned().collect())
    }))
}

fn sort_by_count_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let is_expression = match arg {
        Value::String(s) => s.starts_with('$'),
        Value::Object(map) => map.len() == 1 && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    };
    if !is_expression {
        return Err(MqlError::InvalidStage(
            "$sortByCount takes a field path or an expression object".into(),
        ));
    }
    let key = Expr::compile(arg, env.engine())?;
    let by_count = [SortKey {
        path: "count".to_string(),
        descending: true,
    }];

    let env = env.clone();
    Ok(lazy.transform(move |docs| {
        let groups = partition(docs, &key, &env)?;
        trace!(groups = groups.len(), "$sortByCount");
        let counted = groups
            .into_iter()
            .map(|(id, members)| json!({ "_id": id, "count": members.len() }))
            .collect();
        Ok(sort_documents(counted, &by_count, env.options()))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mql::aggregation::Aggregator;

    fn run(docs: Vec<Value>, pipeline: &[Value]) -> Result<Vec<Value>> {
        Engine::default().aggregate(docs, pipeline)
    }

    #[test]
    fn test_match_and_project() {
        let docs = vec![json!({ "_id": 1, "a": 5, "b": 1 }), json!({ "_id": 2, "a": 1, "b": 2 })];
        let out = run(
            docs,
            &[json!({ "$match": { "a": { "$gt": 2 } } }), json!({ "$project": { "b": 1 } })],
        )
        .unwrap();
        assert_eq!(out, vec![json!({ "_id": 1, "b": 1 })]);
    }

    #[test]
    fn test_empty_project_rejected() {
        assert!(run(Vec::new(), &[json!({ "$project": {} })]).is_err());
    }

    #[test]
    fn test_add_fields_merges_and_removes() {
        let docs = vec![json!({ "a": 1, "sub": { "x": 1 }, "gone": true })];
        let out = run(
            docs,
            &[json!({ "$addFields": {
                "b": { "$add": ["$a", 1] },
                "sub": { "y": "$a" },
                "gone": "$$REMOVE"
            } })],
        )
        .unwrap();
        assert_eq!(out, vec![json!({ "a": 1, "sub": { "x": 1, "y": 1 }, "b": 2 })]);
    }

    #[test]
    fn test_set_sees_original_document() {
        let out = run(
            vec![json!({ "a": 1 })],
            &[json!({ "$set": { "a": 10, "b": "$a" } })],
        )
        .unwrap();
        assert_eq!(out, vec![json!({ "a": 10, "b": 1 })]);
    }

    #[test]
    fn test_unset_limit_skip() {
        let docs: Vec<Value> = (0..5).map(|i| json!({ "i": i, "x": 0 })).collect();
        let out = run(
            docs,
            &[json!({ "$skip": 1 }), json!({ "$limit": 2 }), json!({ "$unset": ["x"] })],
        )
        .unwrap();
        assert_eq!(out, vec![json!({ "i": 1 }), json!({ "i": 2 })]);
    }

    #[test]
    fn test_count() {
        let docs = vec![json!({}), json!({})];
        assert_eq!(run(docs, &[json!({ "$count": "n" })]).unwrap(), vec![json!({ "n": 2 })]);
        assert_eq!(run(Vec::new(), &[json!({ "$count": "n" })]).unwrap(), Vec::<Value>::new());
        assert!(run(Vec::new(), &[json!({ "$count": "$n" })]).is_err());
    }

    #[test]
    fn test_replace_root() {
        let docs = vec![json!({ "a": { "b": 1 } }), json!({ "a": 3 })];
        let aggregator =
            Aggregator::new(&[json!({ "$replaceRoot": { "newRoot": "$a" } })], &Engine::default()).unwrap();
        let mut results = aggregator.stream(docs).unwrap();
        assert_eq!(results.next().unwrap().unwrap(), json!({ "b": 1 }));
        assert!(matches!(results.next(), Some(Err(MqlError::Type(_)))));

        let out = run(
            vec![json!({ "x": 1 })],
            &[json!({ "$replaceWith": { "wrapped": "$$ROOT" } })],
        )
        .unwrap();
        assert_eq!(out, vec![json!({ "wrapped": { "x": 1 } })]);
    }

    #[test]
    fn test_unwind() {
        let docs = vec![
            json!({ "_id": 1, "s": ["a", "b"] }),
            json!({ "_id": 2, "s": [] }),
            json!({ "_id": 3, "s": null }),
            json!({ "_id": 4 }),
            json!({ "_id": 5, "s": "c" }),
        ];
        let out = run(docs.clone(), &[json!({ "$unwind": "$s" })]).unwrap();
        assert_eq!(
            out,
            vec![
                json!({ "_id": 1, "s": "a" }),
                json!({ "_id": 1, "s": "b" }),
                json!({ "_id": 5, "s": "c" }),
            ]
        );

        let out = run(
            docs,
            &[json!({ "$unwind": {
                "path": "$s",
                "includeArrayIndex": "idx",
                "preserveNullAndEmptyArrays": true
            } })],
        )
        .unwrap();
        assert_eq!(out.len(), 6);
        assert_eq!(out[1], json!({ "_id": 1, "s": "b", "idx": 1 }));
        assert_eq!(out[2], json!({ "_id": 2, "idx": null }));
        assert_eq!(out[3], json!({ "_id": 3, "s": null, "idx": null }));
    }

    #[test]
    fn test_sample() {
        let docs: Vec<Value> = (0..10).map(|i| json!({ "i": i })).collect();
        let out = run(docs.clone(), &[json!({ "$sample": { "size": 3 } })]).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|d| docs.contains(d)));

        let out = run(docs, &[json!({ "$sample": { "size": 50 } })]).unwrap();
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_sort_by_count() {
        let docs = vec![json!({ "t": "x" }), json!({ "t": "y" }), json!({ "t": "y" })];
        let out = run(docs, &[json!({ "$sortByCount": "$t" })]).unwrap();
        assert_eq!(out, vec![json!({ "_id": "y", "count": 2 }), json!({ "_id": "x", "count": 1 })]);
        assert!(run(Vec::new(), &[json!({ "$sortByCount": "t" })]).is_err());
    }
}
