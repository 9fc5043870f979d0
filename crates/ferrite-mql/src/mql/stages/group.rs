//! `$group`

use std::collections::HashMap;

use serde_json::Value;
use tracing::trace;

use crate::mql::error::{MqlError, Result};
use crate::mql::expression::{evaluate, Expr};
use crate::mql::lazy::Lazy;
use crate::mql::registry::Operator;

use super::{compile_accumulators, group_output, stage_object, StageEnv};

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    vec![("$group", Operator::pipeline(group_stage))]
}

/// Split `docs` by the value of `key`, keeping groups in first-seen order and
/// members in input order
pub(crate) fn partition(
    docs: Vec<Value>,
    key: &Expr,
    env: &StageEnv,
) -> Result<Vec<(Value, Vec<Value>)>> {
    let options = env.options();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();

    for doc in docs {
        let id = evaluate(&doc, key, &env.context(&doc))?;
        let hashed = options.hash_key(&id);
        match index.get(&hashed) {
            Some(&i) => groups[i].1.push(doc),
            None => {
                index.insert(hashed, groups.len());
                groups.push((id, vec![doc]));
            }
        }
    }
    Ok(groups)
}

fn group_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let spec = stage_object("$group", arg)?;
    let id = spec
        .get("_id")
        .ok_or_else(|| MqlError::InvalidStage("a group specification must include an _id".into()))?;
    let id = Expr::compile(id, env.engine())?;
    let accumulators = compile_accumulators("$group", spec, &["_id"], env.engine())?;

    let env = env.clone();
    Ok(lazy.transform(move |docs| {
        let groups = partition(docs, &id, &env)?;
        trace!(groups = groups.len(), "$group");
        groups
            .into_iter()
            .map(|(key, members)| group_output(key, &members, &accumulators, &env))
            .collect()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mql::options::Options;
    use crate::mql::Engine;
    use serde_json::json;

    fn group(docs: Vec<Value>, spec: Value) -> Result<Vec<Value>> {
        Engine::default().aggregate(docs, &[json!({ "$group": spec })])
    }

    #[test]
    fn test_first_seen_order() {
        let docs = vec![
            json!({ "k": "b", "v": 1 }),
            json!({ "k": "a", "v": 2 }),
            json!({ "k": "b", "v": 3 }),
            json!({ "v": 4 }),
        ];
        let out = group(docs, json!({ "_id": "$k", "vs": { "$push": "$v" } })).unwrap();
        assert_eq!(
            out,
            vec![
                json!({ "_id": "b", "vs": [1, 3] }),
                json!({ "_id": "a", "vs": [2] }),
                json!({ "_id": null, "vs": [4] }),
            ]
        );
    }

    #[test]
    fn test_numeric_keys_collide() {
        let docs = vec![json!({ "k": 1 }), json!({ "k": 1.0 }), json!({ "k": 2 })];
        let out = group(docs, json!({ "_id": "$k", "n": { "$count": {} } })).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["n"], json!(2));
    }

    #[test]
    fn test_compound_id_and_null_id() {
        let docs = vec![
            json!({ "a": 1, "b": 2, "v": 5 }),
            json!({ "a": 1, "b": 2, "v": 7 }),
        ];
        let out = group(docs.clone(), json!({ "_id": { "a": "$a", "b": "$b" }, "t": { "$sum": "$v" } })).unwrap();
        assert_eq!(out, vec![json!({ "_id": { "a": 1, "b": 2 }, "t": 12 })]);

        let out = group(docs, json!({ "_id": null, "avg": { "$avg": "$v" } })).unwrap();
        assert_eq!(out, vec![json!({ "_id": null, "avg": 6 })]);
    }

    #[test]
    fn test_custom_hash_function() {
        let engine = Engine::new(
            Options::default().with_hash_function(|v| v.to_string().to_lowercase()),
        );
        let docs = vec![json!({ "k": "A" }), json!({ "k": "a" })];
        let out = engine
            .aggregate(docs, &[json!({ "$group": { "_id": "$k", "n": { "$sum": 1 } } })])
            .unwrap();
        assert_eq!(out, vec![json!({ "_id": "A", "n": 2 })]);
    }

    #[test]
    fn test_invalid_specifications() {
        let engine = Engine::default();
        for spec in [
            json!({ "total": { "$sum": 1 } }),
            json!({ "_id": null, "total": 1 }),
            json!({ "_id": null, "total": { "$sum": 1, "$avg": 1 } }),
            json!({ "_id": null, "total": { "$nope": 1 } }),
            json!({ "_id": null, "x": { "y": 1 } }),
            json!({ "_id": null, "x": { "$add": [1, 2] } }),
        ] {
            let aggregator = engine.aggregator(&[json!({ "$group": spec })]).unwrap();
            assert!(aggregator.stream(Vec::new()).is_err());
        }
    }
}
