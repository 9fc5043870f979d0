//! `$sort`
//!
//! Multi-key ordering is built from single-key regrouping: for each key from
//! the last declared to the first, members are grouped by that key's value,
//! the distinct groups are ordered, and the groups are flattened back in
//! order. Each pass keeps the previous order within a group, so ties keep
//! their input order.

use std::collections::HashMap;

use serde_json::Value;
use tracing::trace;

use crate::mql::error::{MqlError, Result};
use crate::mql::lazy::Lazy;
use crate::mql::options::Options;
use crate::mql::registry::Operator;
use crate::mql::value;

use super::StageEnv;

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    vec![("$sort", Operator::pipeline(sort_stage))]
}

/// One key of a sort specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Dotted field path
    pub path: String,
    /// True for `-1`
    pub descending: bool,
}

impl SortKey {
    /// Parse `{field: 1 | -1, ...}`
    pub fn parse(context: &str, spec: &Value) -> Result<Vec<SortKey>> {
        let obj = spec
            .as_object()
            .filter(|o| !o.is_empty())
            .ok_or_else(|| {
                MqlError::InvalidStage(format!("{} sort specification must be a non-empty object", context))
            })?;

        obj.iter()
            .map(|(path, direction)| {
                let descending = match value::as_f64(direction) {
                    Some(d) if d == 1.0 => false,
                    Some(d) if d == -1.0 => true,
                    _ => {
                        return Err(MqlError::InvalidStage(format!(
                            "{}: sort direction for '{}' must be 1 or -1",
                            context, path
                        )))
                    }
                };
                Ok(SortKey {
                    path: path.clone(),
                    descending,
                })
            })
            .collect()
    }

    /// Value this key sorts `doc` by. Arrays sort by their smallest element
    /// ascending and their largest descending.
    pub fn key_of(&self, doc: &Value, options: &Options) -> Value {
        match value::resolve(doc, &self.path) {
            None => Value::Null,
            Some(Value::Array(items)) => {
                let pick = items.into_iter().reduce(|best, v| {
                    let ord = options.compare(&v, &best);
                    if (self.descending && ord.is_gt()) || (!self.descending && ord.is_lt()) {
                        v
                    } else {
                        best
                    }
                });
                pick.unwrap_or(Value::Null)
            }
            Some(v) => v,
        }
    }
}

/// Grouping key; strings that compare equal under a case-insensitive
/// collation share a group
fn group_key(v: &Value, options: &Options) -> String {
    match (v, &options.collation) {
        (Value::String(s), Some(c)) if c.strength <= 2 => {
            value::encode_key(&Value::String(s.to_lowercase()))
        }
        _ => value::encode_key(v),
    }
}

/// Stable sort of `docs` by `keys`
pub fn sort_documents(docs: Vec<Value>, keys: &[SortKey], options: &Options) -> Vec<Value> {
    let mut docs = docs;
    for key in keys.iter().rev() {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();

        for doc in docs {
            let k = key.key_of(&doc, options);
            let hashed = group_key(&k, options);
            match index.get(&hashed) {
                Some(&i) => groups[i].1.push(doc),
                None => {
                    index.insert(hashed, groups.len());
                    groups.push((k, vec![doc]));
                }
            }
        }

        groups.sort_by(|a, b| options.compare(&a.0, &b.0));
        if key.descending {
            groups.reverse();
        }
        docs = groups.into_iter().flat_map(|(_, members)| members).collect();
    }
    docs
}

fn sort_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let keys = SortKey::parse("$sort", arg)?;
    let engine = env.engine().clone();
    Ok(lazy.transform(move |docs| {
        trace!(documents = docs.len(), keys = keys.len(), "$sort");
        Ok(sort_documents(docs, &keys, engine.options()))
    }))
}
