//! Field projection shared by `find` and `$project`
//!
//! A specification is compiled into a tree of field rules. Inclusion mode
//! builds a new document in specification order; exclusion mode copies the
//! document and removes fields. The identifier field is included unless the
//! specification says otherwise and never decides the mode. Projection
//! operators (`$slice`, `$elemMatch`) apply in either mode.

use serde_json::{Map, Value};

use super::context::Context;
use super::error::{MqlError, Result};
use super::expression::{evaluate_partial, Expr};
use super::query::Query;
use super::registry::{Operator, Projector, Registry};
use super::value;
use super::Engine;

/// Register the built-in projection operators
pub fn register(registry: &mut Registry) {
    registry.register_all(vec![
        ("$slice", Operator::projection(slice)),
        ("$elemMatch", Operator::projection(elem_match)),
    ]);
}

enum Rule {
    Include,
    Exclude,
    Compute(Expr),
    Operator(Projector),
    Nested(Vec<(String, Rule)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Inclusion,
    Exclusion,
}

/// Compiled projection
pub struct Projection {
    mode: Mode,
    id_key: String,
    id: Rule,
    rules: Vec<(String, Rule)>,
}

impl Projection {
    /// Compile a projection specification
    pub fn new(spec: &Value, engine: &Engine) -> Result<Self> {
        let map = spec
            .as_object()
            .ok_or_else(|| MqlError::InvalidProjection("projection must be an object".into()))?;
        let id_key = engine.options().id_key.clone();

        let mut id = Rule::Include;
        let mut id_listed = false;
        let mut rules = Vec::new();
        for (key, val) in map {
            if *key == id_key {
                id = compile_rule(key, val, engine)?;
                id_listed = matches!(id, Rule::Include | Rule::Compute(_));
            } else {
                compile_into(&mut rules, &[], key, val, engine)?;
            }
        }

        let (includes, excludes) = census(&rules);
        if includes && excludes {
            return Err(MqlError::InvalidProjection(
                "cannot mix inclusion and exclusion in one projection".into(),
            ));
        }
        // An id listed on its own still selects inclusion
        let mode = if includes || (!excludes && id_listed) {
            Mode::Inclusion
        } else {
            Mode::Exclusion
        };

        Ok(Self {
            mode,
            id_key,
            id,
            rules,
        })
    }

    /// True when the projection lists the fields to keep
    pub fn is_inclusion(&self) -> bool {
        self.mode == Mode::Inclusion
    }

    /// Project one document
    pub fn apply(&self, doc: &Value, ctx: &Context<'_>) -> Result<Value> {
        let Value::Object(obj) = doc else {
            return Ok(doc.clone());
        };

        let mut out = match self.mode {
            Mode::Inclusion => {
                let mut out = Map::new();
                if let (Rule::Include, Some(id)) = (&self.id, obj.get(&self.id_key)) {
                    out.insert(self.id_key.clone(), id.clone());
                }
                include_level(doc, obj, &self.rules, ctx, &mut out)?;
                out
            }
            Mode::Exclusion => exclude_level(doc, obj, &self.rules, ctx)?,
        };

        match &self.id {
            Rule::Exclude => {
                out.shift_remove(&self.id_key);
            }
            Rule::Compute(expr) => {
                let computed = evaluate_partial(doc, expr, ctx)?;
                let mut reordered = Map::new();
                if let Some(v) = computed {
                    reordered.insert(self.id_key.clone(), v);
                }
                out.shift_remove(&self.id_key);
                reordered.extend(out);
                out = reordered;
            }
            _ => {}
        }
        Ok(Value::Object(out))
    }
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("mode", &self.mode)
            .field("fields", &self.rules.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

fn compile_rule(key: &str, val: &Value, engine: &Engine) -> Result<Rule> {
    match val {
        Value::Bool(b) => Ok(if *b { Rule::Include } else { Rule::Exclude }),
        Value::Number(_) => Ok(if value::truthy(val) {
            Rule::Include
        } else {
            Rule::Exclude
        }),
        Value::Object(map) if map.is_empty() => Err(MqlError::InvalidProjection(format!(
            "an empty object is not a valid value for '{}'",
            key
        ))),
        Value::Object(map) if map.len() == 1 && !value::is_date(val) && !value::is_regex(val) => {
            let (name, operand) = match map.iter().next() {
                Some(entry) => entry,
                None => return Err(MqlError::InvalidProjection("empty projection operator".into())),
            };
            match engine.registry().projection(name) {
                Some(op) => {
                    let leaf = key.rsplit('.').next().unwrap_or(key);
                    Ok(Rule::Operator(op(leaf, operand, engine)?))
                }
                None => Ok(Rule::Compute(Expr::compile(val, engine)?)),
            }
        }
        _ => Ok(Rule::Compute(Expr::compile(val, engine)?)),
    }
}

fn compile_into(
    rules: &mut Vec<(String, Rule)>,
    prefix: &[&str],
    key: &str,
    val: &Value,
    engine: &Engine,
) -> Result<()> {
    if key.is_empty() || key.starts_with('$') {
        return Err(MqlError::InvalidProjection(format!(
            "'{}' is not a valid field name",
            key
        )));
    }
    let mut segments: Vec<&str> = prefix.to_vec();
    segments.extend(key.split('.'));

    if let Value::Object(map) = val {
        let plain = !map.is_empty() && !map.keys().any(|k| k.starts_with('$'));
        if plain {
            for (sub_key, sub_val) in map {
                compile_into(rules, &segments, sub_key, sub_val, engine)?;
            }
            return Ok(());
        }
    }

    let path = segments.join(".");
    let rule = compile_rule(&path, val, engine)?;
    insert_rule(rules, &segments, rule, &path)
}

fn insert_rule(rules: &mut Vec<(String, Rule)>, segments: &[&str], rule: Rule, path: &str) -> Result<()> {
    let collision = || MqlError::InvalidProjection(format!("path collision at '{}'", path));
    let Some((head, rest)) = segments.split_first() else {
        return Err(collision());
    };

    let existing = rules.iter_mut().find(|(k, _)| k == head);
    match (existing, rest.is_empty()) {
        (Some(_), true) => Err(collision()),
        (Some((_, Rule::Nested(children))), false) => insert_rule(children, rest, rule, path),
        (Some(_), false) => Err(collision()),
        (None, true) => {
            rules.push((head.to_string(), rule));
            Ok(())
        }
        (None, false) => {
            let mut children = Vec::new();
            insert_rule(&mut children, rest, rule, path)?;
            rules.push((head.to_string(), Rule::Nested(children)));
            Ok(())
        }
    }
}

/// (has inclusions or computed fields, has exclusions)
fn census(rules: &[(String, Rule)]) -> (bool, bool) {
    rules.iter().fold((false, false), |(inc, exc), (_, rule)| match rule {
        Rule::Include | Rule::Compute(_) => (true, exc),
        Rule::Exclude => (inc, true),
        Rule::Operator(_) => (inc, exc),
        Rule::Nested(children) => {
            let (i, e) = census(children);
            (inc || i, exc || e)
        }
    })
}

fn has_computed(rules: &[(String, Rule)]) -> bool {
    rules.iter().any(|(_, rule)| match rule {
        Rule::Compute(_) => true,
        Rule::Nested(children) => has_computed(children),
        _ => false,
    })
}

fn include_level(
    root: &Value,
    level: &Map<String, Value>,
    rules: &[(String, Rule)],
    ctx: &Context<'_>,
    out: &mut Map<String, Value>,
) -> Result<()> {
    let level_doc = Value::Object(level.clone());
    for (key, rule) in rules {
        match rule {
            Rule::Include => {
                if let Some(v) = level.get(key) {
                    out.insert(key.clone(), v.clone());
                }
            }
            Rule::Exclude => {}
            Rule::Compute(expr) => {
                if let Some(v) = evaluate_partial(root, expr, ctx)? {
                    out.insert(key.clone(), v);
                }
            }
            Rule::Operator(projector) => {
                if let Some(v) = projector(&level_doc, ctx)? {
                    out.insert(key.clone(), v);
                }
            }
            Rule::Nested(children) => match level.get(key) {
                Some(Value::Object(child)) => {
                    let mut sub = Map::new();
                    include_level(root, child, children, ctx, &mut sub)?;
                    out.insert(key.clone(), Value::Object(sub));
                }
                Some(Value::Array(items)) => {
                    let mut projected = Vec::with_capacity(items.len());
                    for item in items {
                        if let Value::Object(child) = item {
                            let mut sub = Map::new();
                            include_level(root, child, children, ctx, &mut sub)?;
                            projected.push(Value::Object(sub));
                        }
                    }
                    out.insert(key.clone(), Value::Array(projected));
                }
                _ if has_computed(children) => {
                    let mut sub = Map::new();
                    include_level(root, &Map::new(), children, ctx, &mut sub)?;
                    out.insert(key.clone(), Value::Object(sub));
                }
                _ => {}
            },
        }
    }
    Ok(())
}

fn exclude_level(
    root: &Value,
    level: &Map<String, Value>,
    rules: &[(String, Rule)],
    ctx: &Context<'_>,
) -> Result<Map<String, Value>> {
    let level_doc = Value::Object(level.clone());
    let mut out = level.clone();
    for (key, rule) in rules {
        match rule {
            Rule::Exclude => {
                out.shift_remove(key);
            }
            Rule::Operator(projector) => match projector(&level_doc, ctx)? {
                Some(v) => {
                    out.insert(key.clone(), v);
                }
                None => {
                    out.shift_remove(key);
                }
            },
            Rule::Nested(children) => {
                let replaced = match level.get(key) {
                    Some(Value::Object(child)) => {
                        Some(Value::Object(exclude_level(root, child, children, ctx)?))
                    }
                    Some(Value::Array(items)) => {
                        let mut projected = Vec::with_capacity(items.len());
                        for item in items {
                            projected.push(match item {
                                Value::Object(child) => {
                                    Value::Object(exclude_level(root, child, children, ctx)?)
                                }
                                other => other.clone(),
                            });
                        }
                        Some(Value::Array(projected))
                    }
                    _ => None,
                };
                if let Some(v) = replaced {
                    out.insert(key.clone(), v);
                }
            }
            Rule::Include | Rule::Compute(_) => {}
        }
    }
    Ok(out)
}

/// `{field: {$slice: n}}` or `{field: {$slice: [skip, n]}}`
fn slice(field: &str, operand: &Value, _engine: &Engine) -> Result<Projector> {
    let invalid = || {
        MqlError::InvalidProjection(format!(
            "$slice on '{}' takes a count or a [skip, limit] pair",
            field
        ))
    };
    let as_int = |v: &Value| v.as_i64().or_else(|| value::as_f64(v).filter(|f| f.fract() == 0.0).map(|f| f as i64));

    let (skip, limit) = match operand {
        Value::Number(_) => (None, as_int(operand).ok_or_else(invalid)?),
        Value::Array(pair) if pair.len() == 2 => {
            let skip = as_int(&pair[0]).ok_or_else(invalid)?;
            let limit = as_int(&pair[1]).filter(|n| *n > 0).ok_or_else(invalid)?;
            (Some(skip), limit)
        }
        _ => return Err(invalid()),
    };

    let field = field.to_string();
    Ok(Box::new(move |doc, _| {
        let Some(current) = doc.get(&field) else {
            return Ok(None);
        };
        let Value::Array(items) = current else {
            return Ok(Some(current.clone()));
        };
        let len = items.len() as i64;
        let (start, count) = match skip {
            None if limit >= 0 => (0, limit),
            None => ((len + limit).max(0), -limit),
            Some(s) if s >= 0 => (s.min(len), limit),
            Some(s) => ((len + s).max(0), limit),
        };
        let sliced: Vec<Value> = items
            .iter()
            .skip(start as usize)
            .take(count as usize)
            .cloned()
            .collect();
        Ok(Some(Value::Array(sliced)))
    }))
}

/// `{field: {$elemMatch: <query>}}` keeps the first matching element
fn elem_match(field: &str, operand: &Value, engine: &Engine) -> Result<Projector> {
    let query = Query::new(operand, engine)?;
    let field = field.to_string();
    Ok(Box::new(move |doc, _| {
        let Some(Value::Array(items)) = doc.get(&field) else {
            return Ok(None);
        };
        for item in items {
            if query.test(item)? {
                return Ok(Some(Value::Array(vec![item.clone()])));
            }
        }
        Ok(None)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mql::options::Options;
    use serde_json::json;

    fn project(doc: Value, spec: Value) -> Result<Value> {
        let engine = Engine::default();
        let projection = Projection::new(&spec, &engine)?;
        projection.apply(&doc, &Context::new(&engine, &doc))
    }

    fn doc() -> Value {
        json!({
            "_id": 1,
            "name": "ada",
            "address": { "city": "London", "zip": "N1" },
            "tags": ["a", "b", "c", "d"],
            "scores": [{ "s": 3 }, { "s": 9 }]
        })
    }

    #[test]
    fn test_inclusion_keeps_id_and_spec_order() {
        let out = project(doc(), json!({ "tags": 1, "name": 1 })).unwrap();
        assert_eq!(out, json!({ "_id": 1, "tags": ["a", "b", "c", "d"], "name": "ada" }));
        let keys: Vec<&String> = out.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["_id", "tags", "name"]);
    }

    #[test]
    fn test_exclusion() {
        let out = project(doc(), json!({ "tags": 0, "scores": 0, "address.zip": 0 })).unwrap();
        assert_eq!(out, json!({ "_id": 1, "name": "ada", "address": { "city": "London" } }));
    }

    #[test]
    fn test_nested_and_dotted_inclusion() {
        let out = project(doc(), json!({ "_id": 0, "address": { "city": 1 }, "scores.s": 1 })).unwrap();
        assert_eq!(
            out,
            json!({ "address": { "city": "London" }, "scores": [{ "s": 3 }, { "s": 9 }] })
        );
    }

    #[test]
    fn test_computed_fields() {
        let out = project(
            doc(),
            json!({ "_id": "$name", "city": "$address.city", "n": { "$size": "$tags" } }),
        )
        .unwrap();
        assert_eq!(out, json!({ "_id": "ada", "city": "London", "n": 4 }));
    }

    #[test]
    fn test_mixing_fails() {
        let err = project(doc(), json!({ "name": 1, "tags": 0 })).unwrap_err();
        assert!(matches!(err, MqlError::InvalidProjection(_)));
        assert!(project(doc(), json!({ "name": 1, "_id": 0 })).is_ok());
        assert!(project(doc(), json!({ "a": 1, "a.b": 1 })).is_err());
    }

    #[test]
    fn test_slice_and_elem_match() {
        let out = project(doc(), json!({ "tags": { "$slice": 2 } })).unwrap();
        assert_eq!(out["tags"], json!(["a", "b"]));
        assert_eq!(out["name"], json!("ada"));

        let out = project(doc(), json!({ "tags": { "$slice": -1 } })).unwrap();
        assert_eq!(out["tags"], json!(["d"]));

        let out = project(doc(), json!({ "tags": { "$slice": [1, 2] } })).unwrap();
        assert_eq!(out["tags"], json!(["b", "c"]));

        let out = project(doc(), json!({ "name": 1, "scores": { "$elemMatch": { "s": { "$gt": 5 } } } }))
            .unwrap();
        assert_eq!(out, json!({ "_id": 1, "name": "ada", "scores": [{ "s": 9 }] }));
    }

    #[test]
    fn test_custom_id_key() {
        let engine = Engine::new(Options::default().with_id_key("id"));
        let doc = json!({ "id": 7, "_id": 1, "v": 2 });
        let projection = Projection::new(&json!({ "v": 1 }), &engine).unwrap();
        let out = projection.apply(&doc, &Context::new(&engine, &doc)).unwrap();
        assert_eq!(out, json!({ "id": 7, "v": 2 }));

        let projection = Projection::new(&json!({ "id": 1 }), &engine).unwrap();
        assert!(projection.is_inclusion());
        let out = projection.apply(&doc, &Context::new(&engine, &doc)).unwrap();
        assert_eq!(out, json!({ "id": 7 }));
    }

    #[test]
    fn test_id_only_inclusion() {
        assert_eq!(project(doc(), json!({ "_id": 1 })).unwrap(), json!({ "_id": 1 }));
        assert_eq!(project(doc(), json!({ "_id": true })).unwrap(), json!({ "_id": 1 }));

        // Excluding another field keeps exclusion mode
        let out = project(doc(), json!({ "_id": 1, "tags": 0, "scores": 0, "address": 0 })).unwrap();
        assert_eq!(out, json!({ "_id": 1, "name": "ada" }));
    }
}
