//! Query (find/`$match`) operators
//!
//! Each operator compiles `(field, operand)` into a predicate that resolves
//! `field` against the tested document when called. Comparison operators
//! match when the resolved value, or any element of a resolved array,
//! satisfies them; `$size`, `$all` and `$elemMatch` look at the array itself.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::mql::error::{MqlError, Result};
use crate::mql::query::{compile_operators, Query};
use crate::mql::registry::{Operator, Predicate};
use crate::mql::value::{self, BsonType};
use crate::mql::Engine;

/// Comparison kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    vec![
        ("$eq", Operator::query(|f, v, e| comparison(f, v, e, Cmp::Eq))),
        ("$ne", Operator::query(|f, v, e| negate(comparison(f, v, e, Cmp::Eq)?))),
        ("$gt", Operator::query(|f, v, e| comparison(f, v, e, Cmp::Gt))),
        ("$gte", Operator::query(|f, v, e| comparison(f, v, e, Cmp::Gte))),
        ("$lt", Operator::query(|f, v, e| comparison(f, v, e, Cmp::Lt))),
        ("$lte", Operator::query(|f, v, e| comparison(f, v, e, Cmp::Lte))),
        ("$in", Operator::query(|f, v, _| membership(f, v))),
        ("$nin", Operator::query(|f, v, _| negate(membership(f, v)?))),
        ("$exists", Operator::query(|f, v, _| exists(f, v))),
        ("$type", Operator::query(|f, v, _| type_check(f, v))),
        ("$regex", Operator::query(|f, v, _| regex_match(f, v))),
        ("$options", Operator::query(|_, _, _| {
            Err(MqlError::InvalidQuery("$options needs a $regex".into()))
        })),
        ("$mod", Operator::query(|f, v, _| modulo(f, v))),
        ("$all", Operator::query(all)),
        ("$elemMatch", Operator::query(elem_match)),
        ("$size", Operator::query(|f, v, _| size(f, v))),
        ("$not", Operator::query(not)),
    ]
}

/// Resolve `field` against `doc`; the empty field is the value itself
fn lookup(doc: &Value, field: &str) -> Option<Value> {
    if field.is_empty() {
        Some(doc.clone())
    } else {
        value::resolve(doc, field)
    }
}

/// The value itself followed by its elements when it is an array
fn candidates(value: &Value) -> impl Iterator<Item = &Value> {
    let elements = match value {
        Value::Array(items) => items.as_slice(),
        _ => &[],
    };
    std::iter::once(value).chain(elements.iter())
}

fn negate(predicate: Predicate) -> Result<Predicate> {
    Ok(Box::new(move |doc, ctx| Ok(!predicate(doc, ctx)?)))
}

fn comparison(field: &str, operand: &Value, engine: &Engine, cmp: Cmp) -> Result<Predicate> {
    if cmp == Cmp::Eq && value::is_regex(operand) {
        return regex_match(field, operand);
    }
    let field = field.to_string();
    let operand = operand.clone();
    let collation = engine.options().collation.clone();

    Ok(Box::new(move |doc, _| {
        Ok(match lookup(doc, &field) {
            None => operand.is_null() && matches!(cmp, Cmp::Eq | Cmp::Gte | Cmp::Lte),
            Some(resolved) => candidates(&resolved)
                .any(|candidate| compares(candidate, &operand, cmp, collation.as_ref())),
        })
    }))
}

fn compares(
    value: &Value,
    operand: &Value,
    cmp: Cmp,
    collation: Option<&crate::mql::options::Collation>,
) -> bool {
    let (tv, to) = (value::type_of(value), value::type_of(operand));
    // Ordering operators only compare within one type class
    let same_class = tv == to || (tv.is_number() && to.is_number());
    if !same_class {
        return false;
    }
    let ord = value::compare(value, operand, collation);
    match cmp {
        Cmp::Eq => ord == Ordering::Equal,
        Cmp::Gt => ord == Ordering::Greater,
        Cmp::Gte => ord != Ordering::Less,
        Cmp::Lt => ord == Ordering::Less,
        Cmp::Lte => ord != Ordering::Greater,
    }
}

enum Member {
    Value(Value),
    Pattern(Regex),
}

fn membership(field: &str, operand: &Value) -> Result<Predicate> {
    let items = operand
        .as_array()
        .ok_or_else(|| MqlError::InvalidQuery("$in/$nin needs an array".into()))?;
    let members: Vec<Member> = items
        .iter()
        .map(|item| {
            if value::is_regex(item) {
                compile_regex(item).map(Member::Pattern)
            } else {
                Ok(Member::Value(item.clone()))
            }
        })
        .collect::<Result<_>>()?;
    let has_null = items.iter().any(Value::is_null);
    let field = field.to_string();

    Ok(Box::new(move |doc, _| {
        let Some(resolved) = lookup(doc, &field) else {
            return Ok(has_null);
        };
        let hit = candidates(&resolved).any(|candidate| {
            members.iter().any(|member| match member {
                Member::Value(v) => value::equals(candidate, v),
                Member::Pattern(re) => candidate.as_str().is_some_and(|s| re.is_match(s)),
            })
        });
        Ok(hit)
    }))
}

fn exists(field: &str, operand: &Value) -> Result<Predicate> {
    let wanted = value::truthy(operand);
    let field = field.to_string();
    Ok(Box::new(move |doc, _| Ok(lookup(doc, &field).is_some() == wanted)))
}

#[derive(Debug, Clone, Copy)]
enum TypeMatch {
    Exact(BsonType),
    Number,
}

impl TypeMatch {
    fn parse(operand: &Value) -> Result<Self> {
        let parsed = match operand {
            Value::String(s) if s == "number" => Some(Self::Number),
            Value::String(s) => BsonType::from_name(s).map(Self::Exact),
            Value::Number(n) => n.as_i64().and_then(BsonType::from_code).map(Self::Exact),
            _ => None,
        };
        parsed.ok_or_else(|| MqlError::InvalidQuery(format!("unknown $type: {}", operand)))
    }

    fn matches(&self, value: &Value) -> bool {
        let actual = value::type_of(value);
        match self {
            Self::Number => actual.is_number(),
            Self::Exact(BsonType::Double) => actual.is_number() && value.is_f64(),
            Self::Exact(expected) => actual == *expected,
        }
    }
}

fn type_check(field: &str, operand: &Value) -> Result<Predicate> {
    let wanted: Vec<TypeMatch> = match operand {
        Value::Array(items) => items.iter().map(TypeMatch::parse).collect::<Result<_>>()?,
        other => vec![TypeMatch::parse(other)?],
    };
    let field = field.to_string();
    Ok(Box::new(move |doc, _| {
        let Some(resolved) = lookup(doc, &field) else {
            return Ok(false);
        };
        let hit = candidates(&resolved).any(|c| wanted.iter().any(|t| t.matches(c)));
        Ok(hit)
    }))
}

/// Build a regex from a pattern string or a `{"$regex", "$options"}` value
pub(crate) fn compile_regex(operand: &Value) -> Result<Regex> {
    let (pattern, options) = match operand {
        Value::String(s) => (s.as_str(), ""),
        Value::Object(map) => (
            map.get("$regex").and_then(Value::as_str).unwrap_or_default(),
            map.get("$options").and_then(Value::as_str).unwrap_or_default(),
        ),
        _ => {
            return Err(MqlError::InvalidQuery(
                "$regex needs a string pattern".into(),
            ))
        }
    };
    build_regex(pattern, options)
}

/// Build a regex honouring the `i`, `m`, `s` and `x` flags
pub(crate) fn build_regex(pattern: &str, options: &str) -> Result<Regex> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => {
                return Err(MqlError::InvalidQuery(format!(
                    "invalid regex option: {}",
                    other
                )))
            }
        };
    }
    builder
        .build()
        .map_err(|e| MqlError::InvalidQuery(format!("invalid regex '{}': {}", pattern, e)))
}

fn regex_match(field: &str, operand: &Value) -> Result<Predicate> {
    let re = compile_regex(operand)?;
    let field = field.to_string();
    Ok(Box::new(move |doc, _| {
        Ok(lookup(doc, &field).is_some_and(|resolved| {
            candidates(&resolved).any(|c| c.as_str().is_some_and(|s| re.is_match(s)))
        }))
    }))
}

fn modulo(field: &str, operand: &Value) -> Result<Predicate> {
    let parts = operand
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| MqlError::InvalidQuery("$mod needs [divisor, remainder]".into()))?;
    let (divisor, remainder) = match (value::as_f64(&parts[0]), value::as_f64(&parts[1])) {
        (Some(d), Some(r)) => (d.trunc(), r.trunc()),
        _ => return Err(MqlError::InvalidQuery("$mod arguments must be numbers".into())),
    };
    if divisor == 0.0 {
        return Err(MqlError::InvalidQuery("$mod divisor cannot be 0".into()));
    }
    let field = field.to_string();
    Ok(Box::new(move |doc, _| {
        Ok(lookup(doc, &field).is_some_and(|resolved| {
            candidates(&resolved).any(|c| {
                value::as_f64(c).is_some_and(|n| n.trunc() % divisor == remainder)
            })
        }))
    }))
}

fn all(field: &str, operand: &Value, engine: &Engine) -> Result<Predicate> {
    let items = operand
        .as_array()
        .ok_or_else(|| MqlError::InvalidQuery("$all needs an array".into()))?;
    if items.is_empty() {
        return Ok(Box::new(|_, _| Ok(false)));
    }

    let mut checks: Vec<Predicate> = Vec::with_capacity(items.len());
    for item in items {
        match item.as_object().and_then(|m| m.get("$elemMatch")) {
            Some(inner) => checks.push(elem_match(field, inner, engine)?),
            None => {
                let field = field.to_string();
                let wanted = item.clone();
                checks.push(Box::new(move |doc, _| {
                    Ok(lookup(doc, &field).is_some_and(|resolved| {
                        candidates(&resolved).any(|c| value::equals(c, &wanted))
                    }))
                }));
            }
        }
    }
    Ok(Box::new(move |doc, ctx| {
        for check in &checks {
            if !check(doc, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }))
}

fn elem_match(field: &str, operand: &Value, engine: &Engine) -> Result<Predicate> {
    let map = operand
        .as_object()
        .ok_or_else(|| MqlError::InvalidQuery("$elemMatch needs an object".into()))?;

    enum Matcher {
        Operators(Vec<Predicate>),
        Query(Query),
    }

    let operator_form = !map.is_empty()
        && map.keys().all(|k| k.starts_with('$'))
        && !map.keys().any(|k| matches!(k.as_str(), "$and" | "$or" | "$nor" | "$expr"));
    let matcher = if operator_form {
        Matcher::Operators(compile_operators("", map, engine)?)
    } else {
        Matcher::Query(Query::new(operand, engine)?)
    };
    let field = field.to_string();

    Ok(Box::new(move |doc, ctx| {
        let Some(Value::Array(items)) = lookup(doc, &field) else {
            return Ok(false);
        };
        for item in &items {
            let matched = match &matcher {
                Matcher::Operators(predicates) => {
                    let mut ok = true;
                    for p in predicates {
                        if !p(item, ctx)? {
                            ok = false;
                            break;
                        }
                    }
                    ok
                }
                Matcher::Query(query) => {
                    item.is_object() && query.test_with(item, &ctx.with_root(item))?
                }
            };
            if matched {
                return Ok(true);
            }
        }
        Ok(false)
    }))
}

fn size(field: &str, operand: &Value) -> Result<Predicate> {
    let wanted = operand
        .as_u64()
        .ok_or_else(|| MqlError::InvalidQuery("$size needs a non-negative integer".into()))?
        as usize;
    let field = field.to_string();
    Ok(Box::new(move |doc, _| {
        Ok(matches!(lookup(doc, &field), Some(Value::Array(items)) if items.len() == wanted))
    }))
}

fn not(field: &str, operand: &Value, engine: &Engine) -> Result<Predicate> {
    if value::is_regex(operand) || operand.is_string() {
        return negate(regex_match(field, operand)?);
    }
    let map = operand
        .as_object()
        .filter(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
        .ok_or_else(|| MqlError::InvalidQuery("$not needs a regex or an operator document".into()))?;
    let predicates = compile_operators(field, map, engine)?;
    Ok(Box::new(move |doc, ctx| {
        for p in &predicates {
            if !p(doc, ctx)? {
                return Ok(true);
            }
        }
        Ok(false)
    }))
}
