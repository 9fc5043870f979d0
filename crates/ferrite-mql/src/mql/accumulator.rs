//! Accumulators shared by `$group`, `$bucket`, `$bucketAuto` and window
//! frames
//!
//! Every accumulator receives the member documents of one group and its
//! compiled argument. [`project_members`] maps members through the evaluator
//! and is what the reducing accumulators are built on.

use std::collections::HashSet;

use serde_json::{Map, Value};

use super::context::Context;
use super::error::{MqlError, Result};
use super::expression::{evaluate, evaluate_partial, Expr, OperatorKind};
use super::operators::evaluate_args;
use super::registry::{Operator, Registry};
use super::stages::sort::{sort_documents, SortKey};
use super::value;

/// Register the built-in accumulators
pub fn register(registry: &mut Registry) {
    registry.register_all(vec![
        ("$sum", Operator::accumulator(sum)),
        ("$avg", Operator::accumulator(avg)),
        ("$min", Operator::accumulator(|m, a, c| extreme(m, a, c, false))),
        ("$max", Operator::accumulator(|m, a, c| extreme(m, a, c, true))),
        ("$stdDevPop", Operator::accumulator(|m, a, c| std_dev(m, a, c, false))),
        ("$stdDevSamp", Operator::accumulator(|m, a, c| std_dev(m, a, c, true))),
        ("$push", Operator::accumulator(|m, a, c| Ok(Value::Array(project_members(m, a, c)?)))),
        ("$addToSet", Operator::accumulator(add_to_set)),
        ("$first", Operator::accumulator(|m, a, c| boundary(m.first(), a, c))),
        ("$last", Operator::accumulator(|m, a, c| boundary(m.last(), a, c))),
        ("$count", Operator::accumulator(|m, _, _| Ok(Value::from(m.len())))),
        ("$mergeObjects", Operator::accumulator(merge_objects)),
        ("$firstN", Operator::accumulator(|m, a, c| edge_n("$firstN", m, a, c, false))),
        ("$lastN", Operator::accumulator(|m, a, c| edge_n("$lastN", m, a, c, true))),
        ("$minN", Operator::accumulator(|m, a, c| extreme_n("$minN", m, a, c, false))),
        ("$maxN", Operator::accumulator(|m, a, c| extreme_n("$maxN", m, a, c, true))),
        ("$topN", Operator::accumulator(|m, a, c| ranked("$topN", m, a, c, false, true))),
        ("$bottomN", Operator::accumulator(|m, a, c| ranked("$bottomN", m, a, c, true, true))),
        ("$top", Operator::accumulator(|m, a, c| ranked("$top", m, a, c, false, false))),
        ("$bottom", Operator::accumulator(|m, a, c| ranked("$bottom", m, a, c, true, false))),
        ("$median", Operator::accumulator(median)),
        ("$percentile", Operator::accumulator(percentile)),
        ("$accumulator", Operator::accumulator(custom)),
    ]);
}

/// Apply a compiled `{<accumulator>: args}` expression to `members`
pub fn accumulate(members: &[Value], expr: &Expr, ctx: &Context<'_>) -> Result<Value> {
    match expr {
        Expr::Operator {
            kind: OperatorKind::Accumulator(f),
            args,
            ..
        } => f(members, args, ctx),
        other => Err(MqlError::InvalidStage(format!(
            "expected an accumulator, found {:?}",
            other
        ))),
    }
}

/// Evaluate `expr` against every member, dropping absent results
pub fn project_members(members: &[Value], expr: &Expr, ctx: &Context<'_>) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(members.len());
    for member in members {
        if let Some(v) = evaluate_partial(member, expr, &ctx.with_root(member))? {
            out.push(v);
        }
    }
    Ok(out)
}

fn numeric(values: &[Value]) -> Vec<f64> {
    values.iter().filter_map(value::as_f64).collect()
}

fn sum(members: &[Value], args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let total: f64 = numeric(&project_members(members, args, ctx)?).iter().sum();
    Ok(value::number(total))
}

fn avg(members: &[Value], args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let nums = numeric(&project_members(members, args, ctx)?);
    if nums.is_empty() {
        return Ok(Value::Null);
    }
    Ok(value::number(nums.iter().sum::<f64>() / nums.len() as f64))
}

fn extreme(members: &[Value], args: &Expr, ctx: &Context<'_>, max: bool) -> Result<Value> {
    let options = ctx.options();
    let best = project_members(members, args, ctx)?
        .into_iter()
        .filter(|v| !v.is_null())
        .reduce(|best, v| {
            let ord = options.compare(&v, &best);
            if (max && ord.is_gt()) || (!max && ord.is_lt()) {
                v
            } else {
                best
            }
        });
    Ok(best.unwrap_or(Value::Null))
}

fn std_dev(members: &[Value], args: &Expr, ctx: &Context<'_>, sample: bool) -> Result<Value> {
    let nums = numeric(&project_members(members, args, ctx)?);
    let n = nums.len();
    if n == 0 || (sample && n < 2) {
        return Ok(Value::Null);
    }
    let mean = nums.iter().sum::<f64>() / n as f64;
    let squares: f64 = nums.iter().map(|x| (x - mean).powi(2)).sum();
    let divisor = if sample { n - 1 } else { n } as f64;
    Ok(value::number((squares / divisor).sqrt()))
}

fn add_to_set(members: &[Value], args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let mut seen = HashSet::new();
    let unique: Vec<Value> = project_members(members, args, ctx)?
        .into_iter()
        .filter(|v| seen.insert(value::encode_key(v)))
        .collect();
    Ok(Value::Array(unique))
}

fn boundary(member: Option<&Value>, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    match member {
        Some(m) => evaluate(m, args, &ctx.with_root(m)),
        None => Ok(Value::Null),
    }
}

fn merge_objects(members: &[Value], args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let mut merged = Map::new();
    for v in project_members(members, args, ctx)? {
        match v {
            Value::Object(map) => merged.extend(map),
            Value::Null => {}
            other => {
                return Err(MqlError::Type(format!(
                    "$mergeObjects requires object inputs, found {}",
                    value::type_of(&other).name()
                )))
            }
        }
    }
    Ok(Value::Object(merged))
}

/// Resolve `n` once for the group
fn resolve_n(name: &str, args: &Expr, ctx: &Context<'_>) -> Result<usize> {
    let n_expr = args
        .get("n")
        .ok_or_else(|| MqlError::InvalidExpression(format!("{} requires 'n'", name)))?;
    let n = evaluate(ctx.root(), n_expr, ctx)?;
    value::as_f64(&n)
        .filter(|f| *f >= 1.0 && f.fract() == 0.0)
        .map(|f| f as usize)
        .ok_or_else(|| {
            MqlError::InvalidExpression(format!("{} 'n' must be a positive integer, found {}", name, n))
        })
}

fn input_expr<'e>(name: &str, args: &'e Expr) -> Result<&'e Expr> {
    args.get("input")
        .ok_or_else(|| MqlError::InvalidExpression(format!("{} requires 'input'", name)))
}

fn edge_n(name: &str, members: &[Value], args: &Expr, ctx: &Context<'_>, last: bool) -> Result<Value> {
    let n = resolve_n(name, args, ctx)?;
    let input = input_expr(name, args)?;
    let window = if last {
        &members[members.len().saturating_sub(n)..]
    } else {
        &members[..n.min(members.len())]
    };
    let mut out = Vec::with_capacity(window.len());
    for m in window {
        out.push(evaluate(m, input, &ctx.with_root(m))?);
    }
    Ok(Value::Array(out))
}

fn extreme_n(name: &str, members: &[Value], args: &Expr, ctx: &Context<'_>, max: bool) -> Result<Value> {
    let n = resolve_n(name, args, ctx)?;
    let input = input_expr(name, args)?;
    let options = ctx.options();
    let mut values: Vec<Value> = project_members(members, input, ctx)?
        .into_iter()
        .filter(|v| !v.is_null())
        .collect();
    values.sort_by(|a, b| {
        let ord = options.compare(a, b);
        if max {
            ord.reverse()
        } else {
            ord
        }
    });
    values.truncate(n);
    Ok(Value::Array(values))
}

fn ranked(
    name: &str,
    members: &[Value],
    args: &Expr,
    ctx: &Context<'_>,
    bottom: bool,
    many: bool,
) -> Result<Value> {
    let n = if many { resolve_n(name, args, ctx)? } else { 1 };
    let sort_expr = args
        .get("sortBy")
        .ok_or_else(|| MqlError::InvalidExpression(format!("{} requires 'sortBy'", name)))?;
    let output = args
        .get("output")
        .ok_or_else(|| MqlError::InvalidExpression(format!("{} requires 'output'", name)))?;
    let keys = SortKey::parse(name, &evaluate(&Value::Null, sort_expr, ctx)?)?;

    let sorted = sort_documents(members.to_vec(), &keys, ctx.options());
    let picked = if bottom {
        &sorted[sorted.len().saturating_sub(n)..]
    } else {
        &sorted[..n.min(sorted.len())]
    };

    let mut out = Vec::with_capacity(picked.len());
    for m in picked {
        out.push(evaluate(m, output, &ctx.with_root(m))?);
    }
    if many {
        Ok(Value::Array(out))
    } else {
        Ok(out.into_iter().next().unwrap_or(Value::Null))
    }
}

fn sorted_numbers(name: &str, members: &[Value], args: &Expr, ctx: &Context<'_>) -> Result<Vec<f64>> {
    let input = input_expr(name, args)?;
    let mut nums = numeric(&project_members(members, input, ctx)?);
    nums.sort_by(|a, b| a.total_cmp(b));
    Ok(nums)
}

fn approximate(name: &str, args: &Expr) -> Result<bool> {
    match args.get("method").and_then(Expr::as_literal) {
        None => Ok(false),
        Some(Value::String(m)) if m == "approximate" => Ok(true),
        Some(Value::String(m)) if m == "continuous" => Ok(false),
        Some(other) => Err(MqlError::InvalidExpression(format!(
            "{} has an unsupported method: {}",
            name, other
        ))),
    }
}

/// Percentile of a sorted, non-empty slice
fn rank_value(sorted: &[f64], p: f64, approximate: bool) -> f64 {
    let len = sorted.len();
    if approximate {
        let index = ((p * len as f64).ceil() as usize).saturating_sub(1).min(len - 1);
        return sorted[index];
    }
    let rank = p * (len - 1) as f64;
    let (lo, hi) = (rank.floor() as usize, rank.ceil() as usize);
    sorted[lo] + (rank - lo as f64) * (sorted[hi] - sorted[lo])
}

fn median(members: &[Value], args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let approximate = approximate("$median", args)?;
    let sorted = sorted_numbers("$median", members, args, ctx)?;
    if sorted.is_empty() {
        return Ok(Value::Null);
    }
    Ok(value::number(rank_value(&sorted, 0.5, approximate)))
}

fn percentile(members: &[Value], args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let approximate = approximate("$percentile", args)?;
    let p_expr = args
        .get("p")
        .ok_or_else(|| MqlError::InvalidExpression("$percentile requires 'p'".into()))?;
    let ps: Vec<f64> = match evaluate(ctx.root(), p_expr, ctx)? {
        Value::Array(items) => items
            .iter()
            .map(|p| value::as_f64(p).filter(|p| (0.0..=1.0).contains(p)))
            .collect::<Option<_>>(),
        _ => None,
    }
    .ok_or_else(|| {
        MqlError::InvalidExpression("$percentile 'p' must be an array of numbers in [0, 1]".into())
    })?;

    let sorted = sorted_numbers("$percentile", members, args, ctx)?;
    Ok(Value::Array(
        ps.iter()
            .map(|p| {
                if sorted.is_empty() {
                    Value::Null
                } else {
                    value::number(rank_value(&sorted, *p, approximate))
                }
            })
            .collect(),
    ))
}

fn script_name<'e>(args: &'e Expr, key: &str) -> Result<Option<&'e str>> {
    match args.get(key) {
        None => Ok(None),
        Some(Expr::Literal(Value::String(s))) => Ok(Some(s)),
        Some(_) => Err(MqlError::InvalidExpression(format!(
            "$accumulator '{}' must name a script",
            key
        ))),
    }
}

/// `$accumulator`: named init / accumulate / finalize scripts run in order
fn custom(members: &[Value], args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let options = ctx.options();
    let init = script_name(args, "init")?
        .ok_or_else(|| MqlError::InvalidExpression("$accumulator requires 'init'".into()))?;
    let step = script_name(args, "accumulate")?
        .ok_or_else(|| MqlError::InvalidExpression("$accumulator requires 'accumulate'".into()))?;
    let init = options.script(init)?;
    let step = options.script(step)?;
    let finalize = script_name(args, "finalize")?
        .map(|name| options.script(name))
        .transpose()?;

    let init_args = match args.get("initArgs") {
        Some(expr) => evaluate_args(ctx.root(), expr, ctx)?,
        None => Vec::new(),
    };
    let mut state = init(&Value::Null, &init_args)?;

    for member in members {
        let mut call_args = vec![state];
        if let Some(expr) = args.get("accumulateArgs") {
            call_args.extend(evaluate_args(member, expr, &ctx.with_root(member))?);
        }
        state = step(member, &call_args)?;
    }

    match finalize {
        Some(f) => f(&Value::Null, &[state]),
        None => Ok(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mql::options::Options;
    use crate::mql::Engine;
    use serde_json::json;

    fn run(engine: &Engine, members: &[Value], spec: Value) -> Result<Value> {
        let expr = Expr::compile_accumulator(&spec, engine)?;
        let root = json!({ "_id": null });
        accumulate(members, &expr, &Context::new(engine, &root))
    }

    fn scores() -> Vec<Value> {
        vec![
            json!({ "name": "a", "score": 10 }),
            json!({ "name": "b", "score": 30 }),
            json!({ "name": "c", "score": 20 }),
            json!({ "name": "d" }),
        ]
    }

    #[test]
    fn test_reducers() {
        let engine = Engine::default();
        let m = scores();
        assert_eq!(run(&engine, &m, json!({ "$sum": "$score" })).unwrap(), json!(60));
        assert_eq!(run(&engine, &m, json!({ "$sum": 1 })).unwrap(), json!(4));
        assert_eq!(run(&engine, &m, json!({ "$avg": "$score" })).unwrap(), json!(20));
        assert_eq!(run(&engine, &m, json!({ "$min": "$score" })).unwrap(), json!(10));
        assert_eq!(run(&engine, &m, json!({ "$max": "$score" })).unwrap(), json!(30));
        assert_eq!(run(&engine, &m, json!({ "$count": {} })).unwrap(), json!(4));
        assert_eq!(run(&engine, &m, json!({ "$push": "$score" })).unwrap(), json!([10, 30, 20]));
        assert_eq!(run(&engine, &m, json!({ "$first": "$name" })).unwrap(), json!("a"));
        assert_eq!(run(&engine, &m, json!({ "$last": "$score" })).unwrap(), Value::Null);
    }

    #[test]
    fn test_empty_group() {
        let engine = Engine::default();
        assert_eq!(run(&engine, &[], json!({ "$sum": "$x" })).unwrap(), json!(0));
        assert_eq!(run(&engine, &[], json!({ "$avg": "$x" })).unwrap(), Value::Null);
        assert_eq!(run(&engine, &[], json!({ "$max": "$x" })).unwrap(), Value::Null);
    }

    #[test]
    fn test_std_dev() {
        let engine = Engine::default();
        let m: Vec<Value> = [2, 4, 4, 4, 5, 5, 7, 9].iter().map(|v| json!({ "v": v })).collect();
        assert_eq!(run(&engine, &m, json!({ "$stdDevPop": "$v" })).unwrap(), json!(2));
        assert_eq!(run(&engine, &m[..1], json!({ "$stdDevSamp": "$v" })).unwrap(), Value::Null);
    }

    #[test]
    fn test_add_to_set_and_merge() {
        let engine = Engine::default();
        let m = vec![json!({ "v": 1, "o": { "a": 1 } }), json!({ "v": 1.0, "o": { "b": 2 } }), json!({ "v": 2, "o": null })];
        assert_eq!(run(&engine, &m, json!({ "$addToSet": "$v" })).unwrap(), json!([1, 2]));
        assert_eq!(run(&engine, &m, json!({ "$mergeObjects": "$o" })).unwrap(), json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn test_n_variants() {
        let engine = Engine::default();
        let m = scores();
        assert_eq!(
            run(&engine, &m, json!({ "$firstN": { "n": 2, "input": "$name" } })).unwrap(),
            json!(["a", "b"])
        );
        assert_eq!(
            run(&engine, &m, json!({ "$lastN": { "n": 9, "input": "$name" } })).unwrap(),
            json!(["a", "b", "c", "d"])
        );
        assert_eq!(
            run(&engine, &m, json!({ "$maxN": { "n": 2, "input": "$score" } })).unwrap(),
            json!([30, 20])
        );
        assert_eq!(
            run(&engine, &m, json!({ "$topN": { "n": 2, "sortBy": { "score": -1 }, "output": "$name" } }))
                .unwrap(),
            json!(["b", "c"])
        );
        assert_eq!(
            run(&engine, &m, json!({ "$bottom": { "sortBy": { "score": -1 }, "output": "$name" } })).unwrap(),
            json!("d")
        );
        assert!(run(&engine, &m, json!({ "$firstN": { "n": 0, "input": "$name" } })).is_err());
    }

    #[test]
    fn test_percentiles() {
        let engine = Engine::default();
        let m: Vec<Value> = [1, 2, 3, 4].iter().map(|v| json!({ "v": v })).collect();
        assert_eq!(run(&engine, &m, json!({ "$median": { "input": "$v" } })).unwrap(), json!(2.5));
        assert_eq!(
            run(&engine, &m, json!({ "$median": { "input": "$v", "method": "approximate" } })).unwrap(),
            json!(2)
        );
        assert_eq!(
            run(&engine, &m, json!({ "$percentile": { "input": "$v", "p": [0, 1] } })).unwrap(),
            json!([1, 4])
        );
        assert!(run(&engine, &m, json!({ "$percentile": { "input": "$v", "p": [2] } })).is_err());
    }

    #[test]
    fn test_custom_accumulator() {
        let options = Options::default()
            .with_script("zero", |_, _| Ok(json!(0)))
            .with_script("addLen", |_, args| {
                let state = args[0].as_i64().unwrap_or(0);
                let len = args[1].as_str().map(str::len).unwrap_or(0) as i64;
                Ok(json!(state + len))
            })
            .with_script("double", |_, args| Ok(json!(args[0].as_i64().unwrap_or(0) * 2)));
        let engine = Engine::new(options);
        let spec = json!({ "$accumulator": {
            "init": "zero",
            "accumulate": "addLen",
            "accumulateArgs": ["$name"],
            "finalize": "double",
            "lang": "js"
        } });
        let m = vec![json!({ "name": "ab" }), json!({ "name": "cde" })];
        assert_eq!(run(&engine, &m, spec.clone()).unwrap(), json!(10));

        let disabled = Engine::new(Options::default().with_script_enabled(false));
        assert!(matches!(
            run(&disabled, &m, spec),
            Err(MqlError::MissingConfiguration(_))
        ));
    }
}
