//! `$bucket` and `$bucketAuto`

use std::cmp::Ordering;
use std::mem;

use serde_json::{json, Map, Value};
use tracing::trace;

use crate::mql::error::{MqlError, Result};
use crate::mql::expression::{evaluate, Expr};
use crate::mql::lazy::Lazy;
use crate::mql::options::Options;
use crate::mql::registry::Operator;
use crate::mql::value;

use super::{compile_accumulators, group_output, stage_count, stage_object, StageEnv};

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    vec![
        ("$bucket", Operator::pipeline(bucket_stage)),
        ("$bucketAuto", Operator::pipeline(bucket_auto_stage)),
    ]
}

fn same_kind(a: &Value, b: &Value) -> bool {
    value::type_of(a).sort_rank() == value::type_of(b).sort_rank()
}

/// Compile `output`, defaulting to `{count: {$sum: 1}}`
fn compile_output(stage: &str, spec: &Map<String, Value>, env: &StageEnv) -> Result<Vec<(String, Expr)>> {
    match spec.get("output") {
        Some(Value::Object(fields)) => compile_accumulators(stage, fields, &[], env.engine()),
        Some(_) => Err(MqlError::InvalidStage(format!("{} 'output' must be an object", stage))),
        None => {
            let mut fields = Map::new();
            fields.insert("count".to_string(), json!({ "$sum": 1 }));
            compile_accumulators(stage, &fields, &[], env.engine())
        }
    }
}

fn group_by(stage: &str, spec: &Map<String, Value>, env: &StageEnv) -> Result<Expr> {
    let expr = spec
        .get("groupBy")
        .ok_or_else(|| MqlError::InvalidStage(format!("{} requires 'groupBy'", stage)))?;
    match expr {
        Value::String(s) if s.starts_with('$') => Expr::compile(expr, env.engine()),
        Value::Object(_) => Expr::compile(expr, env.engine()),
        _ => Err(MqlError::InvalidStage(format!(
            "{} 'groupBy' must be a path or an expression object",
            stage
        ))),
    }
}

fn validate_boundaries(boundaries: &[Value], options: &Options) -> Result<()> {
    if boundaries.len() < 3 {
        return Err(MqlError::InvalidStage(
            "$bucket 'boundaries' must have at least 3 values".into(),
        ));
    }
    for pair in boundaries.windows(2) {
        if !same_kind(&pair[0], &pair[1]) {
            return Err(MqlError::InvalidStage(
                "$bucket 'boundaries' must all be of the same type".into(),
            ));
        }
        if options.compare(&pair[0], &pair[1]) != Ordering::Less {
            return Err(MqlError::InvalidStage(
                "$bucket 'boundaries' must be sorted in ascending order".into(),
            ));
        }
    }
    Ok(())
}

/// Index of the bucket holding `key`, `None` when out of range
fn locate(boundaries: &[Value], key: &Value, options: &Options) -> Option<usize> {
    let (lowest, highest) = (boundaries.first()?, boundaries.last()?);
    if !same_kind(key, lowest)
        || options.compare(key, lowest).is_lt()
        || options.compare(key, highest).is_ge()
    {
        return None;
    }
    let upper = boundaries.partition_point(|b| options.compare(b, key).is_le());
    Some(upper - 1)
}

fn bucket_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let spec = stage_object("$bucket", arg)?;
    let group_by = group_by("$bucket", spec, env)?;
    let boundaries = spec
        .get("boundaries")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| MqlError::InvalidStage("$bucket requires a 'boundaries' array".into()))?;
    validate_boundaries(&boundaries, env.options())?;

    let default = spec.get("default").cloned();
    if let Some(d) = &default {
        if locate(&boundaries, d, env.options()).is_some() {
            return Err(MqlError::InvalidStage(
                "$bucket 'default' must be less than the lowest boundary or greater than or \
                 equal to the highest boundary"
                    .into(),
            ));
        }
    }
    let accumulators = compile_output("$bucket", spec, env)?;

    let env = env.clone();
    Ok(lazy.transform(move |docs| {
        let options = env.options();
        let mut buckets: Vec<Vec<Value>> = vec![Vec::new(); boundaries.len() - 1];
        let mut overflow = Vec::new();

        for doc in docs {
            let key = evaluate(&doc, &group_by, &env.context(&doc))?;
            match locate(&boundaries, &key, options) {
                Some(i) => buckets[i].push(doc),
                None if default.is_some() => overflow.push(doc),
                None => {
                    return Err(MqlError::InvalidStage(format!(
                        "$bucket could not find a matching branch for {} and no default was specified",
                        key
                    )))
                }
            }
        }
        trace!(buckets = buckets.len(), overflow = overflow.len(), "$bucket");

        let mut out = Vec::new();
        for (id, members) in boundaries.iter().zip(buckets.iter()) {
            if !members.is_empty() {
                out.push(group_output(id.clone(), members, &accumulators, &env)?);
            }
        }
        if let (Some(id), false) = (&default, overflow.is_empty()) {
            out.push(group_output(id.clone(), &overflow, &accumulators, &env)?);
        }
        Ok(out)
    }))
}

/// Preferred number series used to round `$bucketAuto` boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Granularity {
    PowersOf2,
    /// Mantissas in hundredths over one decade
    Series(&'static [u32]),
}

const R5: &[u32] = &[100, 160, 250, 400, 630];
const R10: &[u32] = &[100, 125, 160, 200, 250, 315, 400, 500, 630, 800];
const R20: &[u32] = &[
    100, 112, 125, 140, 160, 180, 200, 224, 250, 280, 315, 355, 400, 450, 500, 560, 630, 710, 800,
    900,
];
const E6: &[u32] = &[100, 150, 220, 330, 470, 680];
const E12: &[u32] = &[100, 120, 150, 180, 220, 270, 330, 390, 470, 560, 680, 820];
const E24: &[u32] = &[
    100, 110, 120, 130, 150, 160, 180, 200, 220, 240, 270, 300, 330, 360, 390, 430, 470, 510, 560,
    620, 680, 750, 820, 910,
];
const ONE_TWO_FIVE: &[u32] = &[100, 200, 500];

impl Granularity {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "POWERSOF2" => Self::PowersOf2,
            "1-2-5" => Self::Series(ONE_TWO_FIVE),
            "R5" => Self::Series(R5),
            "R10" => Self::Series(R10),
            "R20" => Self::Series(R20),
            "E6" => Self::Series(E6),
            "E12" => Self::Series(E12),
            "E24" => Self::Series(E24),
            other => {
                return Err(MqlError::InvalidStage(format!(
                    "$bucketAuto has an unknown granularity: {}",
                    other
                )))
            }
        })
    }

    /// Series values around the decade of `v`, ascending
    fn candidates(mantissas: &[u32], v: f64) -> Vec<f64> {
        let decade = v.log10().floor() as i32;
        let mut out = Vec::new();
        for exp in (decade - 1)..=(decade + 1) {
            for m in mantissas {
                let shift = exp - 2;
                let c = if shift >= 0 {
                    f64::from(*m) * 10f64.powi(shift)
                } else {
                    f64::from(*m) / 10f64.powi(-shift)
                };
                out.push(c);
            }
        }
        out
    }

    /// Largest series value not above `v`
    fn round_down(&self, v: f64) -> f64 {
        if v <= 0.0 {
            return 0.0;
        }
        match self {
            Self::PowersOf2 => 2f64.powi(v.log2().floor() as i32),
            Self::Series(m) => Self::candidates(m, v)
                .into_iter()
                .filter(|c| *c <= v)
                .last()
                .unwrap_or(0.0),
        }
    }

    /// Smallest series value strictly above `v`
    fn round_up(&self, v: f64) -> f64 {
        match self {
            Self::PowersOf2 if v <= 0.0 => 1.0,
            Self::PowersOf2 => {
                let next = 2f64.powi(v.log2().floor() as i32 + 1);
                if next > v {
                    next
                } else {
                    next * 2.0
                }
            }
            Self::Series(m) if v <= 0.0 => f64::from(m[0]) / 100.0,
            Self::Series(m) => Self::candidates(m, v)
                .into_iter()
                .find(|c| *c > v)
                .unwrap_or(v),
        }
    }
}

/// Key and member pairs, grouped into buckets
type Bucket = Vec<(Value, Value)>;

/// Fill buckets of `target` members without splitting runs of equal keys;
/// whatever is left after `count - 1` buckets lands in the last one
fn fill_buckets(items: Vec<(Value, Value)>, count: usize, options: &Options) -> Vec<Bucket> {
    let target = ((items.len() as f64 / count as f64).round() as usize).max(1);
    let mut buckets: Vec<Bucket> = Vec::new();
    let mut current: Bucket = Vec::new();
    let mut iter = items.into_iter().peekable();

    while let Some(item) = iter.next() {
        current.push(item);
        if current.len() >= target && buckets.len() + 1 < count {
            let run_ends = match (iter.peek(), current.last()) {
                (Some((next, _)), Some((last, _))) => options.compare(next, last).is_ne(),
                _ => true,
            };
            if run_ends {
                buckets.push(mem::take(&mut current));
            }
        }
    }
    if !current.is_empty() {
        buckets.push(current);
    }
    buckets
}

/// `{min, max}` per bucket, chained so each max is the next bucket's min
fn plain_bounds(buckets: &[Bucket]) -> Vec<(Value, Value)> {
    let mut bounds = Vec::with_capacity(buckets.len());
    for (i, bucket) in buckets.iter().enumerate() {
        let min = bucket.first().map(|(k, _)| k.clone()).unwrap_or(Value::Null);
        let max = match buckets.get(i + 1).and_then(|b| b.first()) {
            Some((k, _)) => k.clone(),
            None => bucket.last().map(|(k, _)| k.clone()).unwrap_or(Value::Null),
        };
        bounds.push((min, max));
    }
    bounds
}

/// Round bounds outward to `granularity`, pulling members of later buckets
/// that fall under a rounded max back into the earlier bucket
fn rounded_bounds(
    buckets: Vec<Bucket>,
    granularity: Granularity,
) -> Result<(Vec<Bucket>, Vec<(Value, Value)>)> {
    let numeric = |k: &Value| {
        value::as_f64(k).filter(|f| *f >= 0.0).ok_or_else(|| {
            MqlError::Type(format!(
                "$bucketAuto with granularity requires non-negative numbers, found {}",
                k
            ))
        })
    };

    let mut merged: Vec<Bucket> = Vec::new();
    let mut bounds: Vec<(f64, f64)> = Vec::new();
    let mut pending: Bucket = Vec::new();

    for bucket in buckets {
        for item in bucket {
            let key = numeric(&item.0)?;
            match (merged.last_mut(), bounds.last()) {
                (Some(previous), Some((_, max))) if pending.is_empty() && key < *max => {
                    previous.push(item)
                }
                _ => pending.push(item),
            }
        }
        if pending.is_empty() {
            continue;
        }
        let lo = numeric(&pending[0].0)?;
        let hi = pending
            .iter()
            .map(|(k, _)| numeric(k))
            .collect::<Result<Vec<f64>>>()?
            .into_iter()
            .fold(lo, f64::max);
        let min = match bounds.last() {
            Some((_, max)) => *max,
            None => granularity.round_down(lo),
        };
        bounds.push((min, granularity.round_up(hi)));
        merged.push(mem::take(&mut pending));
    }

    let bounds = bounds
        .into_iter()
        .map(|(min, max)| (value::number(min), value::number(max)))
        .collect();
    Ok((merged, bounds))
}

fn bucket_auto_stage(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let spec = stage_object("$bucketAuto", arg)?;
    let group_by = group_by("$bucketAuto", spec, env)?;
    let count = spec
        .get("buckets")
        .ok_or_else(|| MqlError::InvalidStage("$bucketAuto requires 'buckets'".into()))
        .and_then(|b| stage_count("$bucketAuto 'buckets'", b))?;
    if count == 0 {
        return Err(MqlError::InvalidStage(
            "$bucketAuto 'buckets' must be a positive integer".into(),
        ));
    }
    let granularity = match spec.get("granularity") {
        None => None,
        Some(Value::String(name)) => Some(Granularity::parse(name)?),
        Some(_) => {
            return Err(MqlError::InvalidStage(
                "$bucketAuto 'granularity' must be a string".into(),
            ))
        }
    };
    let accumulators = compile_output("$bucketAuto", spec, env)?;

    let env = env.clone();
    Ok(lazy.transform(move |docs| {
        let options = env.options();
        let mut nulls = Vec::new();
        let mut keyed = Vec::with_capacity(docs.len());
        for doc in docs {
            let key = evaluate(&doc, &group_by, &env.context(&doc))?;
            if key.is_null() {
                nulls.push((key, doc));
            } else {
                keyed.push((key, doc));
            }
        }
        keyed.sort_by(|a, b| options.compare(&a.0, &b.0));
        nulls.extend(keyed);

        let buckets = fill_buckets(nulls, count, options);
        let (buckets, bounds) = match granularity {
            Some(g) => rounded_bounds(buckets, g)?,
            None => {
                let bounds = plain_bounds(&buckets);
                (buckets, bounds)
            }
        };
        trace!(buckets = buckets.len(), "$bucketAuto");

        buckets
            .into_iter()
            .zip(bounds)
            .map(|(bucket, (min, max))| {
                let members: Vec<Value> = bucket.into_iter().map(|(_, doc)| doc).collect();
                group_output(json!({ "min": min, "max": max }), &members, &accumulators, &env)
            })
            .collect()
    }))
}
