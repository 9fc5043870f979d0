//! `$setWindowFields` and window functions
//!
//! Documents are split into partitions (first-seen order) and each partition
//! is sorted by `sortBy`. Every output field is then computed once per
//! partition member, either by a window function or by an accumulator over
//! the member's frame:
//!
//! ```text
//!   partition:  d0  d1  d2  d3  d4
//!   documents: [-1, 1] at d2      └──┬──┘
//!                                 frame 1..4
//! ```
//!
//! A `documents` frame is a span of positions around the current member; a
//! `range` frame holds the members whose single sort key lies within
//! offsets of the current member's key.

use std::ops::Range;

use chrono::{DateTime, Months};
use serde_json::{Map, Value};
use tracing::trace;

use super::accumulator::accumulate;
use super::context::Context;
use super::error::{MqlError, OperatorCategory, Result};
use super::expression::{evaluate, Expr};
use super::lazy::Lazy;
use super::operators::required;
use super::options::Options;
use super::registry::{Operator, Registry, WindowOperator};
use super::stages::group::partition;
use super::stages::sort::{sort_documents, SortKey};
use super::stages::{stage_object, StageEnv};
use super::value;

/// Window functions that compute from position alone and take no `window`
const NO_WINDOW: [&str; 7] = [
    "$rank",
    "$denseRank",
    "$documentNumber",
    "$shift",
    "$locf",
    "$linearFill",
    "$expMovingAvg",
];

/// Window functions that only run over an explicit `window`
const NEEDS_WINDOW: [&str; 2] = ["$derivative", "$integral"];

/// Window functions that need `sortBy`
const NEEDS_SORT: [&str; 8] = [
    "$rank",
    "$denseRank",
    "$documentNumber",
    "$shift",
    "$derivative",
    "$integral",
    "$linearFill",
    "$expMovingAvg",
];

/// Register `$setWindowFields` and the built-in window functions
pub fn register(registry: &mut Registry) {
    registry.register_all(vec![
        ("$setWindowFields", Operator::pipeline(set_window_fields)),
        ("$rank", Operator::window(rank)),
        ("$denseRank", Operator::window(dense_rank)),
        ("$documentNumber", Operator::window(|w| Ok(Value::from(w.index + 1)))),
        ("$shift", Operator::window(shift)),
        ("$derivative", Operator::window(derivative)),
        ("$integral", Operator::window(integral)),
        ("$linearFill", Operator::window(linear_fill)),
        ("$locf", Operator::window(locf)),
        ("$expMovingAvg", Operator::window(exp_moving_avg)),
        ("$covariancePop", Operator::window(|w| covariance(w, false))),
        ("$covarianceSamp", Operator::window(|w| covariance(w, true))),
    ]);
}

/// What a window function sees for one partition member
pub struct WindowInput<'a> {
    /// Sorted partition
    pub partition: &'a [Value],
    /// Position of the current member
    pub index: usize,
    /// Frame of the current member; `None` when the output field has no
    /// `window`
    pub frame: Option<Range<usize>>,
    /// Partition sort keys
    pub sort_by: &'a [SortKey],
    /// Compiled function argument
    pub args: &'a Expr,
    /// Values already produced for earlier members of this partition
    pub previous: &'a [Value],
    /// Evaluation context rooted at the current member
    pub ctx: &'a Context<'a>,
}

impl<'a> WindowInput<'a> {
    /// Current member
    pub fn current(&self) -> &'a Value {
        &self.partition[self.index]
    }

    /// Members of the frame, or the whole partition without a window
    pub fn frame_documents(&self) -> &'a [Value] {
        match &self.frame {
            Some(range) => &self.partition[range.clone()],
            None => self.partition,
        }
    }

    /// Engine options
    pub fn options(&self) -> &'a Options {
        self.ctx.options()
    }

    /// Evaluate `expr` against a partition member
    pub fn evaluate(&self, doc: &Value, expr: &Expr) -> Result<Value> {
        evaluate(doc, expr, &self.ctx.with_root(doc))
    }

    /// Numeric (or date millisecond) value of the single sort key
    pub fn sort_value(&self, name: &str, doc: &Value) -> Result<f64> {
        let key = match self.sort_by {
            [key] => key,
            _ => {
                return Err(MqlError::InvalidStage(format!(
                    "{} requires exactly one sortBy field",
                    name
                )))
            }
        };
        let v = key.key_of(doc, self.options());
        value::as_ordinal(&v).ok_or_else(|| {
            MqlError::Type(format!("{} requires a numeric or date sortBy value, found {}", name, v))
        })
    }

    fn same_sort_key(&self, a: usize, b: usize) -> bool {
        let options = self.options();
        self.sort_by.iter().all(|key| {
            let (x, y) = (
                key.key_of(&self.partition[a], options),
                key.key_of(&self.partition[b], options),
            );
            options.compare(&x, &y).is_eq()
        })
    }
}

fn rank(w: &WindowInput<'_>) -> Result<Value> {
    if w.index > 0 && w.same_sort_key(w.index, w.index - 1) {
        return Ok(w.previous[w.index - 1].clone());
    }
    Ok(Value::from(w.index + 1))
}

fn dense_rank(w: &WindowInput<'_>) -> Result<Value> {
    if w.index == 0 {
        return Ok(Value::from(1));
    }
    let previous = w.previous[w.index - 1].as_u64().unwrap_or(0);
    if w.same_sort_key(w.index, w.index - 1) {
        Ok(Value::from(previous))
    } else {
        Ok(Value::from(previous + 1))
    }
}

fn shift(w: &WindowInput<'_>) -> Result<Value> {
    let output = required("$shift", w.args, "output")?;
    let by = required("$shift", w.args, "by")?
        .as_literal()
        .and_then(Value::as_i64)
        .ok_or_else(|| MqlError::InvalidExpression("$shift 'by' must be an integer constant".into()))?;

    let target = w.index as i64 + by;
    if target >= 0 && (target as usize) < w.partition.len() {
        return w.evaluate(&w.partition[target as usize], output);
    }
    match w.args.get("default") {
        Some(default) => w.evaluate(w.current(), default),
        None => Ok(Value::Null),
    }
}

/// Milliseconds per `unit`, for units of a fixed length
fn unit_millis(unit: &str) -> Option<f64> {
    Some(match unit {
        "week" => 604_800_000.0,
        "day" => 86_400_000.0,
        "hour" => 3_600_000.0,
        "minute" => 60_000.0,
        "second" => 1_000.0,
        "millisecond" => 1.0,
        _ => return None,
    })
}

fn time_unit(name: &str, w: &WindowInput<'_>) -> Result<f64> {
    match w.args.get("unit").map(|u| w.evaluate(w.current(), u)).transpose()? {
        None => Ok(1.0),
        Some(Value::String(unit)) => unit_millis(&unit).ok_or_else(|| {
            MqlError::InvalidExpression(format!("{} has an unsupported unit: {}", name, unit))
        }),
        Some(other) => Err(MqlError::InvalidExpression(format!(
            "{} 'unit' must be a string, found {}",
            name, other
        ))),
    }
}

/// `(x, y)` points of the frame with numeric inputs
fn points(name: &str, w: &WindowInput<'_>) -> Result<Vec<(f64, f64)>> {
    let input = required(name, w.args, "input")?;
    let mut out = Vec::new();
    for doc in w.frame_documents() {
        if let Some(y) = value::as_f64(&w.evaluate(doc, input)?) {
            out.push((w.sort_value(name, doc)?, y));
        }
    }
    Ok(out)
}

fn derivative(w: &WindowInput<'_>) -> Result<Value> {
    let unit = time_unit("$derivative", w)?;
    let pts = points("$derivative", w)?;
    match (pts.first(), pts.last()) {
        (Some((x0, y0)), Some((x1, y1))) if pts.len() >= 2 && x1 != x0 => {
            Ok(value::number((y1 - y0) / ((x1 - x0) / unit)))
        }
        _ => Ok(Value::Null),
    }
}

fn integral(w: &WindowInput<'_>) -> Result<Value> {
    let unit = time_unit("$integral", w)?;
    let pts = points("$integral", w)?;
    if pts.is_empty() {
        return Ok(Value::Null);
    }
    let area: f64 = pts
        .windows(2)
        .map(|pair| (pair[0].1 + pair[1].1) / 2.0 * ((pair[1].0 - pair[0].0) / unit))
        .sum();
    Ok(value::number(area))
}

fn linear_fill(w: &WindowInput<'_>) -> Result<Value> {
    let current = w.evaluate(w.current(), w.args)?;
    if !current.is_null() {
        return Ok(current);
    }

    let mut before = None;
    for i in (0..w.index).rev() {
        if let Some(y) = value::as_f64(&w.evaluate(&w.partition[i], w.args)?) {
            before = Some((w.sort_value("$linearFill", &w.partition[i])?, y));
            break;
        }
    }
    let mut after = None;
    for i in (w.index + 1)..w.partition.len() {
        if let Some(y) = value::as_f64(&w.evaluate(&w.partition[i], w.args)?) {
            after = Some((w.sort_value("$linearFill", &w.partition[i])?, y));
            break;
        }
    }

    match (before, after) {
        (Some((x0, y0)), Some((x1, y1))) if x1 != x0 => {
            let x = w.sort_value("$linearFill", w.current())?;
            Ok(value::number(y0 + (x - x0) * (y1 - y0) / (x1 - x0)))
        }
        _ => Ok(Value::Null),
    }
}

fn locf(w: &WindowInput<'_>) -> Result<Value> {
    let current = w.evaluate(w.current(), w.args)?;
    if !current.is_null() || w.index == 0 {
        return Ok(current);
    }
    Ok(w.previous[w.index - 1].clone())
}

fn exp_moving_avg(w: &WindowInput<'_>) -> Result<Value> {
    let input = required("$expMovingAvg", w.args, "input")?;
    let alpha = match (w.args.get("N"), w.args.get("alpha")) {
        (Some(n), None) => value::as_f64(&w.evaluate(w.current(), n)?)
            .filter(|n| *n >= 1.0 && n.fract() == 0.0)
            .map(|n| 2.0 / (n + 1.0)),
        (None, Some(alpha)) => value::as_f64(&w.evaluate(w.current(), alpha)?)
            .filter(|a| *a > 0.0 && *a < 1.0),
        _ => None,
    }
    .ok_or_else(|| {
        MqlError::InvalidExpression(
            "$expMovingAvg requires either a positive integer 'N' or an 'alpha' in (0, 1)".into(),
        )
    })?;

    let previous = w
        .index
        .checked_sub(1)
        .and_then(|i| value::as_f64(&w.previous[i]));
    let current = value::as_f64(&w.evaluate(w.current(), input)?);
    Ok(match (current, previous) {
        (Some(x), Some(p)) => value::number(alpha * x + (1.0 - alpha) * p),
        (Some(x), None) => value::number(x),
        (None, Some(p)) => value::number(p),
        (None, None) => Value::Null,
    })
}

fn covariance(w: &WindowInput<'_>, sample: bool) -> Result<Value> {
    let name = if sample { "$covarianceSamp" } else { "$covariancePop" };
    let (x_expr, y_expr) = match w.args {
        Expr::Array(items) if items.len() == 2 => (&items[0], &items[1]),
        _ => {
            return Err(MqlError::InvalidExpression(format!(
                "{} takes an array of two expressions",
                name
            )))
        }
    };

    let mut pairs = Vec::new();
    for doc in w.frame_documents() {
        let x = value::as_f64(&w.evaluate(doc, x_expr)?);
        let y = value::as_f64(&w.evaluate(doc, y_expr)?);
        if let (Some(x), Some(y)) = (x, y) {
            pairs.push((x, y));
        }
    }
    let n = pairs.len();
    if n == 0 || (sample && n < 2) {
        return Ok(Value::Null);
    }
    let mx = pairs.iter().map(|(x, _)| x).sum::<f64>() / n as f64;
    let my = pairs.iter().map(|(_, y)| y).sum::<f64>() / n as f64;
    let total: f64 = pairs.iter().map(|(x, y)| (x - mx) * (y - my)).sum();
    let divisor = (if sample { n - 1 } else { n }) as f64;
    Ok(value::number(total / divisor))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Bound {
    Unbounded,
    Current,
    Offset(f64),
}

impl Bound {
    fn parse(v: &Value, integral: bool) -> Result<Self> {
        match v {
            Value::String(s) if s == "unbounded" => Ok(Self::Unbounded),
            Value::String(s) if s == "current" => Ok(Self::Current),
            Value::Number(n) => match n.as_f64() {
                Some(f) if !integral || f.fract() == 0.0 => Ok(Self::Offset(f)),
                _ => Err(MqlError::InvalidStage(format!(
                    "window bound must be an integer, found {}",
                    v
                ))),
            },
            _ => Err(MqlError::InvalidStage(format!(
                "window bound must be 'unbounded', 'current' or a number, found {}",
                v
            ))),
        }
    }

    /// Position on a line where `Unbounded` is infinite and `Current` is zero
    fn ordinal(&self, low: bool) -> f64 {
        match self {
            Self::Unbounded if low => f64::NEG_INFINITY,
            Self::Unbounded => f64::INFINITY,
            Self::Current => 0.0,
            Self::Offset(f) => *f,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RangeUnit {
    Millis(f64),
    Months(u32),
}

impl RangeUnit {
    fn parse(unit: &str) -> Result<Self> {
        if let Some(ms) = unit_millis(unit) {
            return Ok(Self::Millis(ms));
        }
        match unit {
            "month" => Ok(Self::Months(1)),
            "quarter" => Ok(Self::Months(3)),
            "year" => Ok(Self::Months(12)),
            other => Err(MqlError::InvalidStage(format!(
                "unknown window unit: {}",
                other
            ))),
        }
    }

    /// `base` milliseconds moved by `offset` units
    fn shift(&self, base: f64, offset: f64) -> Result<f64> {
        match self {
            Self::Millis(ms) => Ok(base + offset * ms),
            Self::Months(per) => {
                let dt = DateTime::from_timestamp_millis(base as i64)
                    .ok_or_else(|| MqlError::Type(format!("{} is not a valid date", base)))?;
                let months = Months::new(offset.abs() as u32 * per);
                let moved = if offset >= 0.0 {
                    dt.checked_add_months(months)
                } else {
                    dt.checked_sub_months(months)
                };
                moved
                    .map(|d| d.timestamp_millis() as f64)
                    .ok_or_else(|| MqlError::Type("window range bound is out of the date range".into()))
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Window {
    Documents(Bound, Bound),
    Range {
        lower: Bound,
        upper: Bound,
        unit: Option<RangeUnit>,
    },
}

impl Window {
    fn parse(spec: &Value, sort_by: &[SortKey]) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| MqlError::InvalidStage("window must be an object".into()))?;
        let pair = |key: &str, integral: bool| -> Result<Option<(Bound, Bound)>> {
            let Some(v) = obj.get(key) else {
                return Ok(None);
            };
            match v.as_array().map(Vec::as_slice) {
                Some([lo, hi]) => {
                    let (lo, hi) = (Bound::parse(lo, integral)?, Bound::parse(hi, integral)?);
                    if lo.ordinal(true) > hi.ordinal(false) {
                        return Err(MqlError::InvalidStage(format!(
                            "window {} lower bound must not exceed the upper bound",
                            key
                        )));
                    }
                    Ok(Some((lo, hi)))
                }
                _ => Err(MqlError::InvalidStage(format!(
                    "window {} must be a [lower, upper] array",
                    key
                ))),
            }
        };

        let unit = obj
            .get("unit")
            .map(|u| {
                u.as_str()
                    .ok_or_else(|| MqlError::InvalidStage("window unit must be a string".into()))
                    .and_then(RangeUnit::parse)
            })
            .transpose()?;

        match (pair("documents", true)?, pair("range", unit.is_some())?) {
            (Some((lo, hi)), None) => {
                if unit.is_some() {
                    return Err(MqlError::InvalidStage(
                        "window unit only applies to range windows".into(),
                    ));
                }
                Ok(Self::Documents(lo, hi))
            }
            (None, Some((lower, upper))) => {
                if sort_by.len() != 1 {
                    return Err(MqlError::InvalidStage(
                        "range windows require exactly one sortBy field".into(),
                    ));
                }
                Ok(Self::Range { lower, upper, unit })
            }
            (None, None) => Err(MqlError::InvalidStage(
                "window requires 'documents' or 'range'".into(),
            )),
            (Some(_), Some(_)) => Err(MqlError::InvalidStage(
                "window cannot specify both 'documents' and 'range'".into(),
            )),
        }
    }

    /// Frame of member `index`; `keys` holds the sort values for range
    /// windows
    fn frame(&self, index: usize, len: usize, keys: &[f64]) -> Result<Range<usize>> {
        match self {
            Self::Documents(lo, hi) => {
                let clamp = |p: f64| p.clamp(0.0, len as f64) as usize;
                let start = clamp(index as f64 + lo.ordinal(true));
                let end = clamp(index as f64 + hi.ordinal(false) + 1.0);
                Ok(start..end.max(start))
            }
            Self::Range { lower, upper, unit } => {
                let base = keys[index];
                let bound = |b: &Bound, low: bool| -> Result<f64> {
                    match (b, unit) {
                        (Bound::Offset(o), Some(u)) => u.shift(base, *o),
                        _ => Ok(base + b.ordinal(low)),
                    }
                };
                let (lo, hi) = (bound(lower, true)?, bound(upper, false)?);
                let inside: Vec<usize> = (0..len).filter(|&j| keys[j] >= lo && keys[j] <= hi).collect();
                match (inside.first(), inside.last()) {
                    (Some(&first), Some(&last)) => Ok(first..last + 1),
                    _ => Ok(index..index),
                }
            }
        }
    }
}

enum FieldKind {
    Function { op: WindowOperator, args: Expr },
    Accumulator(Expr),
}

struct OutputField {
    path: String,
    kind: FieldKind,
    window: Option<Window>,
}

impl OutputField {
    fn parse(path: &str, spec: &Value, sort_by: &[SortKey], env: &StageEnv) -> Result<Self> {
        let obj = spec.as_object().ok_or_else(|| {
            MqlError::InvalidStage(format!("$setWindowFields output '{}' must be an object", path))
        })?;
        let mut operators = obj.iter().filter(|(k, _)| k.as_str() != "window");
        let (name, arg) = match (operators.next(), operators.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(MqlError::InvalidStage(format!(
                    "$setWindowFields output '{}' must specify exactly one operator",
                    path
                )))
            }
        };
        let window = obj.get("window").map(|w| Window::parse(w, sort_by)).transpose()?;
        let registry = env.engine().registry();

        let kind = if let Some(op) = registry.window(name) {
            if window.is_some() && NO_WINDOW.contains(&name.as_str()) {
                return Err(MqlError::InvalidStage(format!("{} does not accept a window", name)));
            }
            if window.is_none() && NEEDS_WINDOW.contains(&name.as_str()) {
                return Err(MqlError::InvalidStage(format!("{} requires a window", name)));
            }
            if sort_by.is_empty() && NEEDS_SORT.contains(&name.as_str()) {
                return Err(MqlError::InvalidStage(format!("{} requires sortBy", name)));
            }
            FieldKind::Function {
                op: op.clone(),
                args: Expr::compile(arg, env.engine())?,
            }
        } else if registry.accumulator(name).is_some() {
            let mut single = Map::new();
            single.insert(name.clone(), arg.clone());
            FieldKind::Accumulator(Expr::compile_accumulator(&Value::Object(single), env.engine())?)
        } else {
            return Err(MqlError::unknown(OperatorCategory::Window, name.as_str()));
        };

        Ok(Self {
            path: path.to_string(),
            kind,
            window,
        })
    }

    fn compute(&self, members: &[Value], sort_by: &[SortKey], env: &StageEnv) -> Result<Vec<Value>> {
        let keys = match (&self.window, sort_by) {
            (Some(Window::Range { .. }), [key]) => members
                .iter()
                .map(|doc| {
                    let v = key.key_of(doc, env.options());
                    value::as_ordinal(&v).ok_or_else(|| {
                        MqlError::Type(format!(
                            "range windows require numeric or date sort values, found {}",
                            v
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?,
            _ => Vec::new(),
        };

        let mut values: Vec<Value> = Vec::with_capacity(members.len());
        for (index, doc) in members.iter().enumerate() {
            let ctx = env.context(doc);
            let frame = self
                .window
                .as_ref()
                .map(|w| w.frame(index, members.len(), &keys))
                .transpose()?;
            let v = match &self.kind {
                FieldKind::Function { op, args } => op(&WindowInput {
                    partition: members,
                    index,
                    frame,
                    sort_by,
                    args,
                    previous: &values,
                    ctx: &ctx,
                })?,
                FieldKind::Accumulator(expr) => {
                    let frame = frame.unwrap_or(0..members.len());
                    accumulate(&members[frame], expr, &ctx)?
                }
            };
            values.push(v);
        }
        Ok(values)
    }
}

fn set_window_fields(lazy: Lazy, arg: &Value, env: &StageEnv) -> Result<Lazy> {
    let spec = stage_object("$setWindowFields", arg)?;
    let partition_by = spec
        .get("partitionBy")
        .map(|p| Expr::compile(p, env.engine()))
        .transpose()?;
    let sort_by = spec
        .get("sortBy")
        .map(|s| SortKey::parse("$setWindowFields", s))
        .transpose()?
        .unwrap_or_default();
    let output = spec
        .get("output")
        .and_then(Value::as_object)
        .filter(|o| !o.is_empty())
        .ok_or_else(|| {
            MqlError::InvalidStage("$setWindowFields requires a non-empty 'output' object".into())
        })?;
    let fields = output
        .iter()
        .map(|(path, field)| OutputField::parse(path, field, &sort_by, env))
        .collect::<Result<Vec<_>>>()?;

    let env = env.clone();
    Ok(lazy.transform(move |docs| {
        let partitions = match &partition_by {
            Some(key) => partition(docs, key, &env)?
                .into_iter()
                .map(|(_, members)| members)
                .collect(),
            None => vec![docs],
        };
        trace!(partitions = partitions.len(), fields = fields.len(), "$setWindowFields");

        let mut out = Vec::new();
        for members in partitions {
            let members = sort_documents(members, &sort_by, env.options());
            let columns = fields
                .iter()
                .map(|field| field.compute(&members, &sort_by, &env))
                .collect::<Result<Vec<_>>>()?;
            for (index, mut doc) in members.into_iter().enumerate() {
                for (field, column) in fields.iter().zip(&columns) {
                    value::set_path(&mut doc, &field.path, column[index].clone());
                }
                out.push(doc);
            }
        }
        Ok(out)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mql::Engine;
    use serde_json::json;

    fn window(docs: Vec<Value>, spec: Value) -> Result<Vec<Value>> {
        Engine::default().aggregate(docs, &[json!({ "$setWindowFields": spec })])
    }

    fn column(out: &[Value], field: &str) -> Vec<Value> {
        out.iter().map(|d| d[field].clone()).collect()
    }

    fn scores() -> Vec<Value> {
        vec![
            json!({ "p": "x", "score": 90 }),
            json!({ "p": "x", "score": 70 }),
            json!({ "p": "x", "score": 90 }),
            json!({ "p": "y", "score": 10 }),
        ]
    }

    #[test]
    fn test_rank_and_dense_rank() {
        let out = window(
            scores(),
            json!({
                "partitionBy": "$p",
                "sortBy": { "score": -1 },
                "output": {
                    "rank": { "$rank": {} },
                    "dense": { "$denseRank": {} },
                    "n": { "$documentNumber": {} }
                }
            }),
        )
        .unwrap();
        assert_eq!(column(&out, "rank"), vec![json!(1), json!(1), json!(3), json!(1)]);
        assert_eq!(column(&out, "dense"), vec![json!(1), json!(1), json!(2), json!(1)]);
        assert_eq!(column(&out, "n"), vec![json!(1), json!(2), json!(3), json!(1)]);
        assert_eq!(out[3]["p"], json!("y"));
    }

    #[test]
    fn test_rank_tie_then_new_value() {
        let docs: Vec<Value> = [3, 3, 5].iter().map(|v| json!({ "v": v })).collect();
        let out = window(
            docs,
            json!({ "sortBy": { "v": 1 }, "output": {
                "r": { "$rank": {} }, "d": { "$denseRank": {} }
            } }),
        )
        .unwrap();
        assert_eq!(column(&out, "r"), vec![json!(1), json!(1), json!(3)]);
        assert_eq!(column(&out, "d"), vec![json!(1), json!(1), json!(2)]);
    }

    #[test]
    fn test_accumulator_over_documents_window() {
        let docs: Vec<Value> = (1..=4).map(|i| json!({ "t": i, "v": i * 10 })).collect();
        let out = window(
            docs,
            json!({ "sortBy": { "t": 1 }, "output": {
                "moving": { "$sum": "$v", "window": { "documents": [-1, 0] } },
                "running": { "$sum": "$v", "window": { "documents": ["unbounded", "current"] } },
                "total": { "$sum": "$v" }
            } }),
        )
        .unwrap();
        assert_eq!(column(&out, "moving"), vec![json!(10), json!(30), json!(50), json!(70)]);
        assert_eq!(column(&out, "running"), vec![json!(10), json!(30), json!(60), json!(100)]);
        assert_eq!(column(&out, "total"), vec![json!(100); 4]);
    }

    #[test]
    fn test_range_window() {
        let docs: Vec<Value> = [1, 2, 4, 8].iter().map(|t| json!({ "t": t })).collect();
        let out = window(
            docs,
            json!({ "sortBy": { "t": 1 }, "output": {
                "near": { "$count": {}, "window": { "range": [-2, 0] } }
            } }),
        )
        .unwrap();
        assert_eq!(column(&out, "near"), vec![json!(1), json!(2), json!(2), json!(1)]);
    }

    #[test]
    fn test_range_window_with_unit() {
        let docs = vec![
            json!({ "d": { "$date": "2024-01-01T00:00:00.000Z" }, "v": 1 }),
            json!({ "d": { "$date": "2024-01-02T00:00:00.000Z" }, "v": 2 }),
            json!({ "d": { "$date": "2024-01-05T00:00:00.000Z" }, "v": 4 }),
        ];
        let out = window(
            docs,
            json!({ "sortBy": { "d": 1 }, "output": {
                "s": { "$sum": "$v", "window": { "range": [-1, "current"], "unit": "day" } }
            } }),
        )
        .unwrap();
        assert_eq!(column(&out, "s"), vec![json!(1), json!(3), json!(4)]);
    }

    #[test]
    fn test_shift_locf_linear_fill() {
        let docs = vec![
            json!({ "t": 1, "v": 10 }),
            json!({ "t": 2, "v": null }),
            json!({ "t": 3 }),
            json!({ "t": 4, "v": 40 }),
            json!({ "t": 5, "v": null }),
        ];
        let out = window(
            docs,
            json!({ "sortBy": { "t": 1 }, "output": {
                "next": { "$shift": { "output": "$t", "by": 1, "default": "none" } },
                "carried": { "$locf": "$v" },
                "filled": { "$linearFill": "$v" }
            } }),
        )
        .unwrap();
        assert_eq!(
            column(&out, "next"),
            vec![json!(2), json!(3), json!(4), json!(5), json!("none")]
        );
        assert_eq!(
            column(&out, "carried"),
            vec![json!(10), json!(10), json!(10), json!(40), json!(40)]
        );
        assert_eq!(
            column(&out, "filled"),
            vec![json!(10), json!(20), json!(30), json!(40), json!(null)]
        );
    }

    #[test]
    fn test_derivative_and_integral() {
        let docs: Vec<Value> = [(0, 0), (1, 10), (2, 30)]
            .iter()
            .map(|(t, v)| json!({ "t": t, "v": v }))
            .collect();
        let out = window(
            docs,
            json!({ "sortBy": { "t": 1 }, "output": {
                "rate": { "$derivative": { "input": "$v" }, "window": { "documents": [-1, 0] } },
                "area": { "$integral": { "input": "$v" }, "window": { "documents": ["unbounded", "current"] } }
            } }),
        )
        .unwrap();
        assert_eq!(column(&out, "rate"), vec![json!(null), json!(10), json!(20)]);
        assert_eq!(column(&out, "area"), vec![json!(0), json!(5), json!(25)]);
    }

    #[test]
    fn test_exp_moving_avg_and_covariance() {
        let docs: Vec<Value> = [(1, 2), (2, 4), (3, 6)]
            .iter()
            .map(|(x, y)| json!({ "x": x, "y": y }))
            .collect();
        let out = window(
            docs,
            json!({ "sortBy": { "x": 1 }, "output": {
                "ema": { "$expMovingAvg": { "input": "$y", "alpha": 0.5 } },
                "cov": { "$covarianceSamp": ["$x", "$y"] }
            } }),
        )
        .unwrap();
        assert_eq!(column(&out, "ema"), vec![json!(2), json!(3), json!(4.5)]);
        assert_eq!(column(&out, "cov"), vec![json!(2); 3]);
    }

    #[test]
    fn test_validation() {
        let engine = Engine::default();
        for spec in [
            json!({ "sortBy": { "v": 1 }, "output": { "r": { "$rank": {}, "window": { "documents": [-1, 0] } } } }),
            json!({ "output": { "r": { "$rank": {} } } }),
            json!({ "sortBy": { "v": 1 }, "output": { "r": { "$nope": {} } } }),
            json!({ "sortBy": { "v": 1 }, "output": { "r": { "$sum": "$v", "window": { "documents": [1, -1] } } } }),
            json!({ "sortBy": { "v": 1, "w": 1 }, "output": { "r": { "$sum": "$v", "window": { "range": [-1, 1] } } } }),
            json!({ "sortBy": { "v": 1 } }),
            json!({ "sortBy": { "v": 1 }, "output": { "d": { "$derivative": { "input": "$v" } } } }),
            json!({ "sortBy": { "v": 1 }, "output": { "i": { "$integral": { "input": "$v" } } } }),
        ] {
            let aggregator = engine.aggregator(&[json!({ "$setWindowFields": spec })]).unwrap();
            assert!(aggregator.stream(Vec::new()).is_err(), "accepted invalid window spec");
        }
    }
}
