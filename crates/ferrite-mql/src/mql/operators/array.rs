//! Array expression operators

use serde_json::Value;

use crate::mql::context::Context;
use crate::mql::error::{MqlError, Result};
use crate::mql::expression::{evaluate, Expr};
use crate::mql::registry::Operator;
use crate::mql::value;

use super::{evaluate_args, evaluate_array, evaluate_exact, required, variable_name, with_bindings};

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    vec![
        ("$size", Operator::expression(size)),
        ("$arrayElemAt", Operator::expression_partial(array_elem_at)),
        ("$filter", Operator::expression(filter)),
        ("$map", Operator::expression(map)),
        ("$reduce", Operator::expression(reduce)),
        ("$in", Operator::expression(contains)),
        ("$concatArrays", Operator::expression(concat_arrays)),
        ("$isArray", Operator::expression(is_array)),
    ]
}

fn not_an_array(name: &str, found: &Value) -> MqlError {
    MqlError::Type(format!(
        "The argument to {} must be an array, but was of type: {}",
        name,
        value::type_of(found).name()
    ))
}

fn size(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let values = evaluate_exact("$size", doc, args, ctx, 1)?;
    match values.first() {
        Some(Value::Array(items)) => Ok(Value::from(items.len())),
        Some(other) => Err(not_an_array("$size", other)),
        None => Err(not_an_array("$size", &Value::Null)),
    }
}

/// `$arrayElemAt: [array, index]`; negative indices count from the end and
/// out-of-range indices yield the absent value
fn array_elem_at(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Option<Value>> {
    let values = evaluate_exact("$arrayElemAt", doc, args, ctx, 2)?;
    let items = match &values[0] {
        Value::Null => return Ok(Some(Value::Null)),
        Value::Array(items) => items,
        other => return Err(not_an_array("$arrayElemAt", other)),
    };
    let index = match &values[1] {
        Value::Null => return Ok(Some(Value::Null)),
        v => value::as_f64(v)
            .filter(|f| f.fract() == 0.0)
            .map(|f| f as i64)
            .ok_or_else(|| MqlError::Type(format!("$arrayElemAt index must be an integer, found {}", v)))?,
    };
    let position = if index < 0 {
        items.len() as i64 + index
    } else {
        index
    };
    if position < 0 {
        return Ok(None);
    }
    Ok(items.get(position as usize).cloned())
}

/// `$filter: {input, cond, as, limit}`
fn filter(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let input = required("$filter", args, "input")?;
    let cond = required("$filter", args, "cond")?;
    let name = variable_name("$filter", args)?;
    let limit = match args.get("limit").map(|l| evaluate(doc, l, ctx)).transpose()? {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            value::as_f64(&v)
                .filter(|n| *n >= 1.0 && n.fract() == 0.0)
                .map(|n| n as usize)
                .ok_or_else(|| MqlError::Type(format!("$filter limit must be a positive integer, found {}", v)))?,
        ),
    };

    let Some(items) = evaluate_array("$filter", doc, input, ctx)? else {
        return Ok(Value::Null);
    };
    let mut kept = Vec::new();
    for item in items {
        if limit.is_some_and(|n| kept.len() >= n) {
            break;
        }
        let keep = with_bindings(ctx, vec![(name.clone(), item.clone())], |scoped| {
            Ok(value::truthy(&evaluate(doc, cond, scoped)?))
        })?;
        if keep {
            kept.push(item);
        }
    }
    Ok(Value::Array(kept))
}

/// `$map: {input, as, in}`
fn map(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let input = required("$map", args, "input")?;
    let body = required("$map", args, "in")?;
    let name = variable_name("$map", args)?;

    let Some(items) = evaluate_array("$map", doc, input, ctx)? else {
        return Ok(Value::Null);
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(with_bindings(ctx, vec![(name.clone(), item)], |scoped| {
            evaluate(doc, body, scoped)
        })?);
    }
    Ok(Value::Array(out))
}

/// `$reduce: {input, initialValue, in}` with `$$value` and `$$this`
fn reduce(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let input = required("$reduce", args, "input")?;
    let initial = required("$reduce", args, "initialValue")?;
    let body = required("$reduce", args, "in")?;

    let Some(items) = evaluate_array("$reduce", doc, input, ctx)? else {
        return Ok(Value::Null);
    };
    let mut acc = evaluate(doc, initial, ctx)?;
    for item in items {
        let bindings = vec![("value".to_string(), acc), ("this".to_string(), item)];
        acc = with_bindings(ctx, bindings, |scoped| evaluate(doc, body, scoped))?;
    }
    Ok(acc)
}

/// `$in: [needle, array]`
fn contains(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let values = evaluate_exact("$in", doc, args, ctx, 2)?;
    match &values[1] {
        Value::Array(items) => Ok(Value::Bool(
            items.iter().any(|item| value::equals(item, &values[0])),
        )),
        other => Err(not_an_array("$in", other)),
    }
}

fn concat_arrays(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let mut out = Vec::new();
    for v in evaluate_args(doc, args, ctx)? {
        match v {
            Value::Null => return Ok(Value::Null),
            Value::Array(items) => out.extend(items),
            other => return Err(not_an_array("$concatArrays", &other)),
        }
    }
    Ok(Value::Array(out))
}

fn is_array(doc: &Value, args: &Expr, ctx: &Context<'_>) -> Result<Value> {
    let values = evaluate_exact("$isArray", doc, args, ctx, 1)?;
    Ok(Value::Bool(matches!(values.first(), Some(Value::Array(_)))))
}

#[cfg(test)]
mod tests {
    use crate::mql::error::MqlError;
    use crate::mql::Engine;
    use serde_json::{json, Value};

    fn eval(expr: Value) -> crate::mql::Result<Value> {
        let doc = json!({ "xs": [1, 2, 3, 4], "words": ["a", "b"], "n": null, "k": 3 });
        Engine::default().evaluate(&doc, &expr)
    }

    #[test]
    fn test_size_and_elem_at() {
        assert_eq!(eval(json!({ "$size": "$xs" })).unwrap(), json!(4));
        assert!(matches!(eval(json!({ "$size": "$k" })), Err(MqlError::Type(_))));
        assert_eq!(eval(json!({ "$arrayElemAt": ["$xs", 0] })).unwrap(), json!(1));
        assert_eq!(eval(json!({ "$arrayElemAt": ["$xs", -1] })).unwrap(), json!(4));
        assert_eq!(eval(json!({ "$arrayElemAt": ["$xs", 9] })).unwrap(), Value::Null);
        assert_eq!(eval(json!({ "$arrayElemAt": ["$n", 0] })).unwrap(), Value::Null);
    }

    #[test]
    fn test_elem_at_out_of_range_is_absent() {
        let out = Engine::default()
            .aggregate(
                vec![json!({ "xs": [1] })],
                &[json!({ "$project": { "_id": 0, "e": { "$arrayElemAt": ["$xs", 5] } } })],
            )
            .unwrap();
        assert_eq!(out, vec![json!({})]);
    }

    #[test]
    fn test_filter_map_reduce() {
        assert_eq!(
            eval(json!({ "$filter": { "input": "$xs", "as": "x", "cond": { "$gt": ["$$x", 2] } } })).unwrap(),
            json!([3, 4])
        );
        assert_eq!(
            eval(json!({ "$filter": { "input": "$xs", "cond": { "$gt": ["$$this", 1] }, "limit": 2 } }))
                .unwrap(),
            json!([2, 3])
        );
        assert_eq!(
            eval(json!({ "$map": { "input": "$xs", "as": "x", "in": { "$multiply": ["$$x", "$k"] } } }))
                .unwrap(),
            json!([3, 6, 9, 12])
        );
        assert_eq!(
            eval(json!({ "$reduce": {
                "input": "$xs",
                "initialValue": 0,
                "in": { "$add": ["$$value", "$$this"] }
            } }))
            .unwrap(),
            json!(10)
        );
        assert_eq!(
            eval(json!({ "$map": { "input": "$n", "in": "$$this" } })).unwrap(),
            Value::Null
        );
        assert!(matches!(
            eval(json!({ "$map": { "input": "$k", "in": "$$this" } })),
            Err(MqlError::Type(_))
        ));
    }

    #[test]
    fn test_nested_bindings_shadow() {
        let out = eval(json!({ "$map": {
            "input": [[1, 2], [3]],
            "as": "row",
            "in": { "$map": { "input": "$$row", "as": "row", "in": { "$add": ["$$row", 10] } } }
        } }))
        .unwrap();
        assert_eq!(out, json!([[11, 12], [13]]));
    }

    #[test]
    fn test_membership_and_concat() {
        assert_eq!(eval(json!({ "$in": [2.0, "$xs"] })).unwrap(), json!(true));
        assert_eq!(eval(json!({ "$in": ["z", "$words"] })).unwrap(), json!(false));
        assert!(eval(json!({ "$in": [1, "$k"] })).is_err());
        assert_eq!(
            eval(json!({ "$concatArrays": ["$words", ["c"], []] })).unwrap(),
            json!(["a", "b", "c"])
        );
        assert_eq!(eval(json!({ "$concatArrays": ["$words", "$n"] })).unwrap(), Value::Null);
        assert_eq!(eval(json!({ "$isArray": ["$xs"] })).unwrap(), json!(true));
        assert_eq!(eval(json!({ "$isArray": "$k" })).unwrap(), json!(false));
    }
}
