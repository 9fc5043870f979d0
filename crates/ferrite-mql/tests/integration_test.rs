#![allow(clippy::unwrap_used)]
//! Integration tests for ferrite-mql
//!
//! These tests drive the public API end to end:
//! - find with sort, skip, limit and projection
//! - multi-stage aggregation pipelines
//! - live collections as sources and sinks
//! - caller-registered operators

use std::collections::HashMap;

use serde_json::{json, Value};

use ferrite_mql::mql::registry::Predicate;
use ferrite_mql::{
    Aggregator, Collection, Engine, Lazy, MqlError, Operator, OperatorCategory, Options,
    ProcessingMode,
};

/// Route engine logs to the test harness; `RUST_LOG=ferrite_mql=trace` shows
/// stage materialization
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn orders() -> Vec<Value> {
    vec![
        json!({ "_id": 1, "customer": "ada", "item": "pen", "qty": 2, "price": 3.5, "tags": ["office"] }),
        json!({ "_id": 2, "customer": "bob", "item": "ink", "qty": 1, "price": 12, "tags": ["office", "refill"] }),
        json!({ "_id": 3, "customer": "ada", "item": "pad", "qty": 5, "price": 2, "tags": [] }),
        json!({ "_id": 4, "customer": "cy", "item": "pen", "qty": 10, "price": 3.5 }),
        json!({ "_id": 5, "customer": "bob", "item": "pad", "qty": 3, "price": 2, "tags": ["paper"] }),
    ]
}

// ============================================================================
// Find
// ============================================================================

#[test]
fn test_find_with_cursor_modifiers() {
    let engine = Engine::default();
    let out = engine
        .find(orders(), &json!({ "qty": { "$gte": 2 } }), Some(&json!({ "item": 1, "qty": 1 })))
        .unwrap()
        .sort(json!({ "qty": -1 }))
        .skip(1)
        .limit(2)
        .all()
        .unwrap();
    assert_eq!(
        out,
        vec![
            json!({ "_id": 3, "item": "pad", "qty": 5 }),
            json!({ "_id": 5, "item": "pad", "qty": 3 }),
        ]
    );
}

#[test]
fn test_find_logical_and_array_operators() {
    let engine = Engine::default();
    let count = |criteria: Value| engine.find(orders(), &criteria, None).unwrap().count().unwrap();

    assert_eq!(count(json!({ "tags": "office" })), 2);
    assert_eq!(count(json!({ "tags": { "$size": 0 } })), 1);
    assert_eq!(count(json!({ "tags": { "$exists": false } })), 1);
    assert_eq!(count(json!({ "$or": [{ "customer": "cy" }, { "price": { "$gt": 10 } }] })), 2);
    assert_eq!(count(json!({ "$expr": { "$gt": [{ "$multiply": ["$qty", "$price"] }, 10] } })), 2);
    assert_eq!(count(json!({ "item": { "$regex": "^P", "$options": "i" } })), 4);
}

#[test]
fn test_cursor_is_lazy_until_pulled() {
    let engine = Engine::default();
    let mut cursor = engine.find(orders(), &json!({}), None).unwrap().limit(1);
    assert_eq!(cursor.next().unwrap().unwrap()["_id"], json!(1));
    assert!(cursor.next().is_none());
}

// ============================================================================
// Aggregation
// ============================================================================

#[test]
fn test_sales_report_pipeline() {
    init_tracing();
    let engine = Engine::default();
    let out = engine
        .aggregate(
            orders(),
            &[
                json!({ "$match": { "qty": { "$gt": 1 } } }),
                json!({ "$addFields": { "total": { "$multiply": ["$qty", "$price"] } } }),
                json!({ "$group": {
                    "_id": "$customer",
                    "revenue": { "$sum": "$total" },
                    "items": { "$addToSet": "$item" },
                    "orders": { "$count": {} }
                } }),
                json!({ "$sort": { "revenue": -1 } }),
                json!({ "$project": { "_id": 0, "customer": "$_id", "revenue": 1, "orders": 1 } }),
            ],
        )
        .unwrap();
    assert_eq!(
        out,
        vec![
            json!({ "customer": "cy", "revenue": 35, "orders": 1 }),
            json!({ "customer": "ada", "revenue": 17, "orders": 2 }),
            json!({ "customer": "bob", "revenue": 6, "orders": 1 }),
        ]
    );
}

#[test]
fn test_unwind_then_count_tags() {
    let out = Engine::default()
        .aggregate(
            orders(),
            &[
                json!({ "$unwind": "$tags" }),
                json!({ "$sortByCount": "$tags" }),
            ],
        )
        .unwrap();
    assert_eq!(out[0], json!({ "_id": "office", "count": 2 }));
    assert_eq!(out.len(), 3);
}

#[test]
fn test_window_and_bucket_pipeline() {
    let out = Engine::default()
        .aggregate(
            orders(),
            &[
                json!({ "$setWindowFields": {
                    "partitionBy": "$customer",
                    "sortBy": { "_id": 1 },
                    "output": { "running": { "$sum": "$qty", "window": { "documents": ["unbounded", "current"] } } }
                } }),
                json!({ "$bucket": {
                    "groupBy": "$running",
                    "boundaries": [0, 5, 10, 100],
                    "output": { "ids": { "$push": "$_id" } }
                } }),
            ],
        )
        .unwrap();
    assert_eq!(
        out,
        vec![
            json!({ "_id": 0, "ids": [1, 2, 5] }),
            json!({ "_id": 5, "ids": [3] }),
            json!({ "_id": 10, "ids": [4] }),
        ]
    );
}

#[test]
fn test_pipeline_from_json_and_variables() {
    let engine = Engine::default();
    let pipeline = json!([
        { "$match": { "$expr": { "$eq": ["$customer", "$$who"] } } },
        { "$count": "n" }
    ]);
    let aggregator = Aggregator::from_json(&pipeline, &engine)
        .unwrap()
        .with_variables(vec![("who".to_string(), json!("bob"))]);
    assert_eq!(aggregator.len(), 2);
    assert_eq!(aggregator.run(orders()).unwrap(), vec![json!({ "n": 2 })]);

    assert!(Aggregator::from_json(&json!({ "$match": {} }), &engine).is_err());
}

#[test]
fn test_invalid_pipelines_fail_before_reading() {
    let engine = Engine::default();
    let pulled = std::rc::Rc::new(std::cell::Cell::new(0));
    let counter = pulled.clone();
    let source = Lazy::from_fn(move || {
        counter.set(counter.get() + 1);
        Some(json!({ "v": 1 }))
    });

    let aggregator = engine
        .aggregator(&[json!({ "$limit": 1 }), json!({ "$group": { "total": { "$sum": 1 } } })])
        .unwrap();
    assert!(matches!(aggregator.stream(source), Err(MqlError::InvalidStage(_))));
    assert_eq!(pulled.get(), 0);

    let err = engine.aggregator(&[json!({ "$frobnicate": {} })]).unwrap_err();
    assert!(matches!(
        err,
        MqlError::UnknownOperator { category: OperatorCategory::Pipeline, .. }
    ));
    assert!(engine
        .aggregator(&[json!({ "$out": "x" }), json!({ "$limit": 1 })])
        .is_err());
}

#[test]
fn test_unbounded_source_with_limit() {
    let mut n = 0;
    let source = Lazy::from_fn(move || {
        n += 1;
        Some(json!({ "n": n }))
    });
    let out = Engine::default()
        .aggregate(
            source,
            &[json!({ "$match": { "n": { "$mod": [3, 0] } } }), json!({ "$limit": 3 })],
        )
        .unwrap();
    assert_eq!(out, vec![json!({ "n": 3 }), json!({ "n": 6 }), json!({ "n": 9 })]);
}

// ============================================================================
// Collections
// ============================================================================

fn engine_with(collections: &[(&str, &Collection)]) -> Engine {
    let table: HashMap<String, Collection> = collections
        .iter()
        .map(|(name, c)| (name.to_string(), (*c).clone()))
        .collect();
    Engine::new(Options::default().with_collection_resolver(move |name| table.get(name).cloned()))
}

#[test]
fn test_lookup_then_merge_into_sink() {
    init_tracing();
    let customers = Collection::from_docs(vec![
        json!({ "_id": "ada", "city": "London" }),
        json!({ "_id": "bob", "city": "Paris" }),
    ]);
    let report = Collection::from_docs(vec![json!({ "_id": "ada", "note": "vip" })]);
    let engine = engine_with(&[("customers", &customers), ("report", &report)]);

    let out = engine
        .aggregate(
            orders(),
            &[
                json!({ "$group": { "_id": "$customer", "qty": { "$sum": "$qty" } } }),
                json!({ "$lookup": { "from": "customers", "localField": "_id", "foreignField": "_id", "as": "who" } }),
                json!({ "$set": { "city": { "$ifNull": [{ "$arrayElemAt": ["$who.city", 0] }, "unknown"] } } }),
                json!({ "$unset": "who" }),
                json!({ "$merge": { "into": "report" } }),
            ],
        )
        .unwrap();
    assert!(out.is_empty());

    let mut rows = report.snapshot();
    rows.sort_by_key(|r| r["_id"].as_str().unwrap_or_default().to_string());
    assert_eq!(
        rows,
        vec![
            json!({ "_id": "ada", "note": "vip", "qty": 7, "city": "London" }),
            json!({ "_id": "bob", "qty": 4, "city": "Paris" }),
            json!({ "_id": "cy", "qty": 10, "city": "unknown" }),
        ]
    );
}

#[test]
fn test_processing_modes_for_live_collections() {
    let live = Collection::from_docs(vec![json!({ "v": 1 })]);

    let engine = Engine::default();
    let stream = engine.aggregator(&[]).unwrap().stream(live.clone()).unwrap();
    live.extend(vec![json!({ "v": 2 })]);
    assert_eq!(stream.value().unwrap().len(), 2);

    let engine = Engine::new(Options::default().with_processing_mode(ProcessingMode::Copy));
    let stream = engine.aggregator(&[]).unwrap().stream(live.clone()).unwrap();
    live.extend(vec![json!({ "v": 3 })]);
    assert_eq!(stream.value().unwrap().len(), 2);
}

#[test]
fn test_out_replaces_collection() {
    let archive = Collection::from_docs(vec![json!({ "old": true })]);
    let engine = engine_with(&[("archive", &archive)]);
    engine
        .aggregate(orders(), &[json!({ "$match": { "item": "pen" } }), json!({ "$out": "archive" })])
        .unwrap();
    assert_eq!(archive.len(), 2);
    assert!(archive.snapshot().iter().all(|d| d["item"] == json!("pen")));
}

// ============================================================================
// Configuration and extension
// ============================================================================

#[test]
fn test_options_from_json() {
    let options = Options::from_json(json!({
        "idKey": "id",
        "processingMode": "copy",
        "scriptEnabled": false,
        "collation": { "locale": "en", "strength": 1 }
    }))
    .unwrap();
    assert_eq!(options.id_key, "id");
    assert_eq!(options.processing_mode, ProcessingMode::Copy);
    assert!(!options.script_enabled);
    assert_eq!(options.collation.as_ref().map(|c| c.strength), Some(1));

    assert!(Options::from_json(json!({ "processingMode": "sometimes" })).is_err());
}

fn is_even(field: &str, _: &Value, _: &Engine) -> ferrite_mql::Result<Predicate> {
    let field = field.to_string();
    Ok(Box::new(move |doc, _| {
        Ok(doc.get(&field).and_then(Value::as_i64).is_some_and(|n| n % 2 == 0))
    }))
}

#[test]
fn test_custom_operators_in_every_layer() {
    let engine = Engine::builder()
        .register("$isEven", Operator::query(is_even))
        .unwrap()
        .register(
            "$product",
            Operator::accumulator(|members, args, ctx| {
                let mut product = 1.0;
                for v in ferrite_mql::mql::accumulator::project_members(members, args, ctx)? {
                    product *= v.as_f64().unwrap_or(1.0);
                }
                Ok(json!(product))
            }),
        )
        .unwrap()
        .register(
            "$tagAll",
            Operator::pipeline(|lazy, arg, _| {
                let tag = arg.clone();
                Ok(lazy.map(move |mut doc| {
                    if let Some(obj) = doc.as_object_mut() {
                        obj.insert("tag".into(), tag.clone());
                    }
                    Ok(doc)
                }))
            }),
        )
        .unwrap()
        .build();

    let out = engine
        .aggregate(
            orders(),
            &[
                json!({ "$match": { "qty": { "$isEven": true } } }),
                json!({ "$group": { "_id": null, "p": { "$product": "$qty" } } }),
                json!({ "$tagAll": "x" }),
            ],
        )
        .unwrap();
    assert_eq!(out, vec![json!({ "_id": null, "p": 20.0, "tag": "x" })]);

    assert!(Engine::default()
        .find(orders(), &json!({ "qty": { "$isEven": true } }), None)
        .is_err());
}

#[test]
fn test_engine_shared_across_threads() {
    let engine = Engine::default();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                engine
                    .aggregate(orders(), &[json!({ "$match": { "_id": { "$gt": i } } }), json!({ "$count": "n" })])
                    .unwrap()
            })
        })
        .collect();
    let counts: Vec<Value> = handles.into_iter().map(|h| h.join().unwrap()[0]["n"].clone()).collect();
    assert_eq!(counts, vec![json!(5), json!(4), json!(3), json!(2)]);
}
