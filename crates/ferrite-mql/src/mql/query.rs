//! Query compiler and cursor

use serde_json::{Map, Value};
use tracing::trace;

use super::aggregation::Aggregator;
use super::context::Context;
use super::error::{MqlError, OperatorCategory, Result};
use super::expression::{evaluate, Expr};
use super::lazy::{DocumentSource, Lazy};
use super::projection::Projection;
use super::registry::Predicate;
use super::value;
use super::Engine;

/// Compiled query criteria
///
/// `test` is the short-circuit conjunction of the compiled predicates in
/// declared order; `$where` predicates always run last.
pub struct Query {
    engine: Engine,
    predicates: Vec<Predicate>,
    deferred: Vec<Predicate>,
}

impl Query {
    /// Compile `criteria`
    pub fn new(criteria: &Value, engine: &Engine) -> Result<Self> {
        let map = criteria
            .as_object()
            .ok_or_else(|| MqlError::InvalidQuery("query criteria must be an object".into()))?;

        let mut predicates = Vec::with_capacity(map.len());
        let mut deferred = Vec::new();

        for (key, operand) in map {
            match key.as_str() {
                "$and" | "$or" | "$nor" => predicates.push(logical(key, operand, engine)?),
                "$expr" => predicates.push(expr_predicate(operand, engine)?),
                "$where" => deferred.push(where_predicate(operand, engine)?),
                "$jsonSchema" => predicates.push(schema_predicate(operand, engine)?),
                "$comment" => {}
                k if k.starts_with('$') => {
                    return Err(MqlError::unknown(OperatorCategory::Query, k))
                }
                field => predicates.extend(compile_field(field, operand, engine)?),
            }
        }

        Ok(Self {
            engine: engine.clone(),
            predicates,
            deferred,
        })
    }

    /// Check a document
    pub fn test(&self, doc: &Value) -> Result<bool> {
        self.test_with(doc, &Context::new(&self.engine, doc))
    }

    /// Check a document with caller-provided variables
    pub fn test_with(&self, doc: &Value, ctx: &Context<'_>) -> Result<bool> {
        for predicate in self.predicates.iter().chain(self.deferred.iter()) {
            if !predicate(doc, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Open a cursor over the matching documents of `source`
    pub fn find(self, source: impl Into<DocumentSource>, projection: Option<&Value>) -> Result<Cursor> {
        let projection = projection
            .map(|spec| Projection::new(spec, &self.engine))
            .transpose()?;
        let mode = self.engine.options().processing_mode;
        Ok(Cursor {
            state: CursorState::Pending(Box::new(Pending {
                source: source.into().into_lazy(mode),
                query: self,
                projection,
                sort: None,
                skip: 0,
                limit: None,
            })),
        })
    }
}

/// Compile the operators of one field, combining `$regex` with `$options`
pub(crate) fn compile_operators(
    field: &str,
    operators: &Map<String, Value>,
    engine: &Engine,
) -> Result<Vec<Predicate>> {
    let registry = engine.registry();
    let mut out = Vec::with_capacity(operators.len());

    for (name, operand) in operators {
        let operand = match name.as_str() {
            "$options" if operators.contains_key("$regex") => continue,
            "$regex" => match operators.get("$options") {
                Some(options) => {
                    let pattern = match operand {
                        Value::Object(m) => m.get("$regex").cloned().unwrap_or(Value::Null),
                        other => other.clone(),
                    };
                    let mut combined = Map::new();
                    combined.insert("$regex".to_string(), pattern);
                    combined.insert("$options".to_string(), options.clone());
                    Value::Object(combined)
                }
                None => operand.clone(),
            },
            _ => operand.clone(),
        };
        let op = registry
            .query(name)
            .ok_or_else(|| MqlError::unknown(OperatorCategory::Query, name.as_str()))?;
        out.push(op(field, &operand, engine)?);
    }
    Ok(out)
}

fn compile_field(field: &str, operand: &Value, engine: &Engine) -> Result<Vec<Predicate>> {
    if let Value::Object(map) = operand {
        let operator_keys = map.keys().filter(|k| k.starts_with('$')).count();
        if operator_keys > 0 && !value::is_date(operand) {
            if operator_keys != map.len() {
                return Err(MqlError::InvalidQuery(format!(
                    "field '{}' mixes operators and plain keys",
                    field
                )));
            }
            return compile_operators(field, map, engine);
        }
    }

    let eq = engine
        .registry()
        .query("$eq")
        .ok_or_else(|| MqlError::unknown(OperatorCategory::Query, "$eq"))?;
    Ok(vec![eq(field, operand, engine)?])
}

fn logical(op: &str, operand: &Value, engine: &Engine) -> Result<Predicate> {
    let items = operand
        .as_array()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| MqlError::InvalidQuery(format!("{} needs a non-empty array", op)))?;
    let queries: Vec<Query> = items
        .iter()
        .map(|item| Query::new(item, engine))
        .collect::<Result<_>>()?;

    let predicate: Predicate = match op {
        "$and" => Box::new(move |doc, ctx| {
            for q in &queries {
                if !q.test_with(doc, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }),
        "$or" => Box::new(move |doc, ctx| {
            for q in &queries {
                if q.test_with(doc, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }),
        _ => Box::new(move |doc, ctx| {
            for q in &queries {
                if q.test_with(doc, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }),
    };
    Ok(predicate)
}

fn expr_predicate(operand: &Value, engine: &Engine) -> Result<Predicate> {
    let expr = Expr::compile(operand, engine)?;
    Ok(Box::new(move |doc, ctx| {
        Ok(value::truthy(&evaluate(doc, &expr, &ctx.with_root(doc))?))
    }))
}

fn where_predicate(operand: &Value, engine: &Engine) -> Result<Predicate> {
    let name = operand
        .as_str()
        .ok_or_else(|| MqlError::InvalidQuery("$where needs a script name".into()))?;
    let script = engine.options().script(name)?.clone();
    Ok(Box::new(move |doc, _| Ok(value::truthy(&script(doc, &[])?))))
}

fn schema_predicate(operand: &Value, engine: &Engine) -> Result<Predicate> {
    let validator = engine.options().json_schema_validator.as_ref().ok_or_else(|| {
        MqlError::MissingConfiguration("$jsonSchema requires a jsonSchemaValidator".into())
    })?;
    let check = validator(operand)?;
    Ok(Box::new(move |doc, _| Ok(check(doc))))
}

struct Pending {
    source: Lazy,
    query: Query,
    projection: Option<Projection>,
    sort: Option<Value>,
    skip: usize,
    limit: Option<usize>,
}

enum CursorState {
    Pending(Box<Pending>),
    Open(Lazy),
}

/// Lazily evaluated result of [`Query::find`]
///
/// Nothing is read from the source until the first pull; `sort`, `skip` and
/// `limit` may be chained until then.
pub struct Cursor {
    state: CursorState,
}

impl Cursor {
    fn pending(&mut self) -> Option<&mut Pending> {
        match &mut self.state {
            CursorState::Pending(p) => Some(p),
            CursorState::Open(_) => None,
        }
    }

    /// Sort by a `{field: 1 | -1}` specification
    pub fn sort(mut self, spec: Value) -> Self {
        if let Some(p) = self.pending() {
            p.sort = Some(spec);
        }
        self
    }

    /// Skip the first `n` matches
    pub fn skip(mut self, n: usize) -> Self {
        if let Some(p) = self.pending() {
            p.skip = n;
        }
        self
    }

    /// Return at most `n` matches
    pub fn limit(mut self, n: usize) -> Self {
        if let Some(p) = self.pending() {
            p.limit = Some(n);
        }
        self
    }

    /// Every remaining document
    pub fn all(self) -> Result<Vec<Value>> {
        self.collect()
    }

    /// Number of remaining documents
    pub fn count(self) -> Result<usize> {
        Ok(self.all()?.len())
    }

    fn open(pending: Pending) -> Result<Lazy> {
        let Pending {
            source,
            query,
            projection,
            sort,
            skip,
            limit,
        } = pending;
        let engine = query.engine.clone();

        let mut stages = Vec::new();
        if let Some(spec) = sort {
            let mut stage = Map::new();
            stage.insert("$sort".to_string(), spec);
            stages.push(Value::Object(stage));
        }
        trace!(stages = stages.len(), skip, ?limit, "opening cursor");

        let filtered = source.filter(move |doc| query.test(doc));
        let mut lazy = Aggregator::new(&stages, &engine)?.stream(filtered)?.skip(skip);
        if let Some(n) = limit {
            lazy = lazy.take(n);
        }
        if let Some(projection) = projection {
            lazy = lazy.map(move |doc| projection.apply(&doc, &Context::new(&engine, &doc)));
        }
        Ok(lazy)
    }
}

impl Iterator for Cursor {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if let CursorState::Pending(_) = self.state {
            let state = std::mem::replace(&mut self.state, CursorState::Open(Lazy::empty()));
            if let CursorState::Pending(pending) = state {
                match Self::open(*pending) {
                    Ok(lazy) => self.state = CursorState::Open(lazy),
                    Err(e) => return Some(Err(e)),
                }
            }
        }
        match &mut self.state {
            CursorState::Open(lazy) => lazy.next(),
            CursorState::Pending(_) => None,
        }
    }
}
