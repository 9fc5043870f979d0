//! Lazy pull-based document sequence
//!
//! A [`Lazy`] wraps one of a closed set of sources (array, iterator, pull
//! function, live collection) and applies its staged `map`/`filter`/`take`/
//! `skip` steps to each element as it is pulled, in the order they were
//! declared. Stages that need the whole upstream (sort, group, facet, ...) go
//! through [`Lazy::transform`], which materializes on the first pull.

use std::fmt;

use serde_json::Value;

use super::collection::Collection;
use super::error::{MqlError, Result};
use super::options::ProcessingMode;

type MapFn = Box<dyn FnMut(Value) -> Result<Value>>;
type FilterFn = Box<dyn FnMut(&Value) -> Result<bool>>;
type TransformFn = Box<dyn FnOnce(Vec<Value>) -> Result<Vec<Value>>>;

enum Source {
    Array(std::vec::IntoIter<Value>),
    Iter(Box<dyn Iterator<Item = Value>>),
    Pull(Box<dyn FnMut() -> Option<Value>>),
    Results(Box<dyn Iterator<Item = Result<Value>>>),
    Live {
        collection: Collection,
        position: usize,
    },
    Deferred {
        upstream: Box<Lazy>,
        transform: Option<TransformFn>,
        buffer: std::vec::IntoIter<Value>,
    },
}

impl Source {
    fn pull(&mut self) -> Option<Result<Value>> {
        match self {
            Source::Array(iter) => iter.next().map(Ok),
            Source::Iter(iter) => iter.next().map(Ok),
            Source::Pull(f) => f().map(Ok),
            Source::Results(iter) => iter.next(),
            Source::Live {
                collection,
                position,
            } => {
                let doc = collection.get(*position)?;
                *position += 1;
                Some(Ok(doc))
            }
            Source::Deferred {
                upstream,
                transform,
                buffer,
            } => {
                if let Some(f) = transform.take() {
                    let docs = match upstream.as_mut().collect::<Result<Vec<Value>>>() {
                        Ok(docs) => docs,
                        Err(e) => return Some(Err(e)),
                    };
                    match f(docs) {
                        Ok(out) => *buffer = out.into_iter(),
                        Err(e) => return Some(Err(e)),
                    }
                }
                buffer.next().map(Ok)
            }
        }
    }
}

enum Step {
    Map(MapFn),
    Filter(FilterFn),
    Take(usize),
    Skip(usize),
}

enum Flow {
    Yield(Value),
    Reject,
    Fail(MqlError),
}

/// Lazy document sequence
pub struct Lazy {
    source: Source,
    steps: Vec<Step>,
    done: bool,
}

impl Lazy {
    fn with_source(source: Source) -> Self {
        Self {
            source,
            steps: Vec::new(),
            done: false,
        }
    }

    /// Sequence over an owned array
    pub fn from_vec(docs: Vec<Value>) -> Self {
        Self::with_source(Source::Array(docs.into_iter()))
    }

    /// Sequence over any iterator of documents
    pub fn from_iterator<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: 'static,
    {
        Self::with_source(Source::Iter(Box::new(iter.into_iter())))
    }

    /// Sequence produced by a pull function; `None` ends it
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut() -> Option<Value> + 'static,
    {
        Self::with_source(Source::Pull(Box::new(f)))
    }

    /// Sequence over fallible items; the first `Err` ends it
    pub fn from_results<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Result<Value>>,
        I::IntoIter: 'static,
    {
        Self::with_source(Source::Results(Box::new(iter.into_iter())))
    }

    /// Sequence over a shared collection
    ///
    /// With [`ProcessingMode::None`] elements are read from the live
    /// collection as they are pulled; otherwise the collection is copied now.
    pub fn from_collection(collection: &Collection, mode: ProcessingMode) -> Self {
        match mode {
            ProcessingMode::None => Self::with_source(Source::Live {
                collection: collection.clone(),
                position: 0,
            }),
            ProcessingMode::Copy | ProcessingMode::Deep => Self::from_vec(collection.snapshot()),
        }
    }

    /// Empty sequence
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Transform each element
    pub fn map<F>(mut self, f: F) -> Self
    where
        F: FnMut(Value) -> Result<Value> + 'static,
    {
        self.steps.push(Step::Map(Box::new(f)));
        self
    }

    /// Keep elements for which `f` returns true
    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Value) -> Result<bool> + 'static,
    {
        self.steps.push(Step::Filter(Box::new(f)));
        self
    }

    /// Yield at most `n` elements
    pub fn take(mut self, n: usize) -> Self {
        self.steps.push(Step::Take(n));
        self
    }

    /// Drop the first `n` elements
    pub fn skip(mut self, n: usize) -> Self {
        if n > 0 {
            self.steps.push(Step::Skip(n));
        }
        self
    }

    /// Replace the sequence with `f` applied to all of it. Nothing is pulled
    /// until the result is.
    pub fn transform<F>(self, f: F) -> Self
    where
        F: FnOnce(Vec<Value>) -> Result<Vec<Value>> + 'static,
    {
        Self::with_source(Source::Deferred {
            upstream: Box::new(self),
            transform: Some(Box::new(f)),
            buffer: Vec::new().into_iter(),
        })
    }

    /// Restrict to the first realized element; no further staging is possible
    pub fn first(self) -> First {
        First {
            inner: self,
            yielded: false,
        }
    }

    /// Pull everything
    pub fn value(self) -> Result<Vec<Value>> {
        self.collect()
    }

    fn apply(&mut self, mut value: Value) -> Flow {
        let mut index = 0;
        while index < self.steps.len() {
            match &mut self.steps[index] {
                Step::Map(f) => match f(value) {
                    Ok(v) => value = v,
                    Err(e) => return Flow::Fail(e),
                },
                Step::Filter(f) => match f(&value) {
                    Ok(true) => {}
                    Ok(false) => return Flow::Reject,
                    Err(e) => return Flow::Fail(e),
                },
                Step::Take(remaining) => {
                    if *remaining == 0 {
                        self.done = true;
                        return Flow::Reject;
                    }
                    *remaining -= 1;
                    if *remaining == 0 {
                        self.done = true;
                    }
                }
                Step::Skip(remaining) => {
                    *remaining -= 1;
                    if *remaining == 0 {
                        self.steps.remove(index);
                    }
                    return Flow::Reject;
                }
            }
            index += 1;
        }
        Flow::Yield(value)
    }
}

impl Iterator for Lazy {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let value = match self.source.pull() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Ok(value)) => value,
            };
            match self.apply(value) {
                Flow::Yield(value) => return Some(Ok(value)),
                Flow::Reject => continue,
                Flow::Fail(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl From<Vec<Value>> for Lazy {
    fn from(docs: Vec<Value>) -> Self {
        Self::from_vec(docs)
    }
}

impl fmt::Debug for Lazy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy")
            .field("steps", &self.steps.len())
            .field("done", &self.done)
            .finish()
    }
}

/// Anything a pipeline or cursor can read documents from
pub enum DocumentSource {
    /// Owned documents
    Documents(Vec<Value>),
    /// Shared collection, read according to the processing mode
    Collection(Collection),
    /// Already-built sequence
    Lazy(Lazy),
}

impl DocumentSource {
    /// Open the source
    pub fn into_lazy(self, mode: ProcessingMode) -> Lazy {
        match self {
            Self::Documents(docs) => Lazy::from_vec(docs),
            Self::Collection(collection) => Lazy::from_collection(&collection, mode),
            Self::Lazy(lazy) => lazy,
        }
    }
}

impl From<Vec<Value>> for DocumentSource {
    fn from(docs: Vec<Value>) -> Self {
        Self::Documents(docs)
    }
}

impl From<&[Value]> for DocumentSource {
    fn from(docs: &[Value]) -> Self {
        Self::Documents(docs.to_vec())
    }
}

impl From<Collection> for DocumentSource {
    fn from(collection: Collection) -> Self {
        Self::Collection(collection)
    }
}

impl From<&Collection> for DocumentSource {
    fn from(collection: &Collection) -> Self {
        Self::Collection(collection.clone())
    }
}

impl From<Lazy> for DocumentSource {
    fn from(lazy: Lazy) -> Self {
        Self::Lazy(lazy)
    }
}

/// A [`Lazy`] restricted to its first element
pub struct First {
    inner: Lazy,
    yielded: bool,
}

impl First {
    /// The first element, if any
    pub fn value(mut self) -> Result<Option<Value>> {
        self.next().transpose()
    }
}

impl Iterator for First {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.yielded {
            return None;
        }
        self.yielded = true;
        self.inner.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    fn numbers(n: i64) -> Vec<Value> {
        (0..n).map(|i| json!(i)).collect()
    }

    #[test]
    fn test_steps_apply_in_declaration_order() {
        let out = Lazy::from_vec(numbers(10))
            .filter(|v| Ok(v.as_i64().unwrap() % 2 == 0))
            .skip(1)
            .map(|v| Ok(json!(v.as_i64().unwrap() * 10)))
            .take(2)
            .value()
            .unwrap();
        assert_eq!(out, vec![json!(20), json!(40)]);
    }

    #[test]
    fn test_take_zero_yields_nothing() {
        assert!(Lazy::from_vec(numbers(3)).take(0).value().unwrap().is_empty());
    }

    #[test]
    fn test_take_stops_unbounded_source() {
        let mut i = 0;
        let out = Lazy::from_fn(move || {
            i += 1;
            Some(json!(i))
        })
        .take(3)
        .value()
        .unwrap();
        assert_eq!(out, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_null_documents_are_not_end_of_sequence() {
        let out = Lazy::from_vec(vec![Value::Null, json!(1), Value::Null])
            .value()
            .unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_transform_is_deferred() {
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        let lazy = Lazy::from_vec(numbers(3)).transform(move |mut docs| {
            seen.set(seen.get() + 1);
            docs.reverse();
            Ok(docs)
        });
        assert_eq!(calls.get(), 0);

        let out = lazy.value().unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(out, vec![json!(2), json!(1), json!(0)]);
    }

    #[test]
    fn test_first() {
        let first = Lazy::from_vec(numbers(5)).skip(2).first();
        assert_eq!(first.value().unwrap(), Some(json!(2)));
        assert_eq!(Lazy::empty().first().value().unwrap(), None);
    }

    #[test]
    fn test_error_terminates_sequence() {
        let mut lazy = Lazy::from_vec(numbers(3)).map(|v| {
            if v == json!(1) {
                Err(MqlError::Type("boom".into()))
            } else {
                Ok(v)
            }
        });
        assert!(lazy.next().unwrap().is_ok());
        assert!(lazy.next().unwrap().is_err());
        assert!(lazy.next().is_none());
    }

    #[test]
    fn test_live_collection_sees_later_writes() {
        let coll = Collection::from_docs(numbers(1));
        let mut live = Lazy::from_collection(&coll, ProcessingMode::None);
        let mut copied = Lazy::from_collection(&coll, ProcessingMode::Copy);
        coll.extend(vec![json!(1)]);

        assert_eq!(live.by_ref().count(), 2);
        assert_eq!(copied.by_ref().count(), 1);
    }
}
