//! Shared in-memory collection handle
//!
//! Collections are the only externally owned state the engine touches: they
//! are read by `$lookup`/`$unionWith` and written by `$out`/`$merge`. The
//! engine only appends, replaces or upserts documents it is handed; it never
//! exposes its own buffers through a collection.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// Cheaply cloneable handle to a vector of documents
#[derive(Debug, Clone, Default)]
pub struct Collection {
    docs: Arc<RwLock<Vec<Value>>>,
}

impl Collection {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection holding `docs`
    pub fn from_docs(docs: Vec<Value>) -> Self {
        Self {
            docs: Arc::new(RwLock::new(docs)),
        }
    }

    /// Number of documents
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Document at `index`, cloned out of the collection
    pub fn get(&self, index: usize) -> Option<Value> {
        self.docs.read().get(index).cloned()
    }

    /// Copy of every document
    pub fn snapshot(&self) -> Vec<Value> {
        self.docs.read().clone()
    }

    /// Append documents
    pub fn extend(&self, docs: impl IntoIterator<Item = Value>) {
        self.docs.write().extend(docs);
    }

    /// Replace the whole content
    pub fn replace_all(&self, docs: Vec<Value>) {
        *self.docs.write() = docs;
    }

    /// Index of the first document satisfying `f`
    pub fn position<F>(&self, f: F) -> Option<usize>
    where
        F: Fn(&Value) -> bool,
    {
        self.docs.read().iter().position(f)
    }

    /// Overwrite the document at `index`; returns false when out of range
    pub fn set(&self, index: usize, doc: Value) -> bool {
        match self.docs.write().get_mut(index) {
            Some(slot) => {
                *slot = doc;
                true
            }
            None => false,
        }
    }

    /// True when both handles point at the same storage
    pub fn ptr_eq(&self, other: &Collection) -> bool {
        Arc::ptr_eq(&self.docs, &other.docs)
    }
}

impl From<Vec<Value>> for Collection {
    fn from(docs: Vec<Value>) -> Self {
        Self::from_docs(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clones_share_storage() {
        let a = Collection::from_docs(vec![json!({ "x": 1 })]);
        let b = a.clone();
        b.extend(vec![json!({ "x": 2 })]);

        assert_eq!(a.len(), 2);
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn test_set_and_position() {
        let coll = Collection::from_docs(vec![json!({ "k": "a" }), json!({ "k": "b" })]);
        let idx = coll.position(|d| d["k"] == "b").unwrap();
        assert!(coll.set(idx, json!({ "k": "c" })));
        assert!(!coll.set(9, json!({})));
        assert_eq!(coll.get(1), Some(json!({ "k": "c" })));
    }
}
