//! Engine configuration
//!
//! `Options` is fixed for the lifetime of an [`Engine`](super::Engine). Data
//! fields deserialize from JSON (camelCase, like MongoDB driver options);
//! callbacks are attached with the `with_*` builder methods.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::collection::Collection;
use super::error::{MqlError, Result};
use super::value;

/// Computes the grouping key of a value
pub type HashFunction = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Resolves a collection name used by `$lookup`, `$unionWith`, `$out`, `$merge`
pub type CollectionResolver = Arc<dyn Fn(&str) -> Option<Collection> + Send + Sync>;

/// User callable invoked with `this` bound to the current document
pub type Script = Arc<dyn Fn(&Value, &[Value]) -> Result<Value> + Send + Sync>;

/// Compiled JSON schema check
pub type SchemaPredicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Compiles a `$jsonSchema` document into a predicate
pub type JsonSchemaValidator = Arc<dyn Fn(&Value) -> Result<SchemaPredicate> + Send + Sync>;

/// How documents read from a live [`Collection`] are isolated from later writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Read elements from the live collection as they are pulled
    #[default]
    None,
    /// Snapshot the collection when the stream is built
    Copy,
    /// Snapshot the collection when the stream is built (values are always deep copies)
    Deep,
}

/// String comparison rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Collation {
    /// Locale tag, kept for round-tripping; comparison is locale-neutral
    pub locale: String,
    /// 1-2 compare case-insensitively, 3+ compare exactly
    pub strength: u8,
    /// Compare runs of digits by numeric value
    pub numeric_ordering: bool,
}

impl Default for Collation {
    fn default() -> Self {
        Self {
            locale: "simple".to_string(),
            strength: 3,
            numeric_ordering: false,
        }
    }
}

impl Collation {
    /// Compare two strings under this collation
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        if self.strength <= 2 {
            let (a, b) = (a.to_lowercase(), b.to_lowercase());
            self.compare_exact(&a, &b)
        } else {
            self.compare_exact(a, b)
        }
    }

    fn compare_exact(&self, a: &str, b: &str) -> Ordering {
        if self.numeric_ordering {
            natural_compare(a, b)
        } else {
            a.cmp(b)
        }
    }
}

/// Compare strings treating digit runs as numbers
fn natural_compare(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let mut ln = String::new();
                while let Some(c) = left.peek().copied().filter(char::is_ascii_digit) {
                    ln.push(c);
                    left.next();
                }
                let mut rn = String::new();
                while let Some(c) = right.peek().copied().filter(char::is_ascii_digit) {
                    rn.push(c);
                    right.next();
                }
                let ln = ln.trim_start_matches('0');
                let rn = rn.trim_start_matches('0');
                let ord = ln.len().cmp(&rn.len()).then_with(|| ln.cmp(rn));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(l), Some(r)) => {
                let ord = l.cmp(&r);
                if ord != Ordering::Equal {
                    return ord;
                }
                left.next();
                right.next();
            }
        }
    }
}

/// Engine options
#[derive(Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    /// Name of the identifier field
    pub id_key: String,
    /// Collation applied by comparisons and sorting
    pub collation: Option<Collation>,
    /// Isolation of live collection reads
    pub processing_mode: ProcessingMode,
    /// Allows `$where`, `$function` and `$accumulator`
    pub script_enabled: bool,
    /// Custom grouping key function
    #[serde(skip)]
    pub hash_function: Option<HashFunction>,
    /// Resolves collection names
    #[serde(skip)]
    pub collection_resolver: Option<CollectionResolver>,
    /// Compiles `$jsonSchema` documents
    #[serde(skip)]
    pub json_schema_validator: Option<JsonSchemaValidator>,
    #[serde(skip)]
    scripts: HashMap<String, Script>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            id_key: "_id".to_string(),
            collation: None,
            processing_mode: ProcessingMode::None,
            script_enabled: true,
            hash_function: None,
            collection_resolver: None,
            json_schema_validator: None,
            scripts: HashMap::new(),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut scripts: Vec<&String> = self.scripts.keys().collect();
        scripts.sort();
        f.debug_struct("Options")
            .field("id_key", &self.id_key)
            .field("collation", &self.collation)
            .field("processing_mode", &self.processing_mode)
            .field("script_enabled", &self.script_enabled)
            .field("hash_function", &self.hash_function.is_some())
            .field("collection_resolver", &self.collection_resolver.is_some())
            .field("json_schema_validator", &self.json_schema_validator.is_some())
            .field("scripts", &scripts)
            .finish()
    }
}

impl Options {
    /// Parse the data fields from JSON; callbacks stay unset
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| MqlError::InvalidStage(format!("Invalid options: {}", e)))
    }

    /// Set the identifier field name
    pub fn with_id_key(mut self, id_key: impl Into<String>) -> Self {
        self.id_key = id_key.into();
        self
    }

    /// Set the collation
    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    /// Set the processing mode
    pub fn with_processing_mode(mut self, mode: ProcessingMode) -> Self {
        self.processing_mode = mode;
        self
    }

    /// Enable or disable user scripts
    pub fn with_script_enabled(mut self, enabled: bool) -> Self {
        self.script_enabled = enabled;
        self
    }

    /// Use a custom grouping key function
    pub fn with_hash_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.hash_function = Some(Arc::new(f));
        self
    }

    /// Resolve collection names with `f`
    pub fn with_collection_resolver<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Option<Collection> + Send + Sync + 'static,
    {
        self.collection_resolver = Some(Arc::new(f));
        self
    }

    /// Compile `$jsonSchema` documents with `f`
    pub fn with_json_schema_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<SchemaPredicate> + Send + Sync + 'static,
    {
        self.json_schema_validator = Some(Arc::new(f));
        self
    }

    /// Register a named script for `$where`, `$function` and `$accumulator`
    pub fn with_script<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.scripts.insert(name.into(), Arc::new(f));
        self
    }

    /// Look up a script, honouring the `script_enabled` gate
    pub fn script(&self, name: &str) -> Result<&Script> {
        if !self.script_enabled {
            return Err(MqlError::MissingConfiguration(
                "script execution is disabled (scriptEnabled = false)".into(),
            ));
        }
        self.scripts.get(name).ok_or_else(|| {
            MqlError::MissingConfiguration(format!("no script registered as '{}'", name))
        })
    }

    /// Resolve a collection by name
    pub fn resolve_collection(&self, name: &str) -> Result<Collection> {
        let resolver = self.collection_resolver.as_ref().ok_or_else(|| {
            MqlError::MissingConfiguration(format!(
                "collectionResolver is required to resolve collection '{}'",
                name
            ))
        })?;
        resolver(name).ok_or_else(|| {
            MqlError::MissingConfiguration(format!("collection '{}' could not be resolved", name))
        })
    }

    /// Grouping key of a value
    pub fn hash_key(&self, value: &Value) -> String {
        match &self.hash_function {
            Some(f) => f(value),
            None => value::encode_key(value),
        }
    }

    /// Compare two values with the configured collation
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        value::compare(a, b, self.collation.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_data_fields() {
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
        assert_eq!(options.collation.unwrap().strength, 1);
    }

    #[test]
    fn test_script_gate() {
        let options = Options::default()
            .with_script("yes", |_, _| Ok(json!(true)))
            .with_script_enabled(false);
        assert!(matches!(
            options.script("yes"),
            Err(MqlError::MissingConfiguration(_))
        ));

        let options = options.with_script_enabled(true);
        assert!(options.script("yes").is_ok());
        assert!(options.script("no").is_err());
    }

    #[test]
    fn test_collation_case_insensitive() {
        let collation = Collation {
            strength: 2,
            ..Default::default()
        };
        assert_eq!(collation.compare("abc", "ABC"), Ordering::Equal);
        assert_eq!(Collation::default().compare("abc", "ABC"), Ordering::Greater);
    }

    #[test]
    fn test_collation_numeric_ordering() {
        let collation = Collation {
            numeric_ordering: true,
            ..Default::default()
        };
        assert_eq!(collation.compare("item2", "item10"), Ordering::Less);
        assert_eq!(collation.compare("item010", "item10"), Ordering::Equal);
    }

    #[test]
    fn test_resolver_required() {
        let err = Options::default().resolve_collection("users").unwrap_err();
        assert!(matches!(err, MqlError::MissingConfiguration(_)));
    }
}
