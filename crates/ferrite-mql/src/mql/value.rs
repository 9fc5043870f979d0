//! Document value helpers
//!
//! Documents are plain `serde_json::Value` trees. This module adds what JSON
//! lacks for a MongoDB-style engine: BSON type classification (dates and
//! regexes are recognised in their extended-JSON form), the cross-type sort
//! order, dotted path access, and canonical grouping keys.

use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use super::options::Collation;

/// Largest integer a double represents exactly
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// BSON types for `$type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BsonType {
    /// Double
    Double = 1,
    /// String
    String = 2,
    /// Embedded document
    Object = 3,
    /// Array
    Array = 4,
    /// Boolean
    Boolean = 8,
    /// Date (`{"$date": ...}`)
    Date = 9,
    /// Null
    Null = 10,
    /// Regular expression (`{"$regex": ...}`)
    Regex = 11,
    /// 32-bit integer
    Int32 = 16,
    /// 64-bit integer
    Int64 = 18,
}

impl BsonType {
    /// Parse a `$type` alias
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "double" => Some(Self::Double),
            "string" => Some(Self::String),
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "bool" => Some(Self::Boolean),
            "date" => Some(Self::Date),
            "null" => Some(Self::Null),
            "regex" => Some(Self::Regex),
            "int" => Some(Self::Int32),
            "long" => Some(Self::Int64),
            _ => None,
        }
    }

    /// Parse a numeric `$type` code
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Double),
            2 => Some(Self::String),
            3 => Some(Self::Object),
            4 => Some(Self::Array),
            8 => Some(Self::Boolean),
            9 => Some(Self::Date),
            10 => Some(Self::Null),
            11 => Some(Self::Regex),
            16 => Some(Self::Int32),
            18 => Some(Self::Int64),
            _ => None,
        }
    }

    /// Alias reported by the `$type` expression
    pub fn name(&self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::String => "string",
            Self::Object => "object",
            Self::Array => "array",
            Self::Boolean => "bool",
            Self::Date => "date",
            Self::Null => "null",
            Self::Regex => "regex",
            Self::Int32 => "int",
            Self::Int64 => "long",
        }
    }

    /// True for the numeric types
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Double | Self::Int32 | Self::Int64)
    }

    /// Position in the cross-type comparison order
    pub(crate) fn sort_rank(&self) -> u8 {
        match self {
            Self::Null => 1,
            Self::Double | Self::Int32 | Self::Int64 => 2,
            Self::String => 3,
            Self::Object => 4,
            Self::Array => 5,
            Self::Boolean => 7,
            Self::Date => 8,
            Self::Regex => 9,
        }
    }
}

/// Classify a value
pub fn type_of(value: &Value) -> BsonType {
    match value {
        Value::Null => BsonType::Null,
        Value::Bool(_) => BsonType::Boolean,
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i32::try_from(i).is_ok() {
                    BsonType::Int32
                } else {
                    BsonType::Int64
                }
            } else if n.is_u64() {
                BsonType::Int64
            } else {
                BsonType::Double
            }
        }
        Value::String(_) => BsonType::String,
        Value::Array(_) => BsonType::Array,
        Value::Object(_) if is_date(value) => BsonType::Date,
        Value::Object(_) if is_regex(value) => BsonType::Regex,
        Value::Object(_) => BsonType::Object,
    }
}

/// True for `{"$date": <string | millis>}`
pub fn is_date(value: &Value) -> bool {
    match value {
        Value::Object(map) if map.len() == 1 => {
            matches!(map.get("$date"), Some(Value::String(_) | Value::Number(_)))
        }
        _ => false,
    }
}

/// True for `{"$regex": <string>[, "$options": <string>]}`
pub fn is_regex(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            matches!(map.get("$regex"), Some(Value::String(_)))
                && map.keys().all(|k| k == "$regex" || k == "$options")
        }
        _ => false,
    }
}

/// Decode an extended-JSON date
pub fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    match value.as_object()?.get("$date")? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => DateTime::from_timestamp_millis(n.as_i64()?),
        _ => None,
    }
}

/// Encode a date in extended JSON
pub fn date_value(dt: DateTime<Utc>) -> Value {
    let mut map = Map::new();
    map.insert(
        "$date".to_string(),
        Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Value::Object(map)
}

/// Numeric view of a value; dates map to epoch milliseconds
pub fn as_ordinal(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => as_date(value).map(|dt| dt.timestamp_millis() as f64),
    }
}

/// Numeric value of a JSON number
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Build a JSON number, keeping integral results as integers
pub fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Truthiness as used by `$cond`, `$and`, `$expr`, ...
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        _ => true,
    }
}

/// Total order across types (null < numbers < strings < objects < arrays <
/// booleans < dates < regexes)
pub fn compare(a: &Value, b: &Value, collation: Option<&Collation>) -> Ordering {
    let (ta, tb) = (type_of(a), type_of(b));
    let rank = ta.sort_rank().cmp(&tb.sort_rank());
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i.cmp(&j),
            _ => {
                let (fx, fy) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
                fx.partial_cmp(&fy).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => match collation {
            Some(c) => c.compare(x, y),
            None => x.cmp(y),
        },
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare(l, r, collation);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => match ta {
            BsonType::Date => {
                let mx = as_date(a).map(|d| d.timestamp_millis());
                let my = as_date(b).map(|d| d.timestamp_millis());
                mx.cmp(&my)
            }
            BsonType::Regex => a.to_string().cmp(&b.to_string()),
            _ => {
                for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                    let ord = kx.cmp(ky).then_with(|| compare(vx, vy, collation));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                x.len().cmp(&y.len())
            }
        },
        _ => Ordering::Equal,
    }
}

/// Compare optional values, treating absent as null
pub fn compare_opt(a: Option<&Value>, b: Option<&Value>, collation: Option<&Collation>) -> Ordering {
    compare(a.unwrap_or(&Value::Null), b.unwrap_or(&Value::Null), collation)
}

/// Deep equality where `1 == 1.0`
pub fn equals(a: &Value, b: &Value) -> bool {
    compare(a, b, None) == Ordering::Equal
}

/// Canonical key used to group equal values
pub fn encode_key(value: &Value) -> String {
    canonical(value).to_string()
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => n.as_f64().map(number).unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonical(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a dotted path. Arrays are indexed by numeric segments and
/// otherwise traversed element-wise; `None` means the path is absent.
pub fn resolve(doc: &Value, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    resolve_segments(doc, &segments)
}

fn resolve_segments(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value.clone());
    };

    match value {
        Value::Object(map) => resolve_segments(map.get(*head)?, rest),
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                return resolve_segments(items.get(index)?, rest);
            }
            let values: Vec<Value> = items
                .iter()
                .filter(|item| item.is_object() || item.is_array())
                .filter_map(|item| resolve_segments(item, segments))
                .collect();
            if values.is_empty() {
                None
            } else {
                Some(Value::Array(values))
            }
        }
        _ => None,
    }
}

/// Set a dotted path, creating intermediate objects. A non-numeric segment
/// applied to an array sets the field on every object element.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    set_segments(doc, &segments, value);
}

fn set_segments(target: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *target = value;
        return;
    };

    if let Value::Array(items) = target {
        match head.parse::<usize>() {
            Ok(index) => {
                if let Some(item) = items.get_mut(index) {
                    set_segments(item, rest, value);
                }
            }
            Err(_) => {
                for item in items.iter_mut().filter(|item| item.is_object()) {
                    set_segments(item, segments, value.clone());
                }
            }
        }
        return;
    }

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };
    let child = map.entry(head.to_string()).or_insert(Value::Null);
    set_segments(child, rest, value);
}

/// Remove a dotted path; arrays are traversed element-wise
pub fn remove_path(doc: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    remove_segments(doc, &segments);
}

fn remove_segments(target: &mut Value, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };

    match target {
        Value::Object(map) => {
            if rest.is_empty() {
                map.shift_remove(*head);
            } else if let Some(child) = map.get_mut(*head) {
                remove_segments(child, rest);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                remove_segments(item, segments);
            }
        }
        _ => {}
    }
}
