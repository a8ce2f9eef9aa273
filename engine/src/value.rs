//! Dynamic row values. Tables carry open records: each row is an owned,
//! insertion-ordered mapping from column name to a tagged [`Value`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A row of table data. Iteration order is insertion order; rows that have
/// passed [`crate::schema::StructType::normalize_row`] iterate in schema order.
pub type Row = IndexMap<String, Value>;

/// A single dynamically-typed value.
///
/// The serde representation is untagged: scalars serialize as their natural
/// JSON form. `Timestamp` and `Bytes` are never produced by deserialization
/// (they parse as `Integer`/`Array`); schema-directed coercion via
/// [`Value::coerce`] restores them where the column type calls for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    /// Nanoseconds since the unix epoch
    Timestamp(i64),
    String(String),
    Array(Vec<Value>),
    Bytes(Vec<u8>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Human-readable name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Timestamp(_) => "timestamp",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Bytes(_) => "bytes",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) | Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) | Value::Timestamp(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Render the value for use in a Hive-style partition path segment.
    pub fn to_partition_string(&self) -> String {
        match self {
            Value::Null => "__HIVE_DEFAULT_PARTITION__".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(v) | Value::Timestamp(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

/// Compare two values of compatible types. Numeric variants compare across
/// `Integer`/`Float`/`Timestamp`; everything else compares within its own
/// variant. Incomparable pairs (and nulls) return `None`, which zone-map
/// pruning treats as "cannot decide".
pub fn value_cmp(left: &Value, right: &Value) -> Option<Ordering> {
    use Value::*;
    match (left, right) {
        (Null, _) | (_, Null) => None,
        (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
        (Integer(a), Integer(b)) | (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
        (Integer(a), Timestamp(b)) | (Timestamp(a), Integer(b)) => Some(a.cmp(b)),
        (String(a), String(b)) => Some(a.cmp(b)),
        (Bytes(a), Bytes(b)) => Some(a.cmp(b)),
        (a, b) => {
            let (a, b) = (a.as_f64()?, b.as_f64()?);
            a.partial_cmp(&b)
        }
    }
}

/// Equality for filter evaluation: `value_cmp` equality, with `Null == Null`.
pub fn value_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        _ => value_cmp(left, right) == Some(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_round_trip() {
        let row: Row = [
            ("id".to_string(), Value::Integer(7)),
            ("name".to_string(), Value::String("x".to_string())),
            ("score".to_string(), Value::Float(1.5)),
            ("ok".to_string(), Value::Boolean(true)),
            ("missing".to_string(), Value::Null),
        ]
        .into_iter()
        .collect();
        let text = serde_json::to_string(&row).unwrap();
        let back: Row = serde_json::from_str(&text).unwrap();
        assert_eq!(row, back);
    }

    #[test]
    fn timestamp_serializes_as_integer() {
        let text = serde_json::to_string(&Value::Timestamp(1_000)).unwrap();
        assert_eq!(text, "1000");
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, Value::Integer(1_000));
    }

    #[test]
    fn cross_type_numeric_comparison() {
        assert_eq!(
            value_cmp(&Value::Integer(2), &Value::Float(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            value_cmp(&Value::Float(3.0), &Value::Integer(3)),
            Some(Ordering::Equal)
        );
        assert_eq!(value_cmp(&Value::Null, &Value::Integer(0)), None);
        assert_eq!(
            value_cmp(&Value::String("a".into()), &Value::Integer(0)),
            None
        );
    }
}
