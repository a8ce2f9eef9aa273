//! Table schemas and the Delta `schemaString` representation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{DeltaResult, Error};
use crate::value::{Row, Value};

/// A primitive column type. Serialized with the Delta type names
/// (`"integer"`, `"long"`, `"string"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Integer,
    Long,
    Float,
    Double,
    String,
    Binary,
    Timestamp,
}

impl DataType {
    /// Whether `value` inhabits this type after [`coerce`](Self::coerce).
    fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (DataType::Boolean, Value::Boolean(_))
                | (DataType::Integer | DataType::Long, Value::Integer(_))
                | (DataType::Float | DataType::Double, Value::Float(_))
                | (DataType::String, Value::String(_))
                | (DataType::Binary, Value::Bytes(_))
                | (DataType::Timestamp, Value::Timestamp(_))
        )
    }

    /// Coerce a parsed value into this type. JSON deserialization cannot
    /// distinguish timestamps from integers or binary from integer arrays, so
    /// rows that enter through the untagged codec pass through here.
    pub fn coerce(&self, value: Value) -> DeltaResult<Value> {
        let coerced = match (self, value) {
            (DataType::Timestamp, Value::Integer(v)) => Value::Timestamp(v),
            (DataType::Float | DataType::Double, Value::Integer(v)) => Value::Float(v as f64),
            (DataType::Binary, Value::Array(items)) => {
                let bytes = items
                    .into_iter()
                    .map(|item| match item {
                        Value::Integer(b) if (0..=255).contains(&b) => Ok(b as u8),
                        other => Err(Error::validation(format!(
                            "binary column element must be a byte, got {}",
                            other.type_name()
                        ))),
                    })
                    .collect::<DeltaResult<Vec<u8>>>()?;
                Value::Bytes(bytes)
            }
            (_, value) => value,
        };
        if self.accepts(&coerced) {
            Ok(coerced)
        } else {
            Err(Error::validation(format!(
                "value of type {} does not match column type {:?}",
                coerced.type_name(),
                self
            )))
        }
    }
}

/// A field inside a [`StructType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructField {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub nullable: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StructField {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
            metadata: HashMap::new(),
        }
    }
}

/// A table schema: an ordered collection of named, typed, nullable fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructType {
    #[serde(rename = "type")]
    type_name: String,
    pub fields: Vec<StructField>,
}

impl StructType {
    pub fn new(fields: impl IntoIterator<Item = StructField>) -> Self {
        Self {
            type_name: "struct".to_string(),
            fields: fields.into_iter().collect(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Parse a `metadata.schemaString`.
    pub fn from_schema_string(schema_string: &str) -> DeltaResult<Self> {
        let parsed: StructType = serde_json::from_str(schema_string)?;
        if parsed.type_name != "struct" {
            return Err(Error::validation(format!(
                "schemaString root must be a struct, got {:?}",
                parsed.type_name
            )));
        }
        Ok(parsed)
    }

    /// Render this schema as a `metadata.schemaString`.
    pub fn to_schema_string(&self) -> DeltaResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Validate a row against this schema and return it with columns in schema
    /// order, coerced to the declared types. Unknown columns are rejected;
    /// absent nullable columns are filled with `Null`.
    pub fn normalize_row(&self, mut row: Row) -> DeltaResult<Row> {
        if let Some(unknown) = row.keys().find(|k| self.field(k).is_none()) {
            return Err(Error::validation(format!(
                "row has column {unknown:?} which is not in the table schema"
            )));
        }
        let mut normalized = Row::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = match row.swap_remove(&field.name) {
                Some(value) => field.data_type.coerce(value)?,
                None => Value::Null,
            };
            if value.is_null() && !field.nullable {
                return Err(Error::validation(format!(
                    "column {:?} is not nullable but the row has no value for it",
                    field.name
                )));
            }
            normalized.insert(field.name.clone(), value);
        }
        Ok(normalized)
    }
}
