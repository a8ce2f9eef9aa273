//! The actions that can appear in the transaction log, and their
//! newline-delimited JSON codec.
//!
//! Each action serializes as a single-line JSON object with exactly one
//! top-level key naming the action kind.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{DeltaResult, Error};
use crate::schema::StructType;

pub mod deletion_vector;
pub use deletion_vector::DeletionVectorDescriptor;
pub use crate::path::format_version;

/// Reader/writer feature minimums for this table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub min_reader_version: i32,
    pub min_writer_version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reader_features: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writer_features: Option<Vec<String>>,
}

/// Feature name gating deletion-vector reads and writes.
pub const DELETION_VECTORS_FEATURE: &str = "deletionVectors";
/// Feature name gating change-data-feed reads.
pub const CHANGE_DATA_FEED_FEATURE: &str = "changeDataFeed";

impl Protocol {
    pub fn try_new(min_reader_version: i32, min_writer_version: i32) -> DeltaResult<Self> {
        if min_reader_version < 1 || min_writer_version < 1 {
            return Err(Error::validation(
                "protocol versions must be positive integers",
            ));
        }
        Ok(Self {
            min_reader_version,
            min_writer_version,
            reader_features: None,
            writer_features: None,
        })
    }

    pub fn with_features(
        mut self,
        reader_features: Vec<String>,
        writer_features: Vec<String>,
    ) -> Self {
        self.reader_features = Some(reader_features);
        self.writer_features = Some(writer_features);
        self
    }

    /// Whether this table supports deletion vectors. Feature lists only exist
    /// at reader version >= 3 / writer version >= 7.
    pub fn supports_deletion_vectors(&self) -> bool {
        let has = |features: &Option<Vec<String>>| {
            features
                .as_ref()
                .is_some_and(|f| f.iter().any(|name| name == DELETION_VECTORS_FEATURE))
        };
        has(&self.reader_features) && has(&self.writer_features)
    }

    fn validate(&self) -> DeltaResult<()> {
        if self.min_reader_version < 1 || self.min_writer_version < 1 {
            return Err(Error::validation("protocol versions must be positive"));
        }
        if self.reader_features.is_some() && self.min_reader_version < 3 {
            return Err(Error::validation(
                "readerFeatures require minReaderVersion >= 3",
            ));
        }
        if self.writer_features.is_some() && self.min_writer_version < 7 {
            return Err(Error::validation(
                "writerFeatures require minWriterVersion >= 7",
            ));
        }
        Ok(())
    }
}

/// Delta tables record the data file format here; it is always parquet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub provider: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            provider: "parquet".to_string(),
            options: HashMap::new(),
        }
    }
}

/// Schema, partition columns, and configuration of the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub format: Format,
    pub schema_string: String,
    pub partition_columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
    #[serde(default)]
    pub configuration: HashMap<String, String>,
}

impl Metadata {
    pub fn try_new(
        schema: &StructType,
        partition_columns: Vec<String>,
        configuration: HashMap<String, String>,
        created_time: i64,
    ) -> DeltaResult<Self> {
        for column in &partition_columns {
            if schema.field(column).is_none() {
                return Err(Error::validation(format!(
                    "partition column {column:?} is not in the table schema"
                )));
            }
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: None,
            description: None,
            format: Format::default(),
            schema_string: schema.to_schema_string()?,
            partition_columns,
            created_time: Some(created_time),
            configuration,
        })
    }

    pub fn parse_schema(&self) -> DeltaResult<StructType> {
        StructType::from_schema_string(&self.schema_string)
    }

    fn validate(&self) -> DeltaResult<()> {
        Uuid::parse_str(&self.id)
            .map_err(|_| Error::validation(format!("metadata.id {:?} is not a UUID", self.id)))?;
        if self.partition_columns.iter().any(|c| c.is_empty()) {
            return Err(Error::validation("partition column names must be non-empty"));
        }
        self.parse_schema()?;
        Ok(())
    }
}

/// A data file entering the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Add {
    pub path: String,
    #[serde(default)]
    pub partition_values: HashMap<String, String>,
    pub size: i64,
    pub modification_time: i64,
    pub data_change: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_vector: Option<DeletionVectorDescriptor>,
}

impl Add {
    fn validate(&self) -> DeltaResult<()> {
        if self.path.is_empty() {
            return Err(Error::validation("add.path must be non-empty"));
        }
        if self.size < 0 {
            return Err(Error::validation(format!(
                "add.size must be non-negative, got {}",
                self.size
            )));
        }
        if self.modification_time < 0 {
            return Err(Error::validation("add.modificationTime must be non-negative"));
        }
        if self.partition_values.keys().any(|k| k.is_empty()) {
            return Err(Error::validation("add.partitionValues keys must be non-empty"));
        }
        if let Some(stats) = &self.stats {
            crate::stats::FileStats::parse(stats)
                .map_err(|e| Error::validation(format!("add.stats is not valid stats JSON: {e}")))?;
        }
        if let Some(dv) = &self.deletion_vector {
            dv.validate()?;
        }
        Ok(())
    }

    /// Number of live rows, when statistics and the deletion vector permit
    /// computing it.
    pub fn num_live_records(&self) -> Option<u64> {
        let stats = crate::stats::FileStats::parse(self.stats.as_deref()?).ok()?;
        let deleted = self
            .deletion_vector
            .as_ref()
            .map(|dv| dv.cardinality as u64)
            .unwrap_or(0);
        Some(stats.num_records.saturating_sub(deleted))
    }
}

/// A data file leaving the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remove {
    pub path: String,
    pub deletion_timestamp: i64,
    pub data_change: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_values: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_vector: Option<DeletionVectorDescriptor>,
}

impl Remove {
    fn validate(&self) -> DeltaResult<()> {
        if self.path.is_empty() {
            return Err(Error::validation("remove.path must be non-empty"));
        }
        if self.deletion_timestamp < 0 {
            return Err(Error::validation(
                "remove.deletionTimestamp must be non-negative",
            ));
        }
        if matches!(self.size, Some(size) if size < 0) {
            return Err(Error::validation("remove.size must be non-negative"));
        }
        Ok(())
    }
}

/// A change-data file produced alongside a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCdcFile {
    pub path: String,
    #[serde(default)]
    pub partition_values: HashMap<String, String>,
    pub size: i64,
    pub data_change: bool,
}

impl AddCdcFile {
    fn validate(&self) -> DeltaResult<()> {
        if self.path.is_empty() {
            return Err(Error::validation("cdc.path must be non-empty"));
        }
        if self.size < 0 {
            return Err(Error::validation("cdc.size must be non-negative"));
        }
        Ok(())
    }
}

/// Audit record of a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub timestamp: i64,
    pub operation: String,
    #[serde(default)]
    pub operation_parameters: HashMap<String, serde_json::Value>,
    pub is_blind_append: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_info: Option<String>,
}

impl CommitInfo {
    pub fn new(timestamp: i64, operation: impl Into<String>) -> Self {
        Self {
            timestamp,
            operation: operation.into(),
            operation_parameters: HashMap::new(),
            is_blind_append: false,
            read_version: None,
            engine_info: None,
        }
    }

    fn validate(&self) -> DeltaResult<()> {
        if self.timestamp < 0 {
            return Err(Error::validation("commitInfo.timestamp must be non-negative"));
        }
        Ok(())
    }
}

/// One record of the transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "commitInfo")]
    CommitInfo(CommitInfo),
    #[serde(rename = "protocol")]
    Protocol(Protocol),
    #[serde(rename = "metaData")]
    Metadata(Metadata),
    #[serde(rename = "add")]
    Add(Add),
    #[serde(rename = "remove")]
    Remove(Remove),
    #[serde(rename = "cdc")]
    Cdc(AddCdcFile),
}

const KNOWN_ACTIONS: [&str; 6] = ["commitInfo", "protocol", "metaData", "add", "remove", "cdc"];

impl Action {
    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> DeltaResult<()> {
        match self {
            Action::CommitInfo(a) => a.validate(),
            Action::Protocol(a) => a.validate(),
            Action::Metadata(a) => a.validate(),
            Action::Add(a) => a.validate(),
            Action::Remove(a) => a.validate(),
            Action::Cdc(a) => a.validate(),
        }
    }

    /// Serialize as one line of log JSON.
    pub fn to_line(&self) -> DeltaResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one line of log JSON, validating the decoded action.
    /// Unknown top-level keys surface as [`Error::UnrecognizedAction`] so the
    /// caller can decide whether that is fatal.
    pub fn from_line(line: &str) -> DeltaResult<Action> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let object = value
            .as_object()
            .ok_or_else(|| Error::validation("log line must be a JSON object"))?;
        if object.len() != 1 {
            return Err(Error::validation(
                "log line must have exactly one top-level key",
            ));
        }
        let key = object
            .keys()
            .next()
            .ok_or_else(|| Error::validation("log line is an empty object"))?;
        if !KNOWN_ACTIONS.contains(&key.as_str()) {
            return Err(Error::UnrecognizedAction(key.clone()));
        }
        let action: Action = serde_json::from_value(value)?;
        action.validate()?;
        Ok(action)
    }
}

/// Serialize a commit body: one action per line.
pub fn encode_actions<'a>(actions: impl IntoIterator<Item = &'a Action>) -> DeltaResult<String> {
    let mut lines = Vec::new();
    for action in actions {
        action.validate()?;
        lines.push(action.to_line()?);
    }
    Ok(lines.join("\n"))
}

/// Parse a commit body strictly: any malformed or unknown action is an error.
pub fn decode_actions(body: &str) -> DeltaResult<Vec<Action>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(Action::from_line)
        .collect()
}

/// Parse a commit body for replay: unknown actions are skipped but logged,
/// malformed known actions remain fatal.
pub fn decode_actions_lenient(body: &str, source: &str) -> DeltaResult<Vec<Action>> {
    let mut actions = Vec::new();
    for line in body.lines().filter(|line| !line.trim().is_empty()) {
        match Action::from_line(line) {
            Ok(action) => actions.push(action),
            Err(Error::UnrecognizedAction(kind)) => {
                warn!(%kind, %source, "skipping unrecognized action during replay");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, StructField};

    fn sample_add() -> Add {
        Add {
            path: "part-00000-a.parquet".to_string(),
            partition_values: HashMap::new(),
            size: 1024,
            modification_time: 1_700_000_000_000,
            data_change: true,
            stats: Some(
                r#"{"numRecords":2,"minValues":{"id":1},"maxValues":{"id":3},"nullCount":{"id":0}}"#
                    .to_string(),
            ),
            tags: None,
            deletion_vector: None,
        }
    }

    #[test]
    fn single_key_single_line() {
        let action = Action::Add(sample_add());
        let line = action.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert!(line.starts_with(r#"{"add":{"#));
        assert_eq!(Action::from_line(&line).unwrap(), action);
    }

    #[test]
    fn metadata_round_trip_uses_delta_field_names() {
        let schema = StructType::new([StructField::new("id", DataType::Integer, true)]);
        let metadata = Metadata::try_new(&schema, vec![], HashMap::new(), 1_700_000_000_000).unwrap();
        let line = Action::Metadata(metadata.clone()).to_line().unwrap();
        assert!(line.starts_with(r#"{"metaData":{"#));
        assert!(line.contains("schemaString"));
        assert!(line.contains("partitionColumns"));
        assert_eq!(Action::from_line(&line).unwrap(), Action::Metadata(metadata));
    }

    #[test]
    fn rejects_malformed_actions() {
        // negative size
        let mut add = sample_add();
        add.size = -1;
        assert!(Action::Add(add).validate().is_err());

        // empty partition key
        let mut add = sample_add();
        add.partition_values.insert(String::new(), "x".to_string());
        assert!(Action::Add(add).validate().is_err());

        // missing required field
        assert!(Action::from_line(r#"{"add":{"path":"p"}}"#).is_err());

        // wrong type
        assert!(Action::from_line(r#"{"add":{"path":"p","size":"big","modificationTime":0,"dataChange":true}}"#).is_err());
    }

    #[test]
    fn unknown_action_is_distinguishable() {
        let err = Action::from_line(r#"{"txnStarted":{"appId":"x"}}"#).unwrap_err();
        assert!(matches!(err, Error::UnrecognizedAction(kind) if kind == "txnStarted"));

        let body = "{\"txnStarted\":{}}\n{\"protocol\":{\"minReaderVersion\":1,\"minWriterVersion\":2}}";
        let actions = decode_actions_lenient(body, "test").unwrap();
        assert_eq!(actions.len(), 1);
        assert!(decode_actions(body).is_err());
    }

    #[test]
    fn protocol_feature_gating() {
        let bare = Protocol::try_new(1, 2).unwrap();
        assert!(!bare.supports_deletion_vectors());
        let featured = Protocol::try_new(3, 7).unwrap().with_features(
            vec![DELETION_VECTORS_FEATURE.to_string()],
            vec![DELETION_VECTORS_FEATURE.to_string()],
        );
        assert!(featured.supports_deletion_vectors());
        featured.validate().unwrap();

        let invalid = Protocol {
            min_reader_version: 1,
            min_writer_version: 2,
            reader_features: Some(vec![]),
            writer_features: None,
        };
        assert!(invalid.validate().is_err());
    }
}
