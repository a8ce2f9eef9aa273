//! Change data capture: producing per-row change records alongside writes
//! and reading them back by version, by time, or through a subscription.
//!
//! Change files store only `{_change_type, data}`; commit version, commit
//! timestamp, and sequence numbers are stamped at read time from the commit
//! that references the file, so rebased commits never carry stale values.

use std::collections::HashSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::actions::{Action, AddCdcFile};
use crate::error::{CdcErrorKind, DeltaResult, Error};
use crate::path::CHANGE_DATA_DIR;
use crate::storage::StorageBackend;
use crate::value::{Row, Value};
use crate::Version;

mod reader;
mod subscribe;

pub use subscribe::{ChangeHandler, ErrorCallback, SubscribeOptions, Subscription};

/// Kind of a change record, in the Delta-native vocabulary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeType {
    Insert,
    UpdatePreimage,
    UpdatePostimage,
    Delete,
}

impl ChangeType {
    /// The single-letter operation class used by consumer filters.
    pub fn op_code(&self) -> OpCode {
        match self {
            ChangeType::Insert => OpCode::Create,
            ChangeType::UpdatePreimage | ChangeType::UpdatePostimage => OpCode::Update,
            ChangeType::Delete => OpCode::Delete,
        }
    }
}

/// Operation classes for consumer-side filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    #[serde(rename = "c")]
    Create,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    #[serde(rename = "r")]
    Read,
}

/// One change record as returned by the readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(rename = "_change_type")]
    pub change_type: ChangeType,
    #[serde(rename = "_commit_version")]
    pub commit_version: Version,
    /// Commit time in nanoseconds since the unix epoch.
    #[serde(rename = "_commit_timestamp")]
    pub commit_timestamp: i64,
    #[serde(rename = "_seq")]
    pub seq: u64,
    pub data: Row,
}

/// The on-disk shape inside a change file: kind plus row, nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChangeFileRecord {
    #[serde(rename = "_change_type")]
    pub change_type: ChangeType,
    pub data: Row,
}

/// Total order of change records: `(commit_version, position)` packed into a
/// u64 with 20 bits of intra-commit position. Never regresses across commits.
pub(crate) fn sequence(version: Version, position: usize) -> u64 {
    (version << 20) | (position as u64 & 0xF_FFFF)
}

/// Consumer-side filters, applied after read.
#[derive(Debug, Clone, Default)]
pub struct ChangeDataFilter {
    pub from_seq: Option<u64>,
    /// Nanoseconds since the unix epoch.
    pub from_timestamp: Option<i64>,
    pub operations: Option<HashSet<OpCode>>,
}

impl ChangeDataFilter {
    pub fn applies(&self, record: &ChangeRecord) -> bool {
        if self.from_seq.is_some_and(|from| record.seq < from) {
            return false;
        }
        if self
            .from_timestamp
            .is_some_and(|from| record.commit_timestamp < from)
        {
            return false;
        }
        if let Some(operations) = &self.operations {
            if !operations.contains(&record.change_type.op_code()) {
                return false;
            }
        }
        true
    }
}

/// A staged change file: written to storage, not yet referenced by a commit.
/// The caller adds `action` to its transaction and deletes `path` on failure.
#[derive(Debug)]
pub(crate) struct PendingChangeData {
    pub path: String,
    pub action: Action,
}

/// Write the change records of one operation to a change file under
/// `_change_data/` and return the `cdc` action referencing it.
pub(crate) async fn stage_change_data(
    storage: &dyn StorageBackend,
    records: &[(ChangeType, Row)],
) -> DeltaResult<PendingChangeData> {
    if records.is_empty() {
        return Err(Error::cdc(
            CdcErrorKind::EmptyWrite,
            "operation produced no change records",
        ));
    }
    let lines: Vec<String> = records
        .iter()
        .map(|(change_type, data)| {
            serde_json::to_string(&ChangeFileRecord {
                change_type: *change_type,
                data: data.clone(),
            })
            .map_err(Error::Json)
        })
        .collect::<DeltaResult<_>>()?;
    let body = lines.join("\n");
    let path = format!("{CHANGE_DATA_DIR}/cdc-{}.json", Uuid::new_v4());
    let size = body.len() as i64;
    storage.write(&path, Bytes::from(body)).await?;
    Ok(PendingChangeData {
        action: Action::Cdc(AddCdcFile {
            path: path.clone(),
            partition_values: Default::default(),
            size,
            data_change: false,
        }),
        path,
    })
}

/// The generic change-event envelope used when handing records to external
/// consumers: identity, before/after images, one event per logical change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_seq")]
    pub seq: u64,
    #[serde(rename = "_op")]
    pub op: OpCode,
    #[serde(rename = "_before", skip_serializing_if = "Option::is_none")]
    pub before: Option<Row>,
    #[serde(rename = "_after", skip_serializing_if = "Option::is_none")]
    pub after: Option<Row>,
    /// Nanoseconds since the unix epoch.
    #[serde(rename = "_ts")]
    pub ts: i64,
    #[serde(rename = "_source")]
    pub source: String,
    #[serde(rename = "_txn", skip_serializing_if = "Option::is_none")]
    pub txn: Option<u64>,
}

fn row_identity(row: &Row, primary_keys: &[String]) -> String {
    if primary_keys.is_empty() {
        return serde_json::to_string(row).unwrap_or_default();
    }
    primary_keys
        .iter()
        .map(|key| {
            row.get(key)
                .unwrap_or(&Value::Null)
                .to_partition_string()
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Collapse native records into envelope events: update pre/post pairs merge
/// into a single `u` event with before and after images.
pub fn to_change_events(
    records: &[ChangeRecord],
    primary_keys: &[String],
    source: &str,
) -> Vec<ChangeEvent> {
    let mut events = Vec::with_capacity(records.len());
    let mut pending_preimage: Option<&ChangeRecord> = None;
    for record in records {
        match record.change_type {
            ChangeType::UpdatePreimage => pending_preimage = Some(record),
            ChangeType::UpdatePostimage => {
                let before = pending_preimage.take().map(|r| r.data.clone());
                events.push(ChangeEvent {
                    id: row_identity(&record.data, primary_keys),
                    seq: record.seq,
                    op: OpCode::Update,
                    before,
                    after: Some(record.data.clone()),
                    ts: record.commit_timestamp,
                    source: source.to_string(),
                    txn: Some(record.commit_version),
                });
            }
            ChangeType::Insert => events.push(ChangeEvent {
                id: row_identity(&record.data, primary_keys),
                seq: record.seq,
                op: OpCode::Create,
                before: None,
                after: Some(record.data.clone()),
                ts: record.commit_timestamp,
                source: source.to_string(),
                txn: Some(record.commit_version),
            }),
            ChangeType::Delete => events.push(ChangeEvent {
                id: row_identity(&record.data, primary_keys),
                seq: record.seq,
                op: OpCode::Delete,
                before: Some(record.data.clone()),
                after: None,
                ts: record.commit_timestamp,
                source: source.to_string(),
                txn: Some(record.commit_version),
            }),
        }
    }
    events
}
