//! Snapshots: the immutable logical state of a table at one version,
//! reconstructed by ordered replay of checkpoint + delta actions.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::actions::{Action, Add, Metadata, Protocol};
use crate::error::{DeltaResult, Error};
use crate::log_segment::LogSegment;
use crate::predicate::Filter;
use crate::schema::StructType;
use crate::stats::{can_skip_file, FileStats};
use crate::storage::StorageBackend;
use crate::table_properties::TableProperties;
use crate::value::{Row, Value};
use crate::Version;

/// Immutable table state at a specific version. Snapshots are values: once
/// built they never observe later commits.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: Version,
    protocol: Protocol,
    metadata: Metadata,
    schema: StructType,
    properties: TableProperties,
    /// Live data files keyed by path, in first-added order.
    files: IndexMap<String, Add>,
    /// Actions replayed after the checkpoint; feeds the checkpoint policy.
    actions_since_checkpoint: usize,
    checkpoint_version: Option<Version>,
}

impl Snapshot {
    /// Reconstruct the snapshot at `version` (or the latest version).
    pub async fn try_new(
        storage: &dyn StorageBackend,
        version: Option<Version>,
    ) -> DeltaResult<Self> {
        let segment = LogSegment::build(storage, version).await?;
        Self::try_new_from_segment(storage, segment).await
    }

    pub(crate) async fn try_new_from_segment(
        storage: &dyn StorageBackend,
        segment: LogSegment,
    ) -> DeltaResult<Self> {
        let mut protocol: Option<Protocol> = None;
        let mut metadata: Option<Metadata> = None;
        let mut files: IndexMap<String, Add> = IndexMap::new();
        let mut actions_since_checkpoint = 0;
        let checkpoint_version = segment.checkpoint.as_ref().map(|c| c.version);

        for (version, actions) in segment.read_actions(storage).await? {
            // delta files always have versions above the checkpoint, so the
            // checkpoint batch is the only one carrying its version
            let in_checkpoint = checkpoint_version == Some(version);
            for action in actions {
                if !in_checkpoint {
                    actions_since_checkpoint += 1;
                }
                match action {
                    // the latest protocol/metadata wins, even within a commit
                    Action::Protocol(p) => protocol = Some(p),
                    Action::Metadata(m) => metadata = Some(m),
                    Action::Add(add) => {
                        files.insert(add.path.clone(), add);
                    }
                    Action::Remove(remove) => {
                        files.shift_remove(&remove.path);
                    }
                    Action::CommitInfo(_) | Action::Cdc(_) => {}
                }
            }
        }

        let protocol = protocol
            .ok_or_else(|| Error::validation("table log contains no protocol action"))?;
        let metadata = metadata
            .ok_or_else(|| Error::validation("table log contains no metadata action"))?;
        let schema = metadata.parse_schema()?;
        let properties = TableProperties::from(&metadata.configuration);

        Ok(Self {
            version: segment.end_version,
            protocol,
            metadata,
            schema,
            properties,
            files,
            actions_since_checkpoint,
            checkpoint_version,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn schema(&self) -> &StructType {
        &self.schema
    }

    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    pub fn partition_columns(&self) -> &[String] {
        &self.metadata.partition_columns
    }

    /// Live data files, in replay order.
    pub fn files(&self) -> impl Iterator<Item = &Add> {
        self.files.values()
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn file(&self, path: &str) -> Option<&Add> {
        self.files.get(path)
    }

    pub(crate) fn actions_since_checkpoint(&self) -> usize {
        self.actions_since_checkpoint
    }

    pub(crate) fn checkpoint_version(&self) -> Option<Version> {
        self.checkpoint_version
    }

    /// Total live rows across files that carry statistics.
    pub fn approximate_num_rows(&self) -> u64 {
        self.files().filter_map(|add| add.num_live_records()).sum()
    }

    /// Files whose partition values and zone maps do not provably exclude
    /// `filter`. This is the data-skipping entry point for every read path.
    pub fn files_matching(&self, filter: &Filter) -> Vec<&Add> {
        self.files()
            .filter(|add| !partition_prunes(add, self.partition_columns(), filter))
            .filter(|add| {
                let stats = add.stats.as_deref().and_then(|s| FileStats::parse(s).ok());
                !can_skip_file(stats.as_ref(), filter)
            })
            .collect()
    }
}

/// Partition pruning: evaluate the filter with only the file's partition
/// values bound. Exclude the file when no row of it could match on partition
/// columns alone.
fn partition_prunes(add: &Add, partition_columns: &[String], filter: &Filter) -> bool {
    if partition_columns.is_empty() || add.partition_values.is_empty() {
        return false;
    }
    // Only prune on filters that reference partition columns exclusively at
    // comparison leaves under conjunctions; mirror the zone-map conservatism.
    let referenced = filter.referenced_columns();
    if !referenced.iter().any(|c| partition_columns.contains(&c.to_string())) {
        return false;
    }
    let partition_row: Row = add
        .partition_values
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    prunes(filter, &partition_row, partition_columns)
}

fn prunes(filter: &Filter, partition_row: &Row, partition_columns: &[String]) -> bool {
    match filter {
        Filter::And(fs) => fs.iter().any(|f| prunes(f, partition_row, partition_columns)),
        Filter::Compare { column, .. } => {
            if !partition_columns.contains(column) {
                return false;
            }
            // partition values are strings; compare stringified operands
            !filter_matches_stringly(filter, partition_row)
        }
        _ => false,
    }
}

fn filter_matches_stringly(filter: &Filter, partition_row: &Row) -> bool {
    use crate::predicate::{CompareOp, Operand};
    let Filter::Compare {
        column,
        op,
        operand,
    } = filter
    else {
        return true;
    };
    let Some(actual) = partition_row.get(column) else {
        return true;
    };
    let as_string = |v: &Value| v.to_partition_string();
    let actual = as_string(actual);
    match (op, operand) {
        (CompareOp::Eq, Operand::One(v)) => actual == as_string(v),
        (CompareOp::Ne, Operand::One(v)) => actual != as_string(v),
        (CompareOp::In, Operand::Many(vs)) => vs.iter().any(|v| actual == as_string(v)),
        // ordered comparisons over stringified values are not sound; keep
        _ => true,
    }
}

/// One entry of a table's commit history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryEntry {
    pub version: Version,
    pub timestamp: Option<i64>,
    pub operation: Option<String>,
    pub operation_parameters: Option<std::collections::HashMap<String, JsonValue>>,
    pub is_blind_append: Option<bool>,
    pub read_version: Option<i64>,
}

/// Read commit audit records, newest first, up to `limit` entries.
pub async fn history(
    storage: &dyn StorageBackend,
    limit: Option<usize>,
) -> DeltaResult<Vec<HistoryEntry>> {
    let segment = LogSegment::build(storage, None).await?;
    let mut entries = Vec::new();
    for file in segment.commit_files.iter().rev() {
        if limit.is_some_and(|limit| entries.len() >= limit) {
            break;
        }
        let body = storage.read(&file.path).await?;
        let text = std::str::from_utf8(&body)?;
        let commit_info = crate::actions::decode_actions_lenient(text, &file.path)?
            .into_iter()
            .find_map(|action| match action {
                Action::CommitInfo(info) => Some(info),
                _ => None,
            });
        entries.push(match commit_info {
            Some(info) => HistoryEntry {
                version: file.version,
                timestamp: Some(info.timestamp),
                operation: Some(info.operation),
                operation_parameters: Some(info.operation_parameters),
                is_blind_append: Some(info.is_blind_append),
                read_version: info.read_version,
            },
            None => HistoryEntry {
                version: file.version,
                timestamp: None,
                operation: None,
                operation_parameters: None,
                is_blind_append: None,
                read_version: None,
            },
        });
    }
    Ok(entries)
}
