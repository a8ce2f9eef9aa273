//! Merge: a streaming upsert evaluated against snapshot-time state.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use tracing::instrument;

use crate::actions::{Action, Add, Remove};
use crate::cancel::CancellationToken;
use crate::cdc::{stage_change_data, ChangeType};
use crate::error::{DeltaResult, Error};
use crate::table::write::split_rows;
use crate::table::Table;
use crate::transaction::{Transaction, OP_MERGE};
use crate::value::{Row, Value};
use crate::Version;

/// Transform for a source row whose key matched an existing row. Receives
/// `(existing, incoming)`; returning `None` deletes the existing row.
pub type WhenMatched = Box<dyn Fn(&Row, &Row) -> Option<Row> + Send + Sync>;

/// Transform for a source row with no existing match. Returning `None` skips
/// the row.
pub type WhenNotMatched = Box<dyn Fn(&Row) -> Option<Row> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MergeResult {
    pub version: Option<Version>,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub rows_skipped: u64,
}

/// Builder for a merge operation. Defaults are plain upsert semantics: a
/// match takes the incoming row, a non-match inserts it.
pub struct Merge<'a> {
    table: &'a Table,
    on: Vec<String>,
    when_matched: Option<WhenMatched>,
    when_not_matched: Option<WhenNotMatched>,
    cancel: CancellationToken,
}

enum Edit {
    Replace(Row),
    Delete,
}

impl Table {
    /// Start a merge keyed on the given columns.
    pub fn merge(&self, on: impl Into<Vec<String>>) -> Merge<'_> {
        Merge {
            table: self,
            on: on.into(),
            when_matched: None,
            when_not_matched: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl<'a> Merge<'a> {
    pub fn when_matched(
        mut self,
        transform: impl Fn(&Row, &Row) -> Option<Row> + Send + Sync + 'static,
    ) -> Self {
        self.when_matched = Some(Box::new(transform));
        self
    }

    pub fn when_not_matched(
        mut self,
        transform: impl Fn(&Row) -> Option<Row> + Send + Sync + 'static,
    ) -> Self {
        self.when_not_matched = Some(Box::new(transform));
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the merge over `source` rows, in order. Match lookup is against
    /// the snapshot read at the start; rows the merge itself writes are not
    /// visible to later source rows.
    #[instrument(skip_all, fields(rows = source.len()))]
    pub async fn execute(self, source: Vec<Row>) -> DeltaResult<MergeResult> {
        let snapshot = self.table.snapshot().await?;
        let schema = snapshot.schema().clone();
        for column in &self.on {
            if schema.field(column).is_none() {
                return Err(Error::validation(format!(
                    "merge key column {column:?} is not in the table schema"
                )));
            }
        }
        let source: Vec<Row> = source
            .into_iter()
            .map(|row| schema.normalize_row(row))
            .collect::<DeltaResult<_>>()?;

        // snapshot-time state: every live row, keyed by the merge columns
        let mut files: Vec<(Add, Vec<Row>)> = Vec::new();
        let mut index: HashMap<String, (usize, usize)> = HashMap::new();
        for add in snapshot.files() {
            self.cancel.check()?;
            let rows: Vec<Row> = self
                .table
                .read_rows_indexed(add)
                .await?
                .into_iter()
                .map(|(_, row)| row)
                .collect();
            let file_index = files.len();
            for (position, row) in rows.iter().enumerate() {
                index.insert(self.key_of(row), (file_index, position));
            }
            files.push((add.clone(), rows));
        }

        let mut edits: HashMap<(usize, usize), Edit> = HashMap::new();
        let mut inserts: Vec<Row> = Vec::new();
        let mut change_records: Vec<(ChangeType, Row)> = Vec::new();
        let mut result = MergeResult {
            version: None,
            rows_inserted: 0,
            rows_updated: 0,
            rows_deleted: 0,
            rows_skipped: 0,
        };

        for incoming in source {
            match index.get(&self.key_of(&incoming)) {
                Some(&(file_index, position)) => {
                    let existing = &files[file_index].1[position];
                    let outcome = match &self.when_matched {
                        Some(transform) => transform(existing, &incoming),
                        None => Some(incoming.clone()),
                    };
                    match outcome {
                        Some(updated) => {
                            let updated = schema.normalize_row(updated)?;
                            change_records
                                .push((ChangeType::UpdatePreimage, existing.clone()));
                            change_records
                                .push((ChangeType::UpdatePostimage, updated.clone()));
                            edits.insert((file_index, position), Edit::Replace(updated));
                            result.rows_updated += 1;
                        }
                        None => {
                            change_records.push((ChangeType::Delete, existing.clone()));
                            edits.insert((file_index, position), Edit::Delete);
                            result.rows_deleted += 1;
                        }
                    }
                }
                None => {
                    let outcome = match &self.when_not_matched {
                        Some(transform) => transform(&incoming),
                        None => Some(incoming.clone()),
                    };
                    match outcome {
                        Some(row) => {
                            let row = schema.normalize_row(row)?;
                            change_records.push((ChangeType::Insert, row.clone()));
                            inserts.push(row);
                            result.rows_inserted += 1;
                        }
                        None => result.rows_skipped += 1,
                    }
                }
            }
        }

        if edits.is_empty() && inserts.is_empty() {
            return Ok(result);
        }

        let mut staged_paths = Vec::new();
        let mut actions = Vec::new();
        let staging = async {
            for (file_index, (add, rows)) in files.iter().enumerate() {
                let touched = edits.keys().any(|(f, _)| *f == file_index);
                if !touched {
                    continue;
                }
                self.cancel.check()?;
                let rewritten: Vec<Row> = rows
                    .iter()
                    .enumerate()
                    .filter_map(|(position, row)| {
                        match edits.get(&(file_index, position)) {
                            None => Some(row.clone()),
                            Some(Edit::Replace(updated)) => Some(updated.clone()),
                            Some(Edit::Delete) => None,
                        }
                    })
                    .collect();
                actions.push(Action::Remove(Remove {
                    path: add.path.clone(),
                    deletion_timestamp: Utc::now().timestamp_millis(),
                    data_change: true,
                    partition_values: Some(add.partition_values.clone()),
                    size: Some(add.size),
                    deletion_vector: add.deletion_vector.clone(),
                }));
                if !rewritten.is_empty() {
                    let (new_add, path) = self
                        .table
                        .stage_data_file(&schema, &rewritten, add.partition_values.clone(), true)
                        .await?;
                    staged_paths.push(path);
                    actions.push(Action::Add(new_add));
                }
            }

            if !inserts.is_empty() {
                let target = snapshot.properties().target_file_size;
                let partition_values: HashMap<String, String> = HashMap::new();
                if snapshot.partition_columns().is_empty() {
                    for chunk in split_rows(inserts.clone(), target) {
                        let (add, path) = self
                            .table
                            .stage_data_file(&schema, &chunk, partition_values.clone(), true)
                            .await?;
                        staged_paths.push(path);
                        actions.push(Action::Add(add));
                    }
                } else {
                    // partitioned inserts route through the write layout
                    let mut groups: HashMap<Vec<String>, Vec<Row>> = HashMap::new();
                    for row in inserts.clone() {
                        let key = snapshot
                            .partition_columns()
                            .iter()
                            .map(|c| {
                                row.get(c).map(|v| v.to_partition_string()).unwrap_or_default()
                            })
                            .collect();
                        groups.entry(key).or_default().push(row);
                    }
                    for (key, rows) in groups {
                        let values: HashMap<String, String> = snapshot
                            .partition_columns()
                            .iter()
                            .cloned()
                            .zip(key)
                            .collect();
                        for chunk in split_rows(rows, target) {
                            let (add, path) = self
                                .table
                                .stage_data_file(&schema, &chunk, values.clone(), true)
                                .await?;
                            staged_paths.push(path);
                            actions.push(Action::Add(add));
                        }
                    }
                }
            }

            if snapshot.properties().change_data_feed {
                let pending =
                    stage_change_data(self.table.storage().as_ref(), &change_records).await?;
                staged_paths.push(pending.path);
                actions.push(pending.action);
            }
            DeltaResult::Ok(())
        }
        .await;
        if let Err(err) = staging {
            self.table.cleanup_files(&staged_paths).await;
            return Err(err);
        }

        let mut txn = Transaction::new(
            OP_MERGE,
            Some(snapshot.version()),
            snapshot.partition_columns().to_vec(),
        )
        .with_parameter("matchColumns", json!(self.on))
        .with_cancellation(self.cancel.clone());
        txn.extend(actions);

        match txn.commit(self.table.storage().as_ref()).await {
            Ok(version) => {
                self.table.run_post_commit().await;
                result.version = Some(version);
                Ok(result)
            }
            Err(err) => {
                self.table.cleanup_files(&staged_paths).await;
                Err(err)
            }
        }
    }

    fn key_of(&self, row: &Row) -> String {
        let key: Vec<&Value> = self
            .on
            .iter()
            .map(|column| row.get(column).unwrap_or(&Value::Null))
            .collect();
        serde_json::to_string(&key).unwrap_or_default()
    }
}
