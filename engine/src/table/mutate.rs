//! Row-level mutation: update and delete. Both pick between rewriting a data
//! file and attaching a deletion vector, per file, based on the matched-row
//! fraction.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use tracing::instrument;

use crate::actions::deletion_vector::{merge_deletes, write_deletion_vector};
use crate::actions::{Action, Add, Remove};
use crate::cancel::CancellationToken;
use crate::cdc::{stage_change_data, ChangeType};
use crate::error::{DeltaResult, Error};
use crate::predicate::Filter;
use crate::snapshot::Snapshot;
use crate::table::Table;
use crate::transaction::{Transaction, OP_DELETE, OP_UPDATE};
use crate::value::{Row, Value};
use crate::Version;

/// How delete (and update) handle files with matching rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::EnumString, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DeleteStrategy {
    /// Deletion vectors below the matched-row threshold, rewrite above it.
    #[default]
    Auto,
    /// Always rewrite the file without the matching rows.
    Rewrite,
    /// Always attach a deletion vector (requires protocol support).
    DeletionVector,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UpdateResult {
    /// `None` when no file had matching rows and nothing was committed.
    pub version: Option<Version>,
    pub rows_updated: u64,
    pub files_rewritten: usize,
    pub files_with_new_deletion_vectors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeleteResult {
    pub version: Option<Version>,
    pub rows_deleted: u64,
    pub files_rewritten: usize,
    pub files_with_new_deletion_vectors: usize,
}

struct FileScan {
    add: Add,
    matched: Vec<(u64, Row)>,
    unmatched: Vec<Row>,
    live_rows: usize,
}

impl Table {
    /// Update rows matching `filter` by assigning `updates` column values.
    #[instrument(skip_all)]
    pub async fn update(
        &self,
        filter: &Filter,
        updates: &HashMap<String, Value>,
    ) -> DeltaResult<UpdateResult> {
        self.update_with(filter, updates, DeleteStrategy::Auto, CancellationToken::new())
            .await
    }

    pub async fn update_with(
        &self,
        filter: &Filter,
        updates: &HashMap<String, Value>,
        strategy: DeleteStrategy,
        cancel: CancellationToken,
    ) -> DeltaResult<UpdateResult> {
        let snapshot = self.snapshot().await?;
        let schema = snapshot.schema().clone();
        for column in updates.keys() {
            if schema.field(column).is_none() {
                return Err(Error::validation(format!(
                    "update assigns column {column:?} which is not in the schema"
                )));
            }
        }

        let scans = self.scan_matching_files(&snapshot, filter, &cancel).await?;
        if scans.is_empty() {
            return Ok(UpdateResult {
                version: None,
                rows_updated: 0,
                files_rewritten: 0,
                files_with_new_deletion_vectors: 0,
            });
        }

        let mut staged_paths = Vec::new();
        let mut actions = Vec::new();
        let mut change_records = Vec::new();
        let mut rows_updated = 0u64;
        let mut files_rewritten = 0usize;
        let mut files_with_dv = 0usize;

        let staging = async {
            for scan in &scans {
                cancel.check()?;
                let updated_rows: Vec<Row> = scan
                    .matched
                    .iter()
                    .map(|(_, row)| {
                        let mut updated = row.clone();
                        for (column, value) in updates {
                            updated.insert(column.clone(), value.clone());
                        }
                        schema.normalize_row(updated)
                    })
                    .collect::<DeltaResult<_>>()?;
                rows_updated += updated_rows.len() as u64;
                for ((_, before), after) in scan.matched.iter().zip(&updated_rows) {
                    change_records.push((ChangeType::UpdatePreimage, before.clone()));
                    change_records.push((ChangeType::UpdatePostimage, after.clone()));
                }

                if self.use_deletion_vector(&snapshot, scan, strategy)? {
                    // mask the old copies of the rows, append the new copies
                    let deletes = scan.matched.iter().map(|(index, _)| *index);
                    let merged = merge_deletes(
                        self.storage().as_ref(),
                        scan.add.deletion_vector.as_ref(),
                        deletes,
                    )
                    .await?;
                    let (descriptor, dv_path) =
                        write_deletion_vector(self.storage().as_ref(), &merged).await?;
                    staged_paths.push(dv_path);
                    let mut masked = scan.add.clone();
                    masked.deletion_vector = Some(descriptor);
                    masked.data_change = true;
                    actions.push(Action::Add(masked));
                    files_with_dv += 1;

                    let (add, path) = self
                        .stage_data_file(
                            &schema,
                            &updated_rows,
                            scan.add.partition_values.clone(),
                            true,
                        )
                        .await?;
                    staged_paths.push(path);
                    actions.push(Action::Add(add));
                } else {
                    let mut rewritten = scan.unmatched.clone();
                    rewritten.extend(updated_rows);
                    let (add, path) = self
                        .stage_data_file(
                            &schema,
                            &rewritten,
                            scan.add.partition_values.clone(),
                            true,
                        )
                        .await?;
                    staged_paths.push(path);
                    actions.push(Action::Remove(tombstone(&scan.add)));
                    actions.push(Action::Add(add));
                    files_rewritten += 1;
                }
            }
            if snapshot.properties().change_data_feed {
                let pending =
                    stage_change_data(self.storage().as_ref(), &change_records).await?;
                staged_paths.push(pending.path);
                actions.push(pending.action);
            }
            DeltaResult::Ok(())
        }
        .await;
        if let Err(err) = staging {
            self.cleanup_files(&staged_paths).await;
            return Err(err);
        }

        let mut txn = Transaction::new(
            OP_UPDATE,
            Some(snapshot.version()),
            snapshot.partition_columns().to_vec(),
        )
        .with_parameter("predicate", json!(format!("{filter:?}")))
        .with_cancellation(cancel);
        txn.extend(actions);

        match txn.commit(self.storage().as_ref()).await {
            Ok(version) => {
                self.run_post_commit().await;
                Ok(UpdateResult {
                    version: Some(version),
                    rows_updated,
                    files_rewritten,
                    files_with_new_deletion_vectors: files_with_dv,
                })
            }
            Err(err) => {
                self.cleanup_files(&staged_paths).await;
                Err(err)
            }
        }
    }

    /// Delete rows matching `filter`.
    #[instrument(skip_all)]
    pub async fn delete(&self, filter: &Filter) -> DeltaResult<DeleteResult> {
        self.delete_with(filter, DeleteStrategy::Auto, CancellationToken::new())
            .await
    }

    pub async fn delete_with(
        &self,
        filter: &Filter,
        strategy: DeleteStrategy,
        cancel: CancellationToken,
    ) -> DeltaResult<DeleteResult> {
        let snapshot = self.snapshot().await?;
        let schema = snapshot.schema().clone();
        let scans = self.scan_matching_files(&snapshot, filter, &cancel).await?;
        if scans.is_empty() {
            return Ok(DeleteResult {
                version: None,
                rows_deleted: 0,
                files_rewritten: 0,
                files_with_new_deletion_vectors: 0,
            });
        }

        let mut staged_paths = Vec::new();
        let mut actions = Vec::new();
        let mut change_records = Vec::new();
        let mut rows_deleted = 0u64;
        let mut files_rewritten = 0usize;
        let mut files_with_dv = 0usize;

        let staging = async {
            for scan in &scans {
                cancel.check()?;
                rows_deleted += scan.matched.len() as u64;
                for (_, row) in &scan.matched {
                    change_records.push((ChangeType::Delete, row.clone()));
                }

                if scan.unmatched.is_empty() {
                    // every live row matched: drop the file outright
                    actions.push(Action::Remove(tombstone(&scan.add)));
                    files_rewritten += 1;
                } else if self.use_deletion_vector(&snapshot, scan, strategy)? {
                    let deletes = scan.matched.iter().map(|(index, _)| *index);
                    let merged = merge_deletes(
                        self.storage().as_ref(),
                        scan.add.deletion_vector.as_ref(),
                        deletes,
                    )
                    .await?;
                    let (descriptor, dv_path) =
                        write_deletion_vector(self.storage().as_ref(), &merged).await?;
                    staged_paths.push(dv_path);
                    let mut masked = scan.add.clone();
                    masked.deletion_vector = Some(descriptor);
                    masked.data_change = true;
                    actions.push(Action::Add(masked));
                    files_with_dv += 1;
                } else {
                    let (add, path) = self
                        .stage_data_file(
                            &schema,
                            &scan.unmatched,
                            scan.add.partition_values.clone(),
                            true,
                        )
                        .await?;
                    staged_paths.push(path);
                    actions.push(Action::Remove(tombstone(&scan.add)));
                    actions.push(Action::Add(add));
                    files_rewritten += 1;
                }
            }
            if snapshot.properties().change_data_feed {
                let pending =
                    stage_change_data(self.storage().as_ref(), &change_records).await?;
                staged_paths.push(pending.path);
                actions.push(pending.action);
            }
            DeltaResult::Ok(())
        }
        .await;
        if let Err(err) = staging {
            self.cleanup_files(&staged_paths).await;
            return Err(err);
        }

        let mut txn = Transaction::new(
            OP_DELETE,
            Some(snapshot.version()),
            snapshot.partition_columns().to_vec(),
        )
        .with_parameter("predicate", json!(format!("{filter:?}")))
        .with_cancellation(cancel);
        txn.extend(actions);

        match txn.commit(self.storage().as_ref()).await {
            Ok(version) => {
                self.run_post_commit().await;
                Ok(DeleteResult {
                    version: Some(version),
                    rows_deleted,
                    files_rewritten,
                    files_with_new_deletion_vectors: files_with_dv,
                })
            }
            Err(err) => {
                self.cleanup_files(&staged_paths).await;
                Err(err)
            }
        }
    }

    /// Scan candidate files (post zone-map pruning) and split their live rows
    /// into matching and non-matching. Files with no match are skipped.
    async fn scan_matching_files(
        &self,
        snapshot: &Snapshot,
        filter: &Filter,
        cancel: &CancellationToken,
    ) -> DeltaResult<Vec<FileScan>> {
        let mut scans = Vec::new();
        for add in snapshot.files_matching(filter) {
            cancel.check()?;
            let indexed = self.read_rows_indexed(add).await?;
            let live_rows = indexed.len();
            let mut matched = Vec::new();
            let mut unmatched = Vec::new();
            for (index, row) in indexed {
                if filter.matches(&row) {
                    matched.push((index, row));
                } else {
                    unmatched.push(row);
                }
            }
            if !matched.is_empty() {
                scans.push(FileScan {
                    add: add.clone(),
                    matched,
                    unmatched,
                    live_rows,
                });
            }
        }
        Ok(scans)
    }

    fn use_deletion_vector(
        &self,
        snapshot: &Snapshot,
        scan: &FileScan,
        strategy: DeleteStrategy,
    ) -> DeltaResult<bool> {
        let supported = snapshot.protocol().supports_deletion_vectors();
        match strategy {
            DeleteStrategy::Rewrite => Ok(false),
            DeleteStrategy::DeletionVector if !supported => Err(Error::validation(
                "table protocol does not support deletion vectors",
            )),
            DeleteStrategy::DeletionVector => Ok(true),
            DeleteStrategy::Auto => {
                let fraction = scan.matched.len() as f64 / scan.live_rows.max(1) as f64;
                Ok(supported && fraction <= snapshot.properties().deletion_vector_threshold)
            }
        }
    }
}

fn tombstone(add: &Add) -> Remove {
    Remove {
        path: add.path.clone(),
        deletion_timestamp: Utc::now().timestamp_millis(),
        data_change: true,
        partition_values: Some(add.partition_values.clone()),
        size: Some(add.size),
        deletion_vector: add.deletion_vector.clone(),
    }
}
