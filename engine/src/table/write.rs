//! Appending rows: materialize parquet files, stage change data, commit.

use std::collections::HashMap;

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::actions::{Action, Add};
use crate::cancel::CancellationToken;
use crate::cdc::{stage_change_data, ChangeType};
use crate::checkpoint::maybe_checkpoint;
use crate::error::{DeltaResult, Error};
use crate::parquet::WriteOptions;
use crate::path::partition_path;
use crate::schema::StructType;
use crate::snapshot::Snapshot;
use crate::table::Table;
use crate::transaction::{Transaction, OP_WRITE};
use crate::value::Row;
use crate::Version;

#[derive(Debug, Clone, Default)]
pub struct WriteParams {
    /// Override the table's target data file size.
    pub target_file_size: Option<u64>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WriteResult {
    pub version: Version,
    pub files_added: usize,
    pub rows_written: u64,
}

impl Table {
    /// Append rows to the table.
    pub async fn write(&self, rows: Vec<Row>) -> DeltaResult<WriteResult> {
        self.write_with(rows, WriteParams::default()).await
    }

    #[instrument(skip_all, fields(rows = rows.len()))]
    pub async fn write_with(
        &self,
        rows: Vec<Row>,
        params: WriteParams,
    ) -> DeltaResult<WriteResult> {
        if rows.is_empty() {
            return Err(Error::validation("cannot write zero rows"));
        }
        let snapshot = self.snapshot().await?;
        let schema = snapshot.schema().clone();
        let rows: Vec<Row> = rows
            .into_iter()
            .map(|row| schema.normalize_row(row))
            .collect::<DeltaResult<_>>()?;
        params.cancel.check()?;

        let target = params
            .target_file_size
            .unwrap_or(snapshot.properties().target_file_size);

        let mut staged_paths = Vec::new();
        let mut actions = Vec::new();
        let mut rows_in_order = Vec::new();
        let result = self
            .stage_write(
                &snapshot,
                &schema,
                rows,
                target,
                &params.cancel,
                &mut staged_paths,
                &mut actions,
                &mut rows_in_order,
            )
            .await;
        if let Err(err) = result {
            self.cleanup_files(&staged_paths).await;
            return Err(err);
        }

        if snapshot.properties().change_data_feed {
            let records: Vec<(ChangeType, Row)> = rows_in_order
                .iter()
                .map(|row| (ChangeType::Insert, row.clone()))
                .collect();
            match stage_change_data(self.storage().as_ref(), &records).await {
                Ok(pending) => {
                    staged_paths.push(pending.path);
                    actions.push(pending.action);
                }
                Err(err) => {
                    self.cleanup_files(&staged_paths).await;
                    return Err(err);
                }
            }
        }

        let files_added = actions
            .iter()
            .filter(|a| matches!(a, Action::Add(_)))
            .count();
        let rows_written = rows_in_order.len() as u64;

        let mut txn = Transaction::new(
            OP_WRITE,
            Some(snapshot.version()),
            snapshot.partition_columns().to_vec(),
        )
        .with_parameter("mode", json!("Append"))
        .with_cancellation(params.cancel.clone());
        txn.extend(actions);

        match txn.commit(self.storage().as_ref()).await {
            Ok(version) => {
                self.run_post_commit().await;
                Ok(WriteResult {
                    version,
                    files_added,
                    rows_written,
                })
            }
            Err(err) => {
                self.cleanup_files(&staged_paths).await;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stage_write(
        &self,
        snapshot: &Snapshot,
        schema: &StructType,
        rows: Vec<Row>,
        target_file_size: u64,
        cancel: &CancellationToken,
        staged_paths: &mut Vec<String>,
        actions: &mut Vec<Action>,
        rows_in_order: &mut Vec<Row>,
    ) -> DeltaResult<()> {
        let partition_columns = snapshot.partition_columns();
        let mut groups: IndexMap<Vec<String>, Vec<Row>> = IndexMap::new();
        for row in rows {
            let key = partition_columns
                .iter()
                .map(|column| {
                    row.get(column)
                        .map(|v| v.to_partition_string())
                        .unwrap_or_default()
                })
                .collect();
            groups.entry(key).or_default().push(row);
        }

        for (key, group_rows) in groups {
            let partition_values: HashMap<String, String> = partition_columns
                .iter()
                .cloned()
                .zip(key)
                .collect();
            for chunk in split_rows(group_rows, target_file_size) {
                cancel.check()?;
                let (add, path) = self
                    .stage_data_file(schema, &chunk, partition_values.clone(), true)
                    .await?;
                staged_paths.push(path);
                actions.push(Action::Add(add));
                rows_in_order.extend(chunk);
            }
        }
        Ok(())
    }

    /// Write one parquet data file and return its `add` action plus the
    /// staged path (for failure cleanup).
    pub(crate) async fn stage_data_file(
        &self,
        schema: &StructType,
        rows: &[Row],
        partition_values: HashMap<String, String>,
        data_change: bool,
    ) -> DeltaResult<(Add, String)> {
        let output = self
            .adapter()
            .write(rows, schema, &WriteOptions::default())?;
        let mut columns: Vec<String> = partition_values.keys().cloned().collect();
        columns.sort_unstable();
        let prefix = partition_path(&columns, &partition_values);
        let path = format!("{prefix}part-{}.parquet", Uuid::new_v4());
        let size = output.bytes.len() as i64;
        self.storage().write(&path, output.bytes).await?;
        let add = Add {
            path: path.clone(),
            partition_values,
            size,
            modification_time: Utc::now().timestamp_millis(),
            data_change,
            stats: Some(output.stats.to_json()?),
            tags: None,
            deletion_vector: None,
        };
        Ok((add, path))
    }

    /// Post-commit housekeeping: checkpoint when policy calls for it.
    /// Failures only warn; the commit has already succeeded.
    pub(crate) async fn run_post_commit(&self) {
        match self.snapshot().await {
            Ok(snapshot) => {
                maybe_checkpoint(self.storage().as_ref(), &snapshot).await;
            }
            Err(err) => tracing::warn!(%err, "post-commit snapshot failed"),
        }
    }
}

/// Estimate the materialized size of a row (JSON length is a workable proxy
/// for parquet size at the scale where splitting matters).
pub(crate) fn estimate_row_bytes(row: &Row) -> usize {
    serde_json::to_string(row).map(|s| s.len()).unwrap_or(64)
}

/// Split rows into chunks of roughly `target_bytes` each, preserving order.
pub(crate) fn split_rows(rows: Vec<Row>, target_bytes: u64) -> Vec<Vec<Row>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0u64;
    for row in rows {
        let row_bytes = estimate_row_bytes(&row) as u64;
        if !current.is_empty() && current_bytes + row_bytes > target_bytes {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += row_bytes;
        current.push(row);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row(id: i64) -> Row {
        [
            ("id".to_string(), Value::Integer(id)),
            ("payload".to_string(), Value::String("x".repeat(40))),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn split_respects_target_size() {
        let rows: Vec<Row> = (0..10).map(row).collect();
        let per_row = estimate_row_bytes(&rows[0]) as u64;

        let one = split_rows(rows.clone(), per_row * 100);
        assert_eq!(one.len(), 1);

        let several = split_rows(rows.clone(), per_row * 3);
        assert!(several.len() >= 3);
        let total: usize = several.iter().map(Vec::len).sum();
        assert_eq!(total, 10);

        // a tiny target still produces one row per chunk, never zero
        let tiny = split_rows(rows, 1);
        assert_eq!(tiny.len(), 10);
    }
}
