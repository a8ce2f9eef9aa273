//! Deduplication: drop redundant rows by primary key or exact content.

use std::collections::{BTreeMap, HashMap};

use serde_json::json;
use tracing::instrument;

use crate::actions::{Action, Add};
use crate::cancel::CancellationToken;
use crate::cdc::{stage_change_data, ChangeType};
use crate::error::{DeltaResult, Error};
use crate::table::Table;
use crate::transaction::{Transaction, OP_DEDUPLICATE};
use crate::value::{value_cmp, Row, Value};
use crate::Version;

/// Which copy of a duplicated key survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::EnumString, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum KeepStrategy {
    /// The first row in table order.
    #[default]
    First,
    /// The last row in table order.
    Last,
    /// The row with the greatest `order_by` value (ties keep the last).
    Latest,
}

#[derive(Debug, Clone)]
pub struct DedupeOptions {
    /// Key columns; defaults to the table's configured primary keys.
    pub primary_key: Vec<String>,
    /// Group by full row content instead of the key columns.
    pub exact_duplicates: bool,
    pub keep: KeepStrategy,
    /// Ordering column, required by [`KeepStrategy::Latest`].
    pub order_by: Option<String>,
    pub cancel: CancellationToken,
}

impl Default for DedupeOptions {
    fn default() -> Self {
        Self {
            primary_key: Vec::new(),
            exact_duplicates: false,
            keep: KeepStrategy::default(),
            order_by: None,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DedupeMetrics {
    pub version: Option<Version>,
    pub rows_scanned: u64,
    pub duplicates_removed: u64,
    pub files_rewritten: usize,
    pub max_duplicates_per_key: u64,
    /// copies-per-key -> number of keys with that many copies (keys with
    /// more than one copy only).
    pub duplicate_histogram: BTreeMap<u64, u64>,
}

impl Table {
    /// Remove duplicate rows. Files containing dropped rows are rewritten;
    /// untouched files stay as they are.
    #[instrument(skip_all)]
    pub async fn deduplicate(&self, options: DedupeOptions) -> DeltaResult<DedupeMetrics> {
        let snapshot = self.snapshot().await?;
        let schema = snapshot.schema().clone();

        let key_columns = if options.exact_duplicates {
            Vec::new()
        } else if !options.primary_key.is_empty() {
            options.primary_key.clone()
        } else {
            snapshot.properties().primary_keys.clone()
        };
        if !options.exact_duplicates && key_columns.is_empty() {
            return Err(Error::validation(
                "deduplication needs primary key columns or exact_duplicates",
            ));
        }
        for column in &key_columns {
            if schema.field(column).is_none() {
                return Err(Error::validation(format!(
                    "primary key column {column:?} is not in the table schema"
                )));
            }
        }
        let order_column = match (options.keep, &options.order_by) {
            (KeepStrategy::Latest, None) => {
                return Err(Error::validation(
                    "keep strategy 'latest' requires an order_by column",
                ))
            }
            (_, order_by) => order_by.clone().unwrap_or_default(),
        };

        // read everything, keyed by (file, position) in table order
        let mut files: Vec<(Add, Vec<Row>)> = Vec::new();
        for add in snapshot.files() {
            options.cancel.check()?;
            let rows: Vec<Row> = self
                .read_rows_indexed(add)
                .await?
                .into_iter()
                .map(|(_, row)| row)
                .collect();
            files.push((add.clone(), rows));
        }

        let mut groups: HashMap<String, Vec<(usize, usize)>> = HashMap::new();
        let mut rows_scanned = 0u64;
        for (file_index, (_, rows)) in files.iter().enumerate() {
            for (position, row) in rows.iter().enumerate() {
                rows_scanned += 1;
                let key = if options.exact_duplicates {
                    blake3::hash(serde_json::to_string(row)?.as_bytes())
                        .to_hex()
                        .to_string()
                } else {
                    let key: Vec<&Value> = key_columns
                        .iter()
                        .map(|c| row.get(c).unwrap_or(&Value::Null))
                        .collect();
                    serde_json::to_string(&key)?
                };
                groups.entry(key).or_default().push((file_index, position));
            }
        }

        let mut drops: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut metrics = DedupeMetrics {
            version: None,
            rows_scanned,
            duplicates_removed: 0,
            files_rewritten: 0,
            max_duplicates_per_key: 0,
            duplicate_histogram: BTreeMap::new(),
        };
        for (_, occurrences) in groups {
            let copies = occurrences.len() as u64;
            if copies < 2 {
                continue;
            }
            metrics.max_duplicates_per_key = metrics.max_duplicates_per_key.max(copies);
            *metrics.duplicate_histogram.entry(copies).or_default() += 1;

            let keep_at = match options.keep {
                KeepStrategy::First => 0,
                KeepStrategy::Last => occurrences.len() - 1,
                KeepStrategy::Latest => {
                    let order_by = order_column.as_str();
                    let mut best = 0;
                    for (candidate, &(file_index, position)) in occurrences.iter().enumerate() {
                        let value = files[file_index].1[position]
                            .get(order_by)
                            .unwrap_or(&Value::Null);
                        let (best_file, best_position) = occurrences[best];
                        let best_value = files[best_file].1[best_position]
                            .get(order_by)
                            .unwrap_or(&Value::Null);
                        if value_cmp(value, best_value) != Some(std::cmp::Ordering::Less) {
                            best = candidate;
                        }
                    }
                    best
                }
            };
            for (index, &(file_index, position)) in occurrences.iter().enumerate() {
                if index != keep_at {
                    drops.entry(file_index).or_default().push(position);
                    metrics.duplicates_removed += 1;
                }
            }
        }

        if drops.is_empty() {
            return Ok(metrics);
        }

        let mut staged_paths = Vec::new();
        let mut actions = Vec::new();
        let mut change_records = Vec::new();
        let staging = async {
            for (file_index, (add, rows)) in files.iter().enumerate() {
                let Some(positions) = drops.get(&file_index) else {
                    continue;
                };
                options.cancel.check()?;
                let dropped: std::collections::HashSet<usize> =
                    positions.iter().copied().collect();
                let kept: Vec<Row> = rows
                    .iter()
                    .enumerate()
                    .filter(|(position, _)| !dropped.contains(position))
                    .map(|(_, row)| row.clone())
                    .collect();
                for position in positions {
                    change_records.push((ChangeType::Delete, rows[*position].clone()));
                }
                // dropping rows is a data change, unlike pure reorganization
                let mut remove = super::reorganize_tombstone(add);
                remove.data_change = true;
                actions.push(Action::Remove(remove));
                if !kept.is_empty() {
                    let (mut new_add, path) = self
                        .stage_data_file(&schema, &kept, add.partition_values.clone(), true)
                        .await?;
                    new_add.data_change = true;
                    staged_paths.push(path);
                    actions.push(Action::Add(new_add));
                }
                metrics.files_rewritten += 1;
            }
            if snapshot.properties().change_data_feed && !change_records.is_empty() {
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
            OP_DEDUPLICATE,
            Some(snapshot.version()),
            snapshot.partition_columns().to_vec(),
        )
        .with_parameter("keep", json!(options.keep.to_string()))
        .with_parameter("exactDuplicates", json!(options.exact_duplicates))
        .with_cancellation(options.cancel.clone());
        txn.extend(actions);

        match txn.commit(self.storage().as_ref()).await {
            Ok(version) => {
                self.run_post_commit().await;
                metrics.version = Some(version);
                Ok(metrics)
            }
            Err(err) => {
                self.cleanup_files(&staged_paths).await;
                Err(err)
            }
        }
    }
}
