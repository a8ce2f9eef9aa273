//! Compaction: bin-pack small files into files of the target size.

use std::collections::HashMap;

use serde_json::json;
use tracing::{debug, instrument};

use crate::actions::{Action, Add};
use crate::cancel::CancellationToken;
use crate::error::{DeltaResult, Error};
use crate::ops::{partition_key, reorganize_tombstone};
use crate::table::Table;
use crate::transaction::{Transaction, OP_OPTIMIZE};
use crate::value::Row;
use crate::Version;

/// How files are ordered when packing bins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, strum::EnumString, strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum CompactionStrategy {
    /// First-fit decreasing by size.
    #[default]
    BinPacking,
    /// Largest files first, filling one bin at a time.
    Greedy,
    /// Smallest files first, filling one bin at a time.
    SortBySize,
}

#[derive(Debug, Clone)]
pub struct CompactionOptions {
    /// Files below this size are candidates; defaults to the table property.
    pub target_file_size: Option<u64>,
    pub strategy: CompactionStrategy,
    /// Keep row order per source file (in table order) inside each output.
    pub preserve_order: bool,
    /// Recompute row counts and a content checksum before committing.
    pub verify_integrity: bool,
    pub cancel: CancellationToken,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            target_file_size: None,
            strategy: CompactionStrategy::default(),
            preserve_order: true,
            verify_integrity: false,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CompactionMetrics {
    /// `None` when nothing needed compacting.
    pub version: Option<Version>,
    pub files_compacted: usize,
    pub files_created: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub rows: u64,
    /// `sum(outputFileSizes) / (numOutputFiles * targetFileSize)`, in [0, 1].
    pub efficiency: f64,
}

impl Table {
    /// Compact small files. Bins never mix partitions; bins of a single file
    /// are left alone.
    #[instrument(skip_all)]
    pub async fn compact(&self, options: CompactionOptions) -> DeltaResult<CompactionMetrics> {
        let snapshot = self.snapshot().await?;
        let schema = snapshot.schema().clone();
        let target = options
            .target_file_size
            .unwrap_or(snapshot.properties().target_file_size);

        // table order index decides row order when preserve_order is set
        let table_order: HashMap<&str, usize> = snapshot
            .files()
            .enumerate()
            .map(|(position, add)| (add.path.as_str(), position))
            .collect();

        let mut groups: HashMap<String, Vec<&Add>> = HashMap::new();
        for add in snapshot.files() {
            if (add.size as u64) < target {
                groups.entry(partition_key(add)).or_default().push(add);
            }
        }

        let mut bins: Vec<Vec<&Add>> = Vec::new();
        for (_, files) in groups {
            bins.extend(
                pack(files, options.strategy, target)
                    .into_iter()
                    .filter(|bin| bin.len() >= 2),
            );
        }
        if bins.is_empty() {
            return Ok(CompactionMetrics {
                version: None,
                files_compacted: 0,
                files_created: 0,
                bytes_in: 0,
                bytes_out: 0,
                rows: 0,
                efficiency: 0.0,
            });
        }

        let mut metrics = CompactionMetrics {
            version: None,
            files_compacted: 0,
            files_created: 0,
            bytes_in: 0,
            bytes_out: 0,
            rows: 0,
            efficiency: 0.0,
        };
        let mut staged_paths = Vec::new();
        let mut actions = Vec::new();

        let staging = async {
            for mut bin in bins {
                options.cancel.check()?;
                if options.preserve_order {
                    bin.sort_by_key(|add| table_order[add.path.as_str()]);
                }
                let mut rows: Vec<Row> = Vec::new();
                let mut expected_rows = 0u64;
                for add in &bin {
                    let live = self.read_rows_indexed(add).await?;
                    if let Some(known) = add.num_live_records() {
                        expected_rows += known;
                    } else {
                        expected_rows += live.len() as u64;
                    }
                    rows.extend(live.into_iter().map(|(_, row)| row));
                }
                if rows.len() as u64 != expected_rows {
                    return Err(Error::storage(
                        format!(
                            "integrity check failed: read {} rows, statistics say {expected_rows}",
                            rows.len()
                        ),
                        false,
                    ));
                }

                let partition_values = bin[0].partition_values.clone();
                let (mut add, path) = self
                    .stage_data_file(&schema, &rows, partition_values, false)
                    .await?;
                add.data_change = false;
                staged_paths.push(path);
                if options.verify_integrity {
                    self.verify_staged_file(&add, &rows).await?;
                }
                metrics.files_compacted += bin.len();
                metrics.files_created += 1;
                metrics.bytes_in += bin.iter().map(|f| f.size.max(0) as u64).sum::<u64>();
                metrics.bytes_out += add.size.max(0) as u64;
                metrics.rows += rows.len() as u64;
                for input in bin {
                    actions.push(Action::Remove(reorganize_tombstone(input)));
                }
                actions.push(Action::Add(add));
            }
            DeltaResult::Ok(())
        }
        .await;
        if let Err(err) = staging {
            self.cleanup_files(&staged_paths).await;
            return Err(err);
        }

        let mut txn = Transaction::new(
            OP_OPTIMIZE,
            Some(snapshot.version()),
            snapshot.partition_columns().to_vec(),
        )
        .with_parameter("strategy", json!(options.strategy.to_string()))
        .with_parameter("targetSize", json!(target))
        .with_cancellation(options.cancel.clone());
        txn.extend(actions);

        match txn.commit(self.storage().as_ref()).await {
            Ok(version) => {
                self.run_post_commit().await;
                metrics.version = Some(version);
                metrics.efficiency = (metrics.bytes_out as f64
                    / (metrics.files_created.max(1) as f64 * target as f64))
                    .clamp(0.0, 1.0);
                debug!(
                    files_compacted = metrics.files_compacted,
                    files_created = metrics.files_created,
                    "compaction committed"
                );
                Ok(metrics)
            }
            Err(err) => {
                self.cleanup_files(&staged_paths).await;
                Err(err)
            }
        }
    }
}

impl Table {
    /// Read a freshly staged file back and compare a content checksum against
    /// the rows it was written from.
    async fn verify_staged_file(&self, add: &Add, source_rows: &[Row]) -> DeltaResult<()> {
        let bytes = self.storage().read(&add.path).await?;
        let written = self
            .adapter()
            .read(bytes, &crate::parquet::ReadOptions::default())?;
        if written.len() != source_rows.len()
            || content_checksum(&written) != content_checksum(source_rows)
        {
            return Err(Error::storage(
                format!("integrity check failed for staged file {}", add.path),
                false,
            ));
        }
        Ok(())
    }
}

fn content_checksum(rows: &[Row]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for row in rows {
        if let Ok(encoded) = serde_json::to_string(row) {
            hasher.update(encoded.as_bytes());
        }
    }
    hasher.finalize()
}

/// Pack files into bins of at most `target` total bytes.
fn pack(mut files: Vec<&Add>, strategy: CompactionStrategy, target: u64) -> Vec<Vec<&Add>> {
    match strategy {
        CompactionStrategy::BinPacking => {
            files.sort_by_key(|f| std::cmp::Reverse(f.size));
            let mut bins: Vec<(u64, Vec<&Add>)> = Vec::new();
            for file in files {
                let size = file.size.max(0) as u64;
                match bins.iter_mut().find(|(used, _)| used + size <= target) {
                    Some((used, bin)) => {
                        *used += size;
                        bin.push(file);
                    }
                    None => bins.push((size, vec![file])),
                }
            }
            bins.into_iter().map(|(_, bin)| bin).collect()
        }
        CompactionStrategy::Greedy | CompactionStrategy::SortBySize => {
            match strategy {
                CompactionStrategy::Greedy => files.sort_by_key(|f| std::cmp::Reverse(f.size)),
                _ => files.sort_by_key(|f| f.size),
            }
            let mut bins = Vec::new();
            let mut current: Vec<&Add> = Vec::new();
            let mut used = 0u64;
            for file in files {
                let size = file.size.max(0) as u64;
                if !current.is_empty() && used + size > target {
                    bins.push(std::mem::take(&mut current));
                    used = 0;
                }
                used += size;
                current.push(file);
            }
            if !current.is_empty() {
                bins.push(current);
            }
            bins
        }
    }
}
