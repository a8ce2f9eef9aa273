//! Space-filling-curve clustering: rewrite the table with rows sorted along
//! a Z-order or Hilbert curve over the clustering columns, tightening zone
//! maps for data skipping.

use std::collections::HashMap;

use serde_json::json;
use tracing::instrument;

use crate::actions::{Action, Add};
use crate::cancel::CancellationToken;
use crate::error::{DeltaResult, Error};
use crate::ops::{partition_key, reorganize_tombstone};
use crate::stats::FileStats;
use crate::table::write::split_rows;
use crate::table::Table;
use crate::transaction::{Transaction, OP_CLUSTER};
use crate::value::{Row, Value};
use crate::Version;

/// Which space-filling curve orders the rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::EnumString, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CurveKind {
    /// Bit-interleaving (Morton order).
    #[default]
    ZOrder,
    /// Hilbert curve; better locality, costlier to compute.
    Hilbert,
}

#[derive(Debug, Clone)]
pub struct ClusteringOptions {
    pub columns: Vec<String>,
    pub curve: CurveKind,
    /// Quantization bits per column (21 bits x 3 columns spans 63 bits).
    pub bits: u32,
    pub target_file_size: Option<u64>,
    pub cancel: CancellationToken,
}

impl ClusteringOptions {
    pub fn new(columns: impl Into<Vec<String>>) -> Self {
        Self {
            columns: columns.into(),
            curve: CurveKind::default(),
            bits: 21,
            target_file_size: None,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ClusteringMetrics {
    pub version: Option<Version>,
    pub files_in: usize,
    pub files_out: usize,
    pub rows: u64,
    /// Mean normalized zone width of the clustering columns before/after.
    pub avg_zone_width_before: f64,
    pub avg_zone_width_after: f64,
    /// Width shrink achieved, `max(0, before - after)`.
    pub dataskipping_improvement: f64,
    /// Estimated fraction of files a point query on a clustering column can
    /// skip, `1 - avg_zone_width_after`.
    pub estimated_skip_rate: f64,
}

/// Per-column affine projection of values onto [0, 1].
struct Normalizer {
    column: String,
    min: f64,
    max: f64,
}

impl Normalizer {
    /// Project a value onto the number line: numerics and timestamps as
    /// themselves, strings by their first eight bytes (big-endian).
    fn project(value: &Value) -> Option<f64> {
        match value {
            Value::String(s) => {
                let mut bytes = [0u8; 8];
                for (i, b) in s.as_bytes().iter().take(8).enumerate() {
                    bytes[i] = *b;
                }
                Some(u64::from_be_bytes(bytes) as f64)
            }
            other => other.as_f64(),
        }
    }

    fn normalize(&self, row: &Row) -> f64 {
        let Some(value) = row.get(&self.column).and_then(Self::project) else {
            return 0.0;
        };
        if self.max <= self.min {
            return 0.0;
        }
        ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
    }
}

impl Table {
    /// Rewrite all live files with rows ordered along the configured curve.
    /// Partitions cluster independently; partition columns stay path-encoded.
    #[instrument(skip_all, fields(curve = %options.curve))]
    pub async fn cluster(&self, options: ClusteringOptions) -> DeltaResult<ClusteringMetrics> {
        let snapshot = self.snapshot().await?;
        let schema = snapshot.schema().clone();
        if options.columns.is_empty() {
            return Err(Error::validation("clustering needs at least one column"));
        }
        for column in &options.columns {
            if schema.field(column).is_none() {
                return Err(Error::validation(format!(
                    "clustering column {column:?} is not in the table schema"
                )));
            }
        }
        if options.bits == 0 || options.bits as usize * options.columns.len() > 124 {
            return Err(Error::validation(format!(
                "{} bits x {} columns does not fit a sort key",
                options.bits,
                options.columns.len()
            )));
        }
        let target = options
            .target_file_size
            .unwrap_or(snapshot.properties().target_file_size);

        // group files by partition, read everything
        let mut partitions: HashMap<String, (Vec<Add>, Vec<Row>)> = HashMap::new();
        for add in snapshot.files() {
            options.cancel.check()?;
            let rows = self.read_rows_indexed(add).await?;
            let entry = partitions.entry(partition_key(add)).or_default();
            entry.0.push(add.clone());
            entry.1.extend(rows.into_iter().map(|(_, row)| row));
        }
        let files_in: usize = partitions.values().map(|(adds, _)| adds.len()).sum();
        if files_in == 0 {
            return Ok(ClusteringMetrics {
                version: None,
                files_in: 0,
                files_out: 0,
                rows: 0,
                avg_zone_width_before: 0.0,
                avg_zone_width_after: 0.0,
                dataskipping_improvement: 0.0,
                estimated_skip_rate: 0.0,
            });
        }

        // dataset-wide normalization bounds per clustering column
        let all_rows = partitions.values().flat_map(|(_, rows)| rows.iter());
        let normalizers = build_normalizers(&options.columns, all_rows);

        let before = average_zone_width(
            &normalizers,
            partitions.values().flat_map(|(adds, _)| {
                adds.iter()
                    .filter_map(|add| add.stats.as_deref())
                    .filter_map(|s| FileStats::parse(s).ok())
            }),
        );

        let mut staged_paths = Vec::new();
        let mut actions = Vec::new();
        let mut metrics = ClusteringMetrics {
            version: None,
            files_in,
            files_out: 0,
            rows: 0,
            avg_zone_width_before: before,
            avg_zone_width_after: 0.0,
            dataskipping_improvement: 0.0,
            estimated_skip_rate: 0.0,
        };
        let mut output_stats: Vec<FileStats> = Vec::new();

        let staging = async {
            for (_, (adds, mut rows)) in partitions {
                options.cancel.check()?;
                rows.sort_by_cached_key(|row| {
                    let coordinates: Vec<u64> = normalizers
                        .iter()
                        .map(|n| quantize(n.normalize(row), options.bits))
                        .collect();
                    match options.curve {
                        CurveKind::ZOrder => morton_key(&coordinates, options.bits),
                        CurveKind::Hilbert => hilbert_key(&coordinates, options.bits),
                    }
                });
                metrics.rows += rows.len() as u64;

                let partition_values = adds[0].partition_values.clone();
                for chunk in split_rows(rows, target) {
                    options.cancel.check()?;
                    let (mut add, path) = self
                        .stage_data_file(&schema, &chunk, partition_values.clone(), false)
                        .await?;
                    add.data_change = false;
                    output_stats.push(FileStats::from_rows(chunk.iter()));
                    staged_paths.push(path);
                    actions.push(Action::Add(add));
                    metrics.files_out += 1;
                }
                for input in adds {
                    actions.push(Action::Remove(reorganize_tombstone(&input)));
                }
            }
            DeltaResult::Ok(())
        }
        .await;
        if let Err(err) = staging {
            self.cleanup_files(&staged_paths).await;
            return Err(err);
        }

        metrics.avg_zone_width_after = average_zone_width(&normalizers, output_stats.into_iter());
        metrics.dataskipping_improvement =
            (metrics.avg_zone_width_before - metrics.avg_zone_width_after).max(0.0);
        metrics.estimated_skip_rate = (1.0 - metrics.avg_zone_width_after).clamp(0.0, 1.0);

        let mut txn = Transaction::new(
            OP_CLUSTER,
            Some(snapshot.version()),
            snapshot.partition_columns().to_vec(),
        )
        .with_parameter("columns", json!(options.columns))
        .with_parameter("curve", json!(options.curve.to_string()))
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

fn build_normalizers<'a>(
    columns: &[String],
    rows: impl Iterator<Item = &'a Row>,
) -> Vec<Normalizer> {
    let mut bounds: Vec<(f64, f64)> = vec![(f64::INFINITY, f64::NEG_INFINITY); columns.len()];
    for row in rows {
        for (i, column) in columns.iter().enumerate() {
            if let Some(projected) = row.get(column).and_then(Normalizer::project) {
                bounds[i].0 = bounds[i].0.min(projected);
                bounds[i].1 = bounds[i].1.max(projected);
            }
        }
    }
    columns
        .iter()
        .zip(bounds)
        .map(|(column, (min, max))| Normalizer {
            column: column.clone(),
            min,
            max,
        })
        .collect()
}

fn quantize(normalized: f64, bits: u32) -> u64 {
    let levels = (1u64 << bits) - 1;
    (normalized * levels as f64).round() as u64
}

/// Morton order: interleave the coordinate bits, most significant first.
fn morton_key(coordinates: &[u64], bits: u32) -> u128 {
    let mut key: u128 = 0;
    for bit in (0..bits).rev() {
        for coordinate in coordinates {
            key = (key << 1) | (((coordinate >> bit) & 1) as u128);
        }
    }
    key
}

/// Hilbert order via Skilling's transform: convert the coordinates into the
/// transposed Hilbert representation, then gather bits like Morton.
fn hilbert_key(coordinates: &[u64], bits: u32) -> u128 {
    let mut x: Vec<u64> = coordinates.to_vec();
    let n = x.len();
    if n == 1 {
        return x[0] as u128;
    }
    let m = 1u64 << (bits - 1);

    // inverse undo excess work
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }
    // Gray encode
    for i in 1..n {
        let prev = x[i - 1];
        x[i] ^= prev;
    }
    let mut t = 0u64;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for value in x.iter_mut() {
        *value ^= t;
    }

    morton_key(&x, bits)
}

/// Mean normalized zone width over the clustering columns of each file.
fn average_zone_width(
    normalizers: &[Normalizer],
    stats: impl Iterator<Item = FileStats>,
) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for file in stats {
        for normalizer in normalizers {
            let zone = file.zone(&normalizer.column);
            let (Some(min), Some(max)) = (&zone.min, &zone.max) else {
                continue;
            };
            let (Some(low), Some(high)) =
                (Normalizer::project(min), Normalizer::project(max))
            else {
                continue;
            };
            if normalizer.max > normalizer.min {
                let range = normalizer.max - normalizer.min;
                total += ((high - low) / range).clamp(0.0, 1.0);
                count += 1;
            }
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}
