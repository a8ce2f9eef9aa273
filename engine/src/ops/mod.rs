//! Storage optimization: compaction, deduplication, clustering, and vacuum.
//! The first three share one shape: select live files F, read them, write
//! replacement files F', and commit `remove(F) + add(F')` as a single
//! transaction. Replacement files are cleaned up if the commit fails.

mod cluster;
mod compact;
mod dedupe;
mod vacuum;

pub use cluster::{ClusteringMetrics, ClusteringOptions, CurveKind};
pub use compact::{CompactionMetrics, CompactionOptions, CompactionStrategy};
pub use dedupe::{DedupeMetrics, DedupeOptions, KeepStrategy};
pub use vacuum::{VacuumMetrics, VacuumOptions};

use crate::actions::{Add, Remove};
use chrono::Utc;

/// Tombstone an input file of a reorganization. `data_change` is false:
/// optimize commits rearrange bytes, they do not change table contents.
pub(crate) fn reorganize_tombstone(add: &Add) -> Remove {
    Remove {
        path: add.path.clone(),
        deletion_timestamp: Utc::now().timestamp_millis(),
        data_change: false,
        partition_values: Some(add.partition_values.clone()),
        size: Some(add.size),
        deletion_vector: add.deletion_vector.clone(),
    }
}

/// Stable grouping key for a file's partition values.
pub(crate) fn partition_key(add: &Add) -> String {
    let mut pairs: Vec<(&String, &String)> = add.partition_values.iter().collect();
    pairs.sort();
    serde_json::to_string(&pairs).unwrap_or_default()
}
