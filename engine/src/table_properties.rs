//! Typed view over `metadata.configuration`. Unknown keys are preserved by
//! the metadata action and ignored here, never rejected.

use std::collections::HashMap;
use std::time::Duration;

pub const ENABLE_CHANGE_DATA_FEED: &str = "delta.enableChangeDataFeed";
pub const CHANGE_DATA_RETENTION_MS: &str = "delta.changeDataFeed.retentionMs";
pub const CHECKPOINT_INTERVAL: &str = "delta.checkpointInterval";
pub const CHECKPOINT_MAX_ACTIONS: &str = "delta.checkpoint.maxActions";
pub const CHECKPOINT_NUM_RETAINED: &str = "delta.checkpoint.numRetained";
pub const CHECKPOINT_RETENTION_MS: &str = "delta.checkpoint.retentionMs";
pub const DELETED_FILE_RETENTION_MS: &str = "delta.deletedFileRetentionMs";
pub const TARGET_FILE_SIZE: &str = "delta.targetFileSize";
pub const DELETION_VECTOR_THRESHOLD: &str = "delta.deletionVectors.maxMatchFraction";
pub const PRIMARY_KEYS: &str = "delta.primaryKeys";

const WEEK_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Parsed table configuration with engine defaults filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct TableProperties {
    /// Whether writes produce change data records.
    pub change_data_feed: bool,
    /// How long change data files are kept before vacuum may remove them.
    pub change_data_retention_ms: i64,
    /// Checkpoint every this many versions.
    pub checkpoint_interval: u64,
    /// Checkpoint early once this many actions accumulated since the last one.
    pub checkpoint_max_actions: usize,
    /// How many old checkpoints to keep around.
    pub checkpoint_num_retained: usize,
    /// Age-based retention for old checkpoints.
    pub checkpoint_retention_ms: i64,
    /// Minimum age before tombstoned data files may be vacuumed.
    pub deleted_file_retention_ms: i64,
    /// Target size for written data files.
    pub target_file_size: u64,
    /// Delete rewrites switch to deletion vectors below this matching-row
    /// fraction.
    pub deletion_vector_threshold: f64,
    /// Primary key columns, used by CDC record identity and deduplication.
    pub primary_keys: Vec<String>,
}

impl Default for TableProperties {
    fn default() -> Self {
        Self {
            change_data_feed: false,
            change_data_retention_ms: WEEK_MS,
            checkpoint_interval: 10,
            checkpoint_max_actions: 10_000,
            checkpoint_num_retained: 2,
            checkpoint_retention_ms: WEEK_MS,
            deleted_file_retention_ms: WEEK_MS,
            target_file_size: 128 * 1024 * 1024,
            deletion_vector_threshold: 0.2,
            primary_keys: Vec::new(),
        }
    }
}

impl From<&HashMap<String, String>> for TableProperties {
    fn from(configuration: &HashMap<String, String>) -> Self {
        let mut props = TableProperties::default();
        let parse = |key: &str| configuration.get(key);
        if let Some(value) = parse(ENABLE_CHANGE_DATA_FEED) {
            props.change_data_feed = value.eq_ignore_ascii_case("true");
        }
        if let Some(value) = parse(CHANGE_DATA_RETENTION_MS).and_then(|v| v.parse().ok()) {
            props.change_data_retention_ms = value;
        }
        if let Some(value) = parse(CHECKPOINT_INTERVAL).and_then(|v| v.parse().ok()) {
            props.checkpoint_interval = value;
        }
        if let Some(value) = parse(CHECKPOINT_MAX_ACTIONS).and_then(|v| v.parse().ok()) {
            props.checkpoint_max_actions = value;
        }
        if let Some(value) = parse(CHECKPOINT_NUM_RETAINED).and_then(|v| v.parse().ok()) {
            props.checkpoint_num_retained = value;
        }
        if let Some(value) = parse(CHECKPOINT_RETENTION_MS).and_then(|v| v.parse().ok()) {
            props.checkpoint_retention_ms = value;
        }
        if let Some(value) = parse(DELETED_FILE_RETENTION_MS).and_then(|v| v.parse().ok()) {
            props.deleted_file_retention_ms = value;
        }
        if let Some(value) = parse(TARGET_FILE_SIZE).and_then(|v| v.parse().ok()) {
            props.target_file_size = value;
        }
        if let Some(value) = parse(DELETION_VECTOR_THRESHOLD).and_then(|v| v.parse().ok()) {
            props.deletion_vector_threshold = value;
        }
        if let Some(value) = parse(PRIMARY_KEYS) {
            props.primary_keys = value
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }
        props
    }
}

impl TableProperties {
    pub fn deleted_file_retention(&self) -> Duration {
        Duration::from_millis(self.deleted_file_retention_ms.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let empty = HashMap::new();
        let props = TableProperties::from(&empty);
        assert!(!props.change_data_feed);
        assert_eq!(props.checkpoint_interval, 10);
        assert_eq!(props.target_file_size, 128 * 1024 * 1024);

        let config: HashMap<_, _> = [
            (ENABLE_CHANGE_DATA_FEED.to_string(), "true".to_string()),
            (CHECKPOINT_INTERVAL.to_string(), "3".to_string()),
            (PRIMARY_KEYS.to_string(), "id, tenant".to_string()),
            ("some.unknown.key".to_string(), "whatever".to_string()),
        ]
        .into_iter()
        .collect();
        let props = TableProperties::from(&config);
        assert!(props.change_data_feed);
        assert_eq!(props.checkpoint_interval, 3);
        assert_eq!(props.primary_keys, vec!["id", "tenant"]);
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        let config: HashMap<_, _> =
            [(CHECKPOINT_INTERVAL.to_string(), "soon".to_string())].into_iter().collect();
        assert_eq!(TableProperties::from(&config).checkpoint_interval, 10);
    }
}
