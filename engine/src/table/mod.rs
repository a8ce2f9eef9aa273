//! The table handle: opening, creating, and reading tables. Mutating
//! operations live in the sibling modules and all follow the same shape:
//! read a snapshot, write data files, submit actions through the commit
//! protocol, clean up on failure.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use roaring::RoaringTreemap;
use url::Url;

use crate::actions::{Action, Add, Metadata, Protocol, CHANGE_DATA_FEED_FEATURE, DELETION_VECTORS_FEATURE};
use crate::error::{DeltaResult, Error};
use crate::parquet::{ArrowParquetAdapter, ParquetAdapter, ReadOptions};
use crate::path::decode_path;
use crate::predicate::Filter;
use crate::schema::StructType;
use crate::snapshot::{history, HistoryEntry, Snapshot};
use crate::storage::{parse_table_uri, storage_for_url, StorageBackend, StorageOptions};
use crate::transaction::{Transaction, OP_CREATE};
use crate::value::Row;
use crate::Version;

mod merge;
mod mutate;
pub(crate) mod write;

pub use merge::{Merge, MergeResult};
pub use mutate::{DeleteResult, DeleteStrategy, UpdateResult};
pub use write::{WriteParams, WriteResult};

/// A handle to one table. Cheap to clone; all state lives in the log.
#[derive(Debug, Clone)]
pub struct Table {
    location: Url,
    storage: Arc<dyn StorageBackend>,
    adapter: Arc<dyn ParquetAdapter>,
}

impl Table {
    /// Open a table at a URI (`file://`, `/path`, `memory://`, `s3://`,
    /// `r2://`). The table need not exist yet; reads will fail until it does.
    pub fn try_from_uri(uri: &str) -> DeltaResult<Self> {
        let location = parse_table_uri(uri)?;
        let storage = storage_for_url(&location, &StorageOptions::default())?;
        Ok(Self::new(location, storage))
    }

    /// Open a table over an explicit storage backend.
    pub fn new(location: Url, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            location,
            storage,
            adapter: Arc::new(ArrowParquetAdapter),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ParquetAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub(crate) fn adapter(&self) -> &Arc<dyn ParquetAdapter> {
        &self.adapter
    }

    /// Begin creating a new table at this location.
    pub fn create(self, schema: StructType) -> CreateTableBuilder {
        CreateTableBuilder::new(self, schema)
    }

    /// The snapshot at the latest version.
    pub async fn snapshot(&self) -> DeltaResult<Snapshot> {
        Snapshot::try_new(self.storage.as_ref(), None).await
    }

    /// Time travel: the snapshot at a specific version.
    pub async fn snapshot_at(&self, version: Version) -> DeltaResult<Snapshot> {
        Snapshot::try_new(self.storage.as_ref(), Some(version)).await
    }

    /// Commit audit records, newest first.
    pub async fn history(&self, limit: Option<usize>) -> DeltaResult<Vec<HistoryEntry>> {
        history(self.storage.as_ref(), limit).await
    }

    /// Read every live row matching `filter`, applying zone-map pruning,
    /// deletion vectors, and row-level filtering.
    pub async fn read(&self, filter: &Filter) -> DeltaResult<Vec<Row>> {
        let snapshot = self.snapshot().await?;
        self.read_at(&snapshot, filter).await
    }

    pub(crate) async fn read_at(
        &self,
        snapshot: &Snapshot,
        filter: &Filter,
    ) -> DeltaResult<Vec<Row>> {
        let mut rows = Vec::new();
        for add in snapshot.files_matching(filter) {
            for (_, row) in self.read_rows_indexed(add).await? {
                if filter.matches(&row) {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    /// Read a file's live rows paired with their physical row indices
    /// (deletion-vector row numbering).
    pub(crate) async fn read_rows_indexed(&self, add: &Add) -> DeltaResult<Vec<(u64, Row)>> {
        let bytes = self.storage.read(&decode_path(&add.path)).await?;
        let rows = self.adapter.read(bytes, &ReadOptions::default())?;
        let deleted: RoaringTreemap = match &add.deletion_vector {
            Some(descriptor) => descriptor.load(self.storage.as_ref()).await?,
            None => RoaringTreemap::new(),
        };
        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| (index as u64, row))
            .filter(|(index, _)| !deleted.contains(*index))
            .collect())
    }

    /// Best-effort removal of files written by an operation that failed to
    /// commit.
    pub(crate) async fn cleanup_files(&self, paths: &[String]) {
        for path in paths {
            if let Err(err) = self.storage.delete(path).await {
                tracing::warn!(%path, %err, "could not clean up orphaned file");
            }
        }
    }
}

/// Builder for the initial commit of a table: writes `commitInfo` +
/// `protocol` + `metaData` as version 0.
#[derive(Debug)]
pub struct CreateTableBuilder {
    table: Table,
    schema: StructType,
    partition_columns: Vec<String>,
    configuration: HashMap<String, String>,
    name: Option<String>,
    description: Option<String>,
    timestamp: Option<i64>,
}

impl CreateTableBuilder {
    fn new(table: Table, schema: StructType) -> Self {
        Self {
            table,
            schema,
            partition_columns: vec![],
            configuration: HashMap::new(),
            name: None,
            description: None,
            timestamp: None,
        }
    }

    pub fn with_partition_columns(mut self, columns: impl Into<Vec<String>>) -> Self {
        self.partition_columns = columns.into();
        self
    }

    pub fn with_configuration(mut self, configuration: HashMap<String, String>) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the creation commit timestamp (ms since epoch); defaults to now.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Write version 0. Fails with a concurrency error if the table already
    /// exists (the create-only conditional write loses).
    pub async fn execute(self) -> DeltaResult<Table> {
        let timestamp = self
            .timestamp
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let mut metadata = Metadata::try_new(
            &self.schema,
            self.partition_columns.clone(),
            self.configuration,
            timestamp,
        )?;
        metadata.name = self.name;
        metadata.description = self.description;

        let features = vec![
            DELETION_VECTORS_FEATURE.to_string(),
            CHANGE_DATA_FEED_FEATURE.to_string(),
        ];
        let protocol = Protocol::try_new(3, 7)?.with_features(features.clone(), features);

        let mut txn = Transaction::new(OP_CREATE, None, self.partition_columns);
        txn.add_action(Action::Protocol(protocol));
        txn.add_action(Action::Metadata(metadata));
        match txn.commit(self.table.storage.as_ref()).await {
            Ok(_) => Ok(self.table),
            Err(Error::Concurrency { .. } | Error::VersionMismatch { .. }) => Err(
                Error::validation(format!("table already exists at {}", self.table.location)),
            ),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, StructField};
    use crate::storage::memory_backend;

    pub(crate) fn test_table() -> Table {
        Table::new(Url::parse("memory:///table").unwrap(), memory_backend())
    }

    fn schema() -> StructType {
        StructType::new([
            StructField::new("id", DataType::Integer, false),
            StructField::new("name", DataType::String, true),
        ])
    }

    #[tokio::test]
    async fn create_writes_version_zero() {
        let table = test_table().create(schema()).execute().await.unwrap();
        let snapshot = table.snapshot().await.unwrap();
        assert_eq!(snapshot.version(), 0);
        assert_eq!(snapshot.num_files(), 0);
        assert!(snapshot.protocol().supports_deletion_vectors());
        assert_eq!(snapshot.schema(), &schema());
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let table = test_table().create(schema()).execute().await.unwrap();
        let again = table.clone().create(schema()).execute().await;
        assert!(matches!(again, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn create_validates_partition_columns() {
        let result = test_table()
            .create(schema())
            .with_partition_columns(vec!["nope".to_string()])
            .execute()
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
