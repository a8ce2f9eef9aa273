//! The storage backend contract and the URL-scheme factory.
//!
//! Everything the engine persists goes through [`StorageBackend`]. Paths are
//! relative to the table root; the backing store is an [`object_store`]
//! implementation selected by the table URL's scheme.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::{DeltaResult, Error};

mod object;
pub use object::{ObjectStoreBackend, StorageOptions};

/// Metadata for a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub path: String,
    pub size: u64,
    /// Milliseconds since the unix epoch
    pub last_modified: i64,
    pub etag: Option<String>,
}

/// Byte-level storage with a conditional-write primitive. All paths are
/// relative to the table root. Implementations must be safe to share across
/// tasks.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    async fn read(&self, path: &str) -> DeltaResult<Bytes>;

    /// Read `[start, end)` of the object.
    async fn read_range(&self, path: &str, start: u64, end: u64) -> DeltaResult<Bytes>;

    async fn write(&self, path: &str, data: Bytes) -> DeltaResult<()>;

    /// Write `data` only if the object's current version matches
    /// `expected_version`; `None` means create-only. Returns the new version.
    /// A lost race surfaces as [`Error::VersionMismatch`].
    async fn write_conditional(
        &self,
        path: &str,
        data: Bytes,
        expected_version: Option<&str>,
    ) -> DeltaResult<String>;

    /// Idempotent delete: removing a missing object succeeds.
    async fn delete(&self, path: &str) -> DeltaResult<()>;

    async fn exists(&self, path: &str) -> DeltaResult<bool>;

    async fn stat(&self, path: &str) -> DeltaResult<Option<FileMeta>>;

    /// All objects under `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> DeltaResult<Vec<FileMeta>>;

    /// Current version string of the object, or `None` if it does not exist.
    async fn get_version(&self, path: &str) -> DeltaResult<Option<String>>;
}

/// A fresh in-memory backend (`memory://` tables, tests).
pub fn memory_backend() -> Arc<dyn StorageBackend> {
    Arc::new(ObjectStoreBackend::in_memory())
}

/// Normalize a table URI: bare and relative filesystem paths become `file://`
/// URLs, everything else must already be a URL.
pub fn parse_table_uri(uri: &str) -> DeltaResult<Url> {
    if uri.starts_with('/') || uri.starts_with("./") || uri.starts_with("../") {
        let absolute = std::path::Path::new(uri)
            .canonicalize()
            .unwrap_or_else(|_| std::path::PathBuf::from(uri));
        return Url::from_directory_path(&absolute)
            .map_err(|_| Error::validation(format!("invalid filesystem path {uri:?}")));
    }
    Ok(Url::parse(uri)?)
}

/// Build the storage backend for a table root URL.
///
/// Recognized schemes: `file://` (and bare paths via [`parse_table_uri`]),
/// `memory://`, and with the `cloud` feature `s3://bucket[/prefix]` and
/// `r2://bucket[/prefix]`.
pub fn storage_for_url(url: &Url, options: &StorageOptions) -> DeltaResult<Arc<dyn StorageBackend>> {
    match url.scheme() {
        "memory" => Ok(Arc::new(ObjectStoreBackend::in_memory().with_options(options.clone()))),
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| Error::validation(format!("invalid file url {url}")))?;
            std::fs::create_dir_all(&path)
                .map_err(|e| Error::storage(format!("cannot create table root: {e}"), false))?;
            Ok(Arc::new(ObjectStoreBackend::local(&path, options.clone())?))
        }
        #[cfg(feature = "cloud")]
        "s3" | "r2" => Ok(Arc::new(ObjectStoreBackend::s3_compatible(url, options.clone())?)),
        #[cfg(not(feature = "cloud"))]
        "s3" | "r2" => Err(Error::S3(format!(
            "{url} requires the `cloud` feature of delta-engine"
        ))),
        other => Err(Error::UnsupportedScheme(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_contract() {
        let storage = memory_backend();
        assert!(!storage.exists("a.txt").await.unwrap());
        storage.write("a.txt", Bytes::from_static(b"hello")).await.unwrap();
        assert!(storage.exists("a.txt").await.unwrap());
        assert_eq!(storage.read("a.txt").await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(
            storage.read_range("a.txt", 1, 3).await.unwrap(),
            Bytes::from_static(b"el")
        );

        let meta = storage.stat("a.txt").await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        assert!(storage.stat("missing").await.unwrap().is_none());

        storage.delete("a.txt").await.unwrap();
        // idempotent
        storage.delete("a.txt").await.unwrap();
        assert!(!storage.exists("a.txt").await.unwrap());

        assert!(matches!(
            storage.read("missing").await,
            Err(Error::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn conditional_create_detects_races() {
        let storage = memory_backend();
        let version = storage
            .write_conditional("log/0.json", Bytes::from_static(b"{}"), None)
            .await
            .unwrap();
        assert!(!version.is_empty());

        let err = storage
            .write_conditional("log/0.json", Bytes::from_static(b"{}"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn list_is_prefix_scoped() {
        let storage = memory_backend();
        storage.write("_delta_log/00.json", Bytes::new()).await.unwrap();
        storage.write("_delta_log/01.json", Bytes::new()).await.unwrap();
        storage.write("part-0.parquet", Bytes::new()).await.unwrap();

        let log = storage.list("_delta_log").await.unwrap();
        assert_eq!(log.len(), 2);
        let all = storage.list("").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn uri_parsing() {
        assert_eq!(parse_table_uri("memory://t").unwrap().scheme(), "memory");
        assert_eq!(parse_table_uri("/tmp/table").unwrap().scheme(), "file");
        assert_eq!(parse_table_uri("s3://bucket/t").unwrap().scheme(), "s3");
        assert!(parse_table_uri("not a url").is_err());
    }
}
