//! [`StorageBackend`] implemented over any [`object_store::ObjectStore`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{
    DynObjectStore, ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion,
};

use crate::error::{DeltaResult, Error};
use crate::storage::{FileMeta, StorageBackend};

/// Tuning knobs shared by every scheme.
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Per-operation timeout; exceeding it yields a retryable storage error.
    pub timeout: Option<Duration>,
    /// Endpoint override for S3-compatible stores (R2, MinIO).
    pub endpoint: Option<String>,
}

/// The production backend: a table-rooted view over an object store.
#[derive(Debug)]
pub struct ObjectStoreBackend {
    store: Arc<DynObjectStore>,
    options: StorageOptions,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<DynObjectStore>) -> Self {
        Self {
            store,
            options: StorageOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StorageOptions) -> Self {
        self.options = options;
        self
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub fn local(root: &std::path::Path, options: StorageOptions) -> DeltaResult<Self> {
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| Error::storage(format!("cannot open {root:?}: {e}"), false))?;
        Ok(Self::new(Arc::new(store)).with_options(options))
    }

    #[cfg(feature = "cloud")]
    pub fn s3_compatible(url: &url::Url, options: StorageOptions) -> DeltaResult<Self> {
        use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
        use object_store::prefix::PrefixStore;

        let bucket = url
            .host_str()
            .ok_or_else(|| Error::S3(format!("{url} has no bucket")))?;
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_conditional_put(S3ConditionalPut::ETagMatch);
        let endpoint = options.endpoint.clone().or_else(|| {
            (url.scheme() == "r2")
                .then(|| std::env::var("R2_ENDPOINT").ok())
                .flatten()
        });
        if let Some(endpoint) = endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        let store = builder.build().map_err(|e| Error::S3(e.to_string()))?;
        let prefix = url.path().trim_matches('/');
        let store: Arc<DynObjectStore> = if prefix.is_empty() {
            Arc::new(store)
        } else {
            Arc::new(PrefixStore::new(store, ObjectPath::from(prefix)))
        };
        Ok(Self::new(store).with_options(options))
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = DeltaResult<T>>,
    ) -> DeltaResult<T> {
        match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::storage(
                    format!("{operation} timed out after {limit:?}"),
                    true,
                )),
            },
            None => fut.await,
        }
    }
}

fn to_file_meta(meta: ObjectMeta) -> FileMeta {
    FileMeta {
        path: meta.location.as_ref().to_string(),
        size: meta.size,
        last_modified: meta.last_modified.timestamp_millis(),
        etag: meta.e_tag,
    }
}

fn not_found(path: &str, err: object_store::Error) -> Error {
    match err {
        object_store::Error::NotFound { .. } => Error::file_not_found(path),
        other => Error::ObjectStore(other),
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn read(&self, path: &str) -> DeltaResult<Bytes> {
        let location = ObjectPath::from(path);
        self.bounded("read", async {
            let result = self
                .store
                .get(&location)
                .await
                .map_err(|e| not_found(path, e))?;
            Ok(result.bytes().await.map_err(|e| not_found(path, e))?)
        })
        .await
    }

    async fn read_range(&self, path: &str, start: u64, end: u64) -> DeltaResult<Bytes> {
        let location = ObjectPath::from(path);
        self.bounded("read_range", async {
            self.store
                .get_range(&location, start..end)
                .await
                .map_err(|e| not_found(path, e))
        })
        .await
    }

    async fn write(&self, path: &str, data: Bytes) -> DeltaResult<()> {
        let location = ObjectPath::from(path);
        self.bounded("write", async {
            self.store
                .put(&location, PutPayload::from(data))
                .await
                .map_err(Error::ObjectStore)?;
            Ok(())
        })
        .await
    }

    async fn write_conditional(
        &self,
        path: &str,
        data: Bytes,
        expected_version: Option<&str>,
    ) -> DeltaResult<String> {
        let location = ObjectPath::from(path);
        let mode = match expected_version {
            None => PutMode::Create,
            Some(version) => PutMode::Update(UpdateVersion {
                e_tag: Some(version.to_string()),
                version: None,
            }),
        };
        let expected = expected_version.map(str::to_string);
        self.bounded("write_conditional", async {
            let result = self
                .store
                .put_opts(&location, PutPayload::from(data), PutOptions::from(mode))
                .await;
            match result {
                Ok(done) => Ok(done
                    .e_tag
                    .or(done.version)
                    .unwrap_or_else(|| "0".to_string())),
                Err(
                    object_store::Error::AlreadyExists { .. }
                    | object_store::Error::Precondition { .. },
                ) => {
                    let actual = self.get_version(path).await.unwrap_or(None);
                    Err(Error::VersionMismatch {
                        path: path.to_string(),
                        expected,
                        actual,
                    })
                }
                Err(other) => Err(Error::ObjectStore(other)),
            }
        })
        .await
    }

    async fn delete(&self, path: &str) -> DeltaResult<()> {
        let location = ObjectPath::from(path);
        self.bounded("delete", async {
            match self.store.delete(&location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(other) => Err(Error::ObjectStore(other)),
            }
        })
        .await
    }

    async fn exists(&self, path: &str) -> DeltaResult<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    async fn stat(&self, path: &str) -> DeltaResult<Option<FileMeta>> {
        let location = ObjectPath::from(path);
        self.bounded("stat", async {
            match self.store.head(&location).await {
                Ok(meta) => Ok(Some(to_file_meta(meta))),
                Err(object_store::Error::NotFound { .. }) => Ok(None),
                Err(other) => Err(Error::ObjectStore(other)),
            }
        })
        .await
    }

    async fn list(&self, prefix: &str) -> DeltaResult<Vec<FileMeta>> {
        let prefix = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));
        self.bounded("list", async {
            let entries: Vec<ObjectMeta> = self
                .store
                .list(prefix.as_ref())
                .try_collect()
                .await
                .map_err(Error::ObjectStore)?;
            Ok(entries.into_iter().map(to_file_meta).collect())
        })
        .await
    }

    async fn get_version(&self, path: &str) -> DeltaResult<Option<String>> {
        Ok(self
            .stat(path)
            .await?
            .map(|meta| meta.etag.unwrap_or_else(|| meta.last_modified.to_string())))
    }
}
