//! A contiguous slice of the transaction log: at most one checkpoint plus
//! every delta file after it, up to a target version.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::actions::{decode_actions_lenient, Action};
use crate::error::{DeltaResult, Error};
use crate::path::{LogPathFileType, ParsedLogPath, LAST_CHECKPOINT_PATH, LOG_DIR};
use crate::storage::StorageBackend;
use crate::Version;

/// Contents of `_delta_log/_last_checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastCheckpoint {
    pub version: Version,
    pub size: u64,
}

/// The log files that must be replayed to reconstruct a snapshot.
#[derive(Debug, Clone)]
pub struct LogSegment {
    /// The newest readable checkpoint at or below the target version.
    pub checkpoint: Option<ParsedLogPath>,
    /// Delta files with versions in `(checkpoint, end]`, ascending.
    pub commit_files: Vec<ParsedLogPath>,
    pub end_version: Version,
}

impl LogSegment {
    /// Build a segment ending at `end` (or the latest version). The
    /// `_last_checkpoint` pointer is a hint only; listing is authoritative.
    pub async fn build(
        storage: &dyn StorageBackend,
        end: Option<Version>,
    ) -> DeltaResult<Self> {
        let mut entries: Vec<ParsedLogPath> = storage
            .list(LOG_DIR)
            .await?
            .into_iter()
            .filter_map(|meta| ParsedLogPath::try_parse(&meta.path))
            .filter(|parsed| end.map_or(true, |end| parsed.version <= end))
            .collect();
        entries.sort_by_key(|parsed| parsed.version);

        // only JSON checkpoints are readable by this engine; parquet-named
        // ones from other writers are ignored with a warning
        let checkpoint = entries
            .iter()
            .filter(|p| p.file_type == LogPathFileType::Checkpoint)
            .filter(|p| {
                let readable = p.path.ends_with(".checkpoint.json");
                if !readable {
                    warn!(path = %p.path, "ignoring checkpoint in a format this engine does not read");
                }
                readable
            })
            .max_by_key(|p| p.version)
            .cloned();
        let floor = checkpoint.as_ref().map(|c| c.version);

        let commit_files: Vec<ParsedLogPath> = entries
            .into_iter()
            .filter(|p| p.file_type == LogPathFileType::Commit)
            .filter(|p| floor.map_or(true, |floor| p.version > floor))
            .collect();

        let end_version = match (commit_files.last(), floor) {
            (Some(last), _) => last.version,
            (None, Some(floor)) => floor,
            (None, None) => return Err(Error::file_not_found(LOG_DIR)),
        };
        if let Some(end) = end {
            if end_version < end {
                return Err(Error::validation(format!(
                    "requested version {end} but the log ends at {end_version}"
                )));
            }
        }

        // gap check: versions after the checkpoint must be contiguous
        let mut expected = floor.map(|v| v + 1).unwrap_or(0);
        for file in &commit_files {
            if file.version != expected {
                return Err(Error::validation(format!(
                    "transaction log has a gap: expected version {expected}, found {}",
                    file.version
                )));
            }
            expected = file.version + 1;
        }

        Ok(Self {
            checkpoint,
            commit_files,
            end_version,
        })
    }

    /// Read the `_last_checkpoint` hint. Missing or corrupt pointers are
    /// tolerated; replay falls back to listing.
    pub async fn read_last_checkpoint(
        storage: &dyn StorageBackend,
    ) -> Option<LastCheckpoint> {
        match storage.read(LAST_CHECKPOINT_PATH).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(pointer) => Some(pointer),
                Err(err) => {
                    warn!(%err, "corrupt _last_checkpoint pointer, falling back to listing");
                    None
                }
            },
            Err(_) => None,
        }
    }

    /// The highest committed version of a table, if any commits exist.
    pub async fn latest_version(storage: &dyn StorageBackend) -> DeltaResult<Option<Version>> {
        Ok(storage
            .list(LOG_DIR)
            .await?
            .into_iter()
            .filter_map(|meta| ParsedLogPath::try_parse(&meta.path))
            .filter(|p| p.file_type == LogPathFileType::Commit)
            .map(|p| p.version)
            .max())
    }

    /// Read every action in the segment, in replay order: checkpoint first,
    /// then each delta file ascending. Within a file, actions keep file order.
    pub async fn read_actions(
        &self,
        storage: &dyn StorageBackend,
    ) -> DeltaResult<Vec<(Version, Vec<Action>)>> {
        let mut out = Vec::with_capacity(self.commit_files.len() + 1);
        if let Some(checkpoint) = &self.checkpoint {
            let body = storage.read(&checkpoint.path).await?;
            let text = std::str::from_utf8(&body)?;
            out.push((
                checkpoint.version,
                decode_actions_lenient(text, &checkpoint.path)?,
            ));
        }
        for file in &self.commit_files {
            let body = storage.read(&file.path).await?;
            let text = std::str::from_utf8(&body)?;
            out.push((file.version, decode_actions_lenient(text, &file.path)?));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_backend;
    use bytes::Bytes;

    const PROTOCOL: &str = r#"{"protocol":{"minReaderVersion":1,"minWriterVersion":2}}"#;

    async fn put_commit(storage: &dyn StorageBackend, version: Version, body: &str) {
        storage
            .write(
                &ParsedLogPath::commit(version).path,
                Bytes::from(body.to_string()),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn builds_contiguous_segment() {
        let storage = memory_backend();
        for v in 0..4 {
            put_commit(storage.as_ref(), v, PROTOCOL).await;
        }
        let segment = LogSegment::build(storage.as_ref(), None).await.unwrap();
        assert_eq!(segment.end_version, 3);
        assert_eq!(segment.commit_files.len(), 4);
        assert!(segment.checkpoint.is_none());

        let segment = LogSegment::build(storage.as_ref(), Some(1)).await.unwrap();
        assert_eq!(segment.end_version, 1);
        assert_eq!(segment.commit_files.len(), 2);
    }

    #[tokio::test]
    async fn checkpoint_bounds_the_segment() {
        let storage = memory_backend();
        for v in 0..5 {
            put_commit(storage.as_ref(), v, PROTOCOL).await;
        }
        storage
            .write(
                &ParsedLogPath::checkpoint(2).path,
                Bytes::from(PROTOCOL.to_string()),
            )
            .await
            .unwrap();

        let segment = LogSegment::build(storage.as_ref(), None).await.unwrap();
        assert_eq!(segment.checkpoint.as_ref().unwrap().version, 2);
        let versions: Vec<_> = segment.commit_files.iter().map(|f| f.version).collect();
        assert_eq!(versions, vec![3, 4]);

        // a time-travel target below the checkpoint ignores it
        let segment = LogSegment::build(storage.as_ref(), Some(1)).await.unwrap();
        assert!(segment.checkpoint.is_none());
        assert_eq!(segment.end_version, 1);
    }

    #[tokio::test]
    async fn detects_gaps_and_missing_versions() {
        let storage = memory_backend();
        put_commit(storage.as_ref(), 0, PROTOCOL).await;
        put_commit(storage.as_ref(), 2, PROTOCOL).await;
        assert!(LogSegment::build(storage.as_ref(), None).await.is_err());

        let storage = memory_backend();
        put_commit(storage.as_ref(), 0, PROTOCOL).await;
        assert!(LogSegment::build(storage.as_ref(), Some(5)).await.is_err());

        let storage = memory_backend();
        assert!(matches!(
            LogSegment::build(storage.as_ref(), None).await,
            Err(Error::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn last_checkpoint_pointer_is_advisory() {
        let storage = memory_backend();
        assert!(LogSegment::read_last_checkpoint(storage.as_ref()).await.is_none());
        storage
            .write(LAST_CHECKPOINT_PATH, Bytes::from_static(b"not json"))
            .await
            .unwrap();
        assert!(LogSegment::read_last_checkpoint(storage.as_ref()).await.is_none());
        storage
            .write(
                LAST_CHECKPOINT_PATH,
                Bytes::from_static(br#"{"version":7,"size":42}"#),
            )
            .await
            .unwrap();
        let pointer = LogSegment::read_last_checkpoint(storage.as_ref()).await.unwrap();
        assert_eq!(pointer, LastCheckpoint { version: 7, size: 42 });
    }
}
