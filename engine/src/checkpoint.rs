//! Checkpoint writing: periodic consolidation of a snapshot into a single
//! log file so replay does not have to walk every delta file.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::actions::{encode_actions, Action};
use crate::error::DeltaResult;
use crate::log_segment::{LastCheckpoint, LogSegment};
use crate::path::{LogPathFileType, ParsedLogPath, LAST_CHECKPOINT_PATH, LOG_DIR};
use crate::snapshot::Snapshot;
use crate::storage::StorageBackend;
use crate::table_properties::TableProperties;
use crate::Version;

/// Whether the checkpoint policy calls for a checkpoint at this snapshot:
/// either `checkpoint_interval` versions elapsed since the last one, or the
/// replayed action count since it exceeds `checkpoint_max_actions`.
pub fn should_checkpoint(snapshot: &Snapshot, properties: &TableProperties) -> bool {
    let last = snapshot.checkpoint_version().unwrap_or(0);
    let elapsed = snapshot.version().saturating_sub(last);
    elapsed >= properties.checkpoint_interval
        || snapshot.actions_since_checkpoint() > properties.checkpoint_max_actions
}

/// Write a checkpoint if policy calls for one; returns the checkpointed
/// version. Checkpoint failures are logged but never fail the commit that
/// triggered them.
pub async fn maybe_checkpoint(
    storage: &dyn StorageBackend,
    snapshot: &Snapshot,
) -> Option<Version> {
    if !should_checkpoint(snapshot, snapshot.properties()) {
        return None;
    }
    match write_checkpoint(storage, snapshot).await {
        Ok(()) => Some(snapshot.version()),
        Err(err) => {
            warn!(version = snapshot.version(), %err, "checkpoint write failed");
            None
        }
    }
}

/// Materialize `snapshot` as a checkpoint file and atomically update the
/// `_last_checkpoint` pointer, then prune old checkpoints past retention.
pub async fn write_checkpoint(
    storage: &dyn StorageBackend,
    snapshot: &Snapshot,
) -> DeltaResult<()> {
    let actions: Vec<Action> = std::iter::once(Action::Protocol(snapshot.protocol().clone()))
        .chain(std::iter::once(Action::Metadata(snapshot.metadata().clone())))
        .chain(snapshot.files().cloned().map(Action::Add))
        .collect();
    let body = encode_actions(actions.iter())?;
    let path = ParsedLogPath::checkpoint(snapshot.version());
    let size = body.len() as u64;
    storage.write(&path.path, Bytes::from(body)).await?;

    let pointer = LastCheckpoint {
        version: snapshot.version(),
        size,
    };
    storage
        .write(
            LAST_CHECKPOINT_PATH,
            Bytes::from(serde_json::to_vec(&pointer)?),
        )
        .await?;
    debug!(version = snapshot.version(), actions = actions.len(), "wrote checkpoint");

    prune_old_checkpoints(storage, snapshot).await;
    Ok(())
}

/// Delete checkpoints beyond `checkpoint_num_retained` that are also older
/// than `checkpoint_retention_ms`. Best effort: pruning failures only warn.
async fn prune_old_checkpoints(storage: &dyn StorageBackend, snapshot: &Snapshot) {
    let properties = snapshot.properties();
    let listing = match storage.list(LOG_DIR).await {
        Ok(listing) => listing,
        Err(err) => {
            warn!(%err, "could not list log for checkpoint pruning");
            return;
        }
    };
    let now = chrono::Utc::now().timestamp_millis();
    let mut checkpoints: Vec<_> = listing
        .into_iter()
        .filter(|meta| {
            ParsedLogPath::try_parse(&meta.path)
                .is_some_and(|p| p.file_type == LogPathFileType::Checkpoint)
        })
        .collect();
    checkpoints.sort_by_key(|meta| std::cmp::Reverse(meta.path.clone()));

    for stale in checkpoints.iter().skip(properties.checkpoint_num_retained.max(1)) {
        let age = now.saturating_sub(stale.last_modified);
        if age < properties.checkpoint_retention_ms {
            continue;
        }
        if let Err(err) = storage.delete(&stale.path).await {
            warn!(path = %stale.path, %err, "could not prune old checkpoint");
        }
    }
}

/// Read the `_last_checkpoint` pointer (advisory; replay lists the log).
pub async fn last_checkpoint(storage: &dyn StorageBackend) -> Option<LastCheckpoint> {
    LogSegment::read_last_checkpoint(storage).await
}
