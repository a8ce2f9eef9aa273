//! Vacuum: physically delete tombstoned files once they age past retention.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::actions::Action;
use crate::cancel::CancellationToken;
use crate::error::DeltaResult;
use crate::path::{decode_path, LOG_DIR};
use crate::table::Table;

#[derive(Debug, Clone)]
pub struct VacuumOptions {
    /// Minimum tombstone age; defaults to the table's retention property
    /// (7 days unless configured).
    pub retention_ms: Option<i64>,
    /// Report without deleting.
    pub dry_run: bool,
    pub cancel: CancellationToken,
}

impl Default for VacuumOptions {
    fn default() -> Self {
        Self {
            retention_ms: None,
            dry_run: false,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VacuumMetrics {
    pub files_deleted: Vec<String>,
    pub bytes_deleted: u64,
    pub files_retained: usize,
    pub dry_run: bool,
}

impl Table {
    /// Delete unreferenced data, deletion-vector, and change-data files that
    /// are older than retention. A file referenced by any commit whose age is
    /// within retention is never removed, nor is anything in the current
    /// snapshot.
    #[instrument(skip_all)]
    pub async fn vacuum(&self, options: VacuumOptions) -> DeltaResult<VacuumMetrics> {
        let snapshot = self.snapshot().await?;
        let retention_ms = options
            .retention_ms
            .unwrap_or(snapshot.properties().deleted_file_retention_ms)
            .max(0);
        let now = Utc::now().timestamp_millis();
        let horizon = now - retention_ms;

        // everything the current snapshot can reach is live
        let mut referenced: HashSet<String> = HashSet::new();
        for add in snapshot.files() {
            referenced.insert(decode_path(&add.path));
            if let Some(dv) = &add.deletion_vector {
                if let Some(path) = dv.sidecar_path()? {
                    referenced.insert(path);
                }
            }
        }

        // so is everything referenced by a commit younger than retention:
        // time travel into the retained window must keep working. Every
        // commit in the log is scanned, including those behind a checkpoint.
        let commits: Vec<_> = self
            .storage()
            .list(LOG_DIR)
            .await?
            .into_iter()
            .filter(|meta| {
                crate::path::ParsedLogPath::try_parse(&meta.path)
                    .is_some_and(|p| p.file_type == crate::path::LogPathFileType::Commit)
            })
            .collect();
        for file in &commits {
            options.cancel.check()?;
            let commit_is_retained = file.last_modified >= horizon;
            let body = self.storage().read(&file.path).await?;
            let text = std::str::from_utf8(&body)?;
            for action in crate::actions::decode_actions_lenient(text, &file.path)? {
                let paths: Vec<String> = match &action {
                    Action::Add(add) if commit_is_retained => {
                        let mut paths = vec![decode_path(&add.path)];
                        if let Some(dv) = &add.deletion_vector {
                            paths.extend(dv.sidecar_path()?);
                        }
                        paths
                    }
                    Action::Cdc(cdc) if commit_is_retained => vec![decode_path(&cdc.path)],
                    _ => continue,
                };
                referenced.extend(paths);
            }
        }

        let mut metrics = VacuumMetrics {
            files_deleted: Vec::new(),
            bytes_deleted: 0,
            files_retained: 0,
            dry_run: options.dry_run,
        };
        for meta in self.storage().list("").await? {
            options.cancel.check()?;
            if meta.path.starts_with(LOG_DIR) {
                continue;
            }
            if referenced.contains(&meta.path) || meta.last_modified >= horizon {
                metrics.files_retained += 1;
                continue;
            }
            metrics.bytes_deleted += meta.size;
            metrics.files_deleted.push(meta.path.clone());
            if !options.dry_run {
                self.storage().delete(&meta.path).await?;
            }
        }
        metrics.files_deleted.sort_unstable();
        debug!(
            deleted = metrics.files_deleted.len(),
            retained = metrics.files_retained,
            dry_run = metrics.dry_run,
            "vacuum finished"
        );
        Ok(metrics)
    }
}
