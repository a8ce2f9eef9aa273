//! The optimistic commit protocol: conditional create-only appends to the
//! log, conflict classification against winning commits, and bounded rebase
//! retry with full-jitter backoff.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use crate::actions::{decode_actions_lenient, encode_actions, Action, CommitInfo};
use crate::cancel::CancellationToken;
use crate::error::{DeltaResult, Error};
use crate::log_segment::LogSegment;
use crate::path::ParsedLogPath;
use crate::retry::RetryPolicy;
use crate::storage::StorageBackend;
use crate::Version;

pub const OP_CREATE: &str = "CREATE TABLE";
pub const OP_WRITE: &str = "WRITE";
pub const OP_UPDATE: &str = "UPDATE";
pub const OP_DELETE: &str = "DELETE";
pub const OP_MERGE: &str = "MERGE";
pub const OP_OPTIMIZE: &str = "OPTIMIZE";
pub const OP_DEDUPLICATE: &str = "DEDUPLICATE";
pub const OP_CLUSTER: &str = "CLUSTER BY";
pub const OP_VACUUM: &str = "VACUUM";

/// A pending commit. Build it from the snapshot the operation read, attach
/// actions, then [`commit`](Transaction::commit).
#[derive(Debug)]
pub struct Transaction {
    operation: String,
    read_version: Option<Version>,
    partition_columns: Vec<String>,
    parameters: HashMap<String, JsonValue>,
    actions: Vec<Action>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Transaction {
    pub fn new(
        operation: impl Into<String>,
        read_version: Option<Version>,
        partition_columns: Vec<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            read_version,
            partition_columns,
            parameters: HashMap::new(),
            actions: Vec::new(),
            policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn add_action(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn extend(&mut self, actions: impl IntoIterator<Item = Action>) {
        self.actions.extend(actions);
    }

    fn validate(&self) -> DeltaResult<()> {
        if self.actions.is_empty() {
            return Err(Error::validation("cannot commit an empty transaction"));
        }
        let mut add_paths = HashSet::new();
        for action in &self.actions {
            action.validate()?;
            if let Action::Add(add) = action {
                if !add_paths.insert(add.path.as_str()) {
                    return Err(Error::validation(format!(
                        "path {:?} appears in two add actions of one commit",
                        add.path
                    )));
                }
                let keys: HashSet<&str> =
                    add.partition_values.keys().map(String::as_str).collect();
                let expected: HashSet<&str> =
                    self.partition_columns.iter().map(String::as_str).collect();
                if keys != expected {
                    return Err(Error::validation(format!(
                        "add {:?} partition values {:?} do not match partition columns {:?}",
                        add.path, keys, self.partition_columns
                    )));
                }
            }
        }
        Ok(())
    }

    /// Append this transaction to the log. On a lost race the commit is
    /// classified against every winning commit; resolvable conflicts rebase
    /// onto the new head and retry with backoff, the rest surface as
    /// [`Error::Concurrency`].
    #[instrument(skip_all, fields(operation = %self.operation))]
    pub async fn commit(self, storage: &dyn StorageBackend) -> DeltaResult<Version> {
        self.validate()?;
        let is_blind_append = !self
            .actions
            .iter()
            .any(|a| matches!(a, Action::Remove(_)));
        let mut commit_info = CommitInfo::new(Utc::now().timestamp_millis(), &self.operation);
        commit_info.operation_parameters = self.parameters.clone();
        commit_info.is_blind_append = is_blind_append;
        commit_info.read_version = self.read_version.map(|v| v as i64);

        let body = {
            let all = std::iter::once(Action::CommitInfo(commit_info))
                .chain(self.actions.iter().cloned())
                .collect::<Vec<_>>();
            encode_actions(all.iter())?
        };

        let mut target = self.read_version.map(|v| v + 1).unwrap_or(0);
        let mut attempt: u32 = 0;
        loop {
            self.cancel.check()?;
            let path = ParsedLogPath::commit(target).path;
            match storage
                .write_conditional(&path, body.clone().into(), None)
                .await
            {
                Ok(_) => {
                    debug!(version = target, "commit succeeded");
                    return Ok(target);
                }
                Err(Error::VersionMismatch { .. }) => {
                    let latest = LogSegment::latest_version(storage)
                        .await?
                        .unwrap_or(target);
                    self.classify_conflicts(storage, target, latest).await?;
                    if attempt >= self.policy.max_retries {
                        return Err(Error::Concurrency {
                            expected: target,
                            actual: latest,
                        });
                    }
                    let delay = self.policy.backoff(attempt);
                    debug!(lost = target, head = latest, ?delay, "commit conflict, rebasing");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    target = latest + 1;
                }
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt);
                    debug!(%err, ?delay, "transient commit failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Decide whether losing versions `[lost, head]` is survivable. A blind
    /// append over other blind appends always is; overlapping remove sets or
    /// any metadata/protocol change on either side is not.
    async fn classify_conflicts(
        &self,
        storage: &dyn StorageBackend,
        lost: Version,
        head: Version,
    ) -> DeltaResult<()> {
        let fail = |actual| {
            Err(Error::Concurrency {
                expected: lost,
                actual,
            })
        };
        let pending_changes_metadata = self
            .actions
            .iter()
            .any(|a| matches!(a, Action::Metadata(_) | Action::Protocol(_)));
        let pending_removes: HashSet<&str> = self
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::Remove(r) => Some(r.path.as_str()),
                _ => None,
            })
            .collect();
        let pending_adds: HashSet<&str> = self
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::Add(a) => Some(a.path.as_str()),
                _ => None,
            })
            .collect();

        for version in lost..=head {
            let path = ParsedLogPath::commit(version).path;
            let bytes = storage.read(&path).await?;
            let text = std::str::from_utf8(&bytes)?;
            for action in decode_actions_lenient(text, &path)? {
                match action {
                    Action::Metadata(_) | Action::Protocol(_) => {
                        // any metadata/protocol movement invalidates the read
                        // snapshot, ours or theirs
                        return fail(version);
                    }
                    _ if pending_changes_metadata => return fail(version),
                    Action::Remove(remove)
                        if pending_removes.contains(remove.path.as_str()) =>
                    {
                        return fail(version);
                    }
                    Action::Remove(remove) if pending_adds.contains(remove.path.as_str()) => {
                        return fail(version);
                    }
                    Action::Add(add) if pending_adds.contains(add.path.as_str()) => {
                        return fail(version);
                    }
                    // a winner removing a file we read but do not touch is
                    // survivable for appends; read-then-replace operations
                    // express their inputs as removes and are caught above
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Add, Metadata, Protocol, Remove};
    use crate::schema::{DataType, StructField, StructType};
    use crate::storage::memory_backend;
    use std::sync::Arc;

    fn add(path: &str) -> Action {
        Action::Add(Add {
            path: path.to_string(),
            partition_values: HashMap::new(),
            size: 1,
            modification_time: 0,
            data_change: true,
            stats: None,
            tags: None,
            deletion_vector: None,
        })
    }

    fn remove(path: &str) -> Action {
        Action::Remove(Remove {
            path: path.to_string(),
            deletion_timestamp: 1,
            data_change: true,
            partition_values: None,
            size: None,
            deletion_vector: None,
        })
    }

    async fn create_table(storage: &Arc<dyn crate::storage::StorageBackend>) -> Version {
        let schema = StructType::new([StructField::new("id", DataType::Integer, true)]);
        let metadata =
            Metadata::try_new(&schema, vec![], HashMap::new(), 0).unwrap();
        let mut txn = Transaction::new(OP_CREATE, None, vec![]);
        txn.add_action(Action::Protocol(Protocol::try_new(1, 2).unwrap()));
        txn.add_action(Action::Metadata(metadata));
        txn.commit(storage.as_ref()).await.unwrap()
    }

    #[tokio::test]
    async fn versions_are_serialized_without_gaps() {
        let storage = memory_backend();
        assert_eq!(create_table(&storage).await, 0);

        let mut txn = Transaction::new(OP_WRITE, Some(0), vec![]);
        txn.add_action(add("a.parquet"));
        assert_eq!(txn.commit(storage.as_ref()).await.unwrap(), 1);

        let mut txn = Transaction::new(OP_WRITE, Some(1), vec![]);
        txn.add_action(add("b.parquet"));
        assert_eq!(txn.commit(storage.as_ref()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn blind_append_rebases_over_blind_append() {
        let storage = memory_backend();
        create_table(&storage).await;

        // both writers read version 0; writer one lands version 1 first
        let mut one = Transaction::new(OP_WRITE, Some(0), vec![]);
        one.add_action(add("one.parquet"));
        let mut two = Transaction::new(OP_WRITE, Some(0), vec![]);
        two.add_action(add("two.parquet"));

        assert_eq!(one.commit(storage.as_ref()).await.unwrap(), 1);
        assert_eq!(two.commit(storage.as_ref()).await.unwrap(), 2);

        let snapshot = crate::snapshot::Snapshot::try_new(storage.as_ref(), None)
            .await
            .unwrap();
        let mut paths: Vec<_> = snapshot.files().map(|f| f.path.as_str()).collect();
        paths.sort_unstable();
        assert_eq!(paths, vec!["one.parquet", "two.parquet"]);
    }

    #[tokio::test]
    async fn overlapping_removes_fail() {
        let storage = memory_backend();
        create_table(&storage).await;
        let mut seed = Transaction::new(OP_WRITE, Some(0), vec![]);
        seed.add_action(add("shared.parquet"));
        seed.commit(storage.as_ref()).await.unwrap();

        let mut winner = Transaction::new(OP_DELETE, Some(1), vec![]);
        winner.add_action(remove("shared.parquet"));
        winner.commit(storage.as_ref()).await.unwrap();

        let mut loser = Transaction::new(OP_DELETE, Some(1), vec![]);
        loser.add_action(remove("shared.parquet"));
        let err = loser.commit(storage.as_ref()).await.unwrap_err();
        assert!(matches!(err, Error::Concurrency { .. }));
    }

    #[tokio::test]
    async fn metadata_conflicts_fail() {
        let storage = memory_backend();
        create_table(&storage).await;

        let schema = StructType::new([StructField::new("id", DataType::Long, true)]);
        let metadata = Metadata::try_new(&schema, vec![], HashMap::new(), 1).unwrap();
        let mut winner = Transaction::new("SET TBLPROPERTIES", Some(0), vec![]);
        winner.add_action(Action::Metadata(metadata));
        winner.commit(storage.as_ref()).await.unwrap();

        let mut loser = Transaction::new(OP_WRITE, Some(0), vec![]);
        loser.add_action(add("late.parquet"));
        assert!(matches!(
            loser.commit(storage.as_ref()).await,
            Err(Error::Concurrency { .. })
        ));
    }

    #[tokio::test]
    async fn validates_partition_values_and_duplicate_paths() {
        let mut txn = Transaction::new(OP_WRITE, Some(0), vec!["region".to_string()]);
        txn.add_action(add("a.parquet"));
        let storage = memory_backend();
        // add has no partition values for the partitioned table
        assert!(matches!(
            txn.commit(storage.as_ref()).await,
            Err(Error::Validation(_))
        ));

        let mut txn = Transaction::new(OP_WRITE, Some(0), vec![]);
        txn.add_action(add("dup.parquet"));
        txn.add_action(add("dup.parquet"));
        assert!(matches!(
            txn.commit(storage.as_ref()).await,
            Err(Error::Validation(_))
        ));

        let txn = Transaction::new(OP_WRITE, Some(0), vec![]);
        assert!(matches!(
            txn.commit(storage.as_ref()).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_the_commit() {
        let storage = memory_backend();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut txn = Transaction::new(OP_WRITE, Some(0), vec![]).with_cancellation(cancel);
        txn.add_action(add("a.parquet"));
        assert!(matches!(
            txn.commit(storage.as_ref()).await,
            Err(Error::Cancelled)
        ));
    }
}
