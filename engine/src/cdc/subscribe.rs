//! Change-data subscriptions: a cooperative polling loop that delivers new
//! records, in order, to a handler.

use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::cdc::{ChangeDataFilter, ChangeRecord};
use crate::error::{DeltaResult, Error};
use crate::log_segment::LogSegment;
use crate::retry::{with_retry, RetryPolicy};
use crate::table::Table;
use crate::Version;

/// Per-record callback. Errors are forwarded to the subscription's error
/// callback; they do not stop delivery.
pub type ChangeHandler =
    Box<dyn FnMut(ChangeRecord) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;

/// Callback invoked with handler and polling errors.
pub type ErrorCallback = Box<dyn Fn(&Error) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub poll_interval: Duration,
    /// Deliver changes after this version; defaults to the head at
    /// subscription time (only new commits are delivered).
    pub from_version: Option<Version>,
    pub filter: ChangeDataFilter,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            from_version: None,
            filter: ChangeDataFilter::default(),
        }
    }
}

/// Handle to a running subscription. Dropping it does not stop the loop;
/// call [`unsubscribe`](Subscription::unsubscribe).
#[derive(Debug)]
pub struct Subscription {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Subscription {
    /// Signal the loop to stop at its next yield point. An in-flight handler
    /// invocation completes first.
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to observe cancellation and exit.
    pub async fn join(self) {
        self.unsubscribe();
        let _ = self.task.await;
    }
}

impl Table {
    /// Start polling for new commits after `options.from_version` (or the
    /// current head) and deliver each change record to `handler`
    /// sequentially. Transient storage errors are retried with backoff;
    /// handler errors go to `on_error` and do not affect other subscribers.
    pub async fn subscribe(
        &self,
        mut handler: ChangeHandler,
        options: SubscribeOptions,
        on_error: Option<ErrorCallback>,
    ) -> DeltaResult<Subscription> {
        let table = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let start_after = match options.from_version {
            Some(version) => version,
            None => LogSegment::latest_version(self.storage().as_ref())
                .await?
                .unwrap_or(0),
        };

        let task = tokio::spawn(async move {
            let policy = RetryPolicy::default();
            let mut last_delivered = start_after;
            debug!(after = last_delivered, "change data subscription started");
            loop {
                if token.is_cancelled() {
                    break;
                }
                tokio::time::sleep(options.poll_interval).await;
                if token.is_cancelled() {
                    break;
                }

                let head = with_retry(&policy, "subscribe-poll", || async {
                    LogSegment::latest_version(table.storage().as_ref()).await
                })
                .await;
                let head = match head {
                    Ok(Some(head)) if head > last_delivered => head,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(%err, "subscription poll failed");
                        if let Some(on_error) = &on_error {
                            on_error(&err);
                        }
                        continue;
                    }
                };

                let records = with_retry(&policy, "subscribe-read", || async {
                    table.changes_between(last_delivered + 1, head).await
                })
                .await;
                match records {
                    Ok(records) => {
                        for record in records {
                            if token.is_cancelled() {
                                return;
                            }
                            if !options.filter.applies(&record) {
                                continue;
                            }
                            if let Err(err) = handler(record) {
                                let err = Error::generic(format!("handler error: {err}"));
                                if let Some(on_error) = &on_error {
                                    on_error(&err);
                                }
                            }
                        }
                        last_delivered = head;
                    }
                    Err(err) => {
                        warn!(%err, "subscription read failed");
                        if let Some(on_error) = &on_error {
                            on_error(&err);
                        }
                    }
                }
            }
            debug!("change data subscription stopped");
        });

        Ok(Subscription { cancel, task })
    }
}
