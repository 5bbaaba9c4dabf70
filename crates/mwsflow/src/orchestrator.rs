//! The poll loop body and the enqueue entry points.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::callbacks::{CallbackRegistry, Delivery};
use crate::config::OrchestratorOptions;
use crate::error::EnqueueError;
use crate::jobs::feed_processor::FeedProcessor;
use crate::jobs::lifecycle::Stage;
use crate::jobs::model::{EntryState, JobEntry, JobKind, NewJobEntry, RetryStage};
use crate::jobs::params::{FeedSubmissionParams, ReportRequestParams};
use crate::jobs::processor::JobProcessor;
use crate::jobs::report_processor::ReportProcessor;
use crate::jobs::stage::{self, DownloadOutcome, SubmitOutcome};
use crate::jobs::store::{ChangeSet, EntryStore, StoreError};
use crate::remote::RemoteJobService;

/// What one `poll()` did for a single job kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindReport {
    pub purged: usize,
    pub submitted: usize,
    pub submit_failures: usize,
    pub statuses_checked: usize,
    pub became_ready: usize,
    pub cancelled: usize,
    pub status_failures: usize,
    pub downloaded: usize,
    pub download_failures: usize,
    pub verify_failures: usize,
    pub delivered: usize,
    pub delivery_failures: usize,
    /// Writes rejected because the entry changed underneath the stage.
    pub lost_writes: usize,
    /// Stages that failed on the store side and were skipped, plus passes
    /// that panicked.
    pub stage_errors: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub reports: KindReport,
    pub feeds: KindReport,
}

pub struct Orchestrator {
    store: Arc<dyn EntryStore>,
    callbacks: CallbackRegistry,
    options: OrchestratorOptions,
    reports: ReportProcessor,
    feeds: FeedProcessor,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EntryStore>,
        remote: Arc<dyn RemoteJobService>,
        callbacks: CallbackRegistry,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            reports: ReportProcessor::new(store.clone(), remote.clone(), options.clone()),
            feeds: FeedProcessor::new(store.clone(), remote, options.clone()),
            callbacks: callbacks.with_default_timeout(options.callback_timeout),
            store,
            options,
        }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    pub async fn queue_report<A>(
        &self,
        params: ReportRequestParams,
        handler: &str,
        argument: &A,
    ) -> Result<Uuid, EnqueueError>
    where
        A: Serialize + 'static,
    {
        params.validate()?;
        let payload = serde_json::to_value(&params).map_err(EnqueueError::Payload)?;
        self.enqueue(JobKind::Report, payload, handler, argument).await
    }

    pub async fn queue_feed<A>(
        &self,
        params: FeedSubmissionParams,
        handler: &str,
        argument: &A,
    ) -> Result<Uuid, EnqueueError>
    where
        A: Serialize + 'static,
    {
        params.validate()?;
        let payload = serde_json::to_value(&params).map_err(EnqueueError::Payload)?;
        self.enqueue(JobKind::Feed, payload, handler, argument).await
    }

    async fn enqueue<A>(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        handler: &str,
        argument: &A,
    ) -> Result<Uuid, EnqueueError>
    where
        A: Serialize + 'static,
    {
        let callback = self.callbacks.describe(handler, argument)?;
        let entry = self
            .store
            .create(NewJobEntry {
                kind,
                owner: self.options.owner.clone(),
                payload,
                callback,
            })
            .await?;

        info!(
            entry_id = %entry.id,
            entry = %entry.label(),
            handler,
            "queued"
        );
        Ok(entry.id)
    }

    /// One pass over both job kinds, reports first. Never fails: store errors
    /// are logged and the remaining stages still run, and a panicking pass is
    /// recorded without stopping the other kind.
    pub async fn poll(&self) -> PollReport {
        PollReport {
            reports: self.poll_kind_guarded(&self.reports).await,
            feeds: self.poll_kind_guarded(&self.feeds).await,
        }
    }

    async fn poll_kind_guarded(&self, processor: &dyn JobProcessor) -> KindReport {
        match AssertUnwindSafe(self.poll_kind(processor))
            .catch_unwind()
            .await
        {
            Ok(report) => report,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(
                    kind = processor.kind().as_str(),
                    panic = %message,
                    "poll pass panicked"
                );
                KindReport {
                    stage_errors: 1,
                    ..KindReport::default()
                }
            }
        }
    }

    async fn poll_kind(&self, processor: &dyn JobProcessor) -> KindReport {
        let kind = processor.kind();
        let span = info_span!(
            "poll",
            kind = kind.as_str(),
            region = self.options.owner.region.as_str(),
            instance = %self.options.instance_id
        );

        async move {
            let mut out = KindReport::default();

            match processor.cleanup_expired().await {
                Ok(n) => out.purged = n,
                Err(e) => stage_failed("cleanup", &e, &mut out),
            }

            match processor.request_next().await {
                Ok(Some(SubmitOutcome::Submitted { .. })) => out.submitted += 1,
                Ok(Some(SubmitOutcome::Failed { .. })) => out.submit_failures += 1,
                Ok(Some(SubmitOutcome::Lost { .. })) => out.lost_writes += 1,
                Ok(None) => {}
                Err(e) => stage_failed("request", &e, &mut out),
            }

            match processor.poll_statuses().await {
                Ok(summary) => {
                    out.statuses_checked = summary.checked;
                    out.became_ready = summary.ready;
                    out.cancelled = summary.cancelled;
                    out.status_failures = summary.failed;
                    if summary.rejected {
                        out.lost_writes += 1;
                    }
                }
                Err(e) => stage_failed("status", &e, &mut out),
            }

            let downloaded = match processor.download_next().await {
                Ok(DownloadOutcome::Ready(entry)) => {
                    out.downloaded += 1;
                    Some(entry)
                }
                Ok(DownloadOutcome::Failed { .. }) => {
                    out.download_failures += 1;
                    None
                }
                Ok(DownloadOutcome::VerifyFailed { .. }) => {
                    out.verify_failures += 1;
                    None
                }
                Ok(DownloadOutcome::Lost { .. }) => {
                    out.lost_writes += 1;
                    None
                }
                Ok(DownloadOutcome::Idle) => None,
                Err(e) => {
                    stage_failed("download", &e, &mut out);
                    None
                }
            };

            if let Err(e) = self.deliver_one(kind, downloaded, &mut out).await {
                stage_failed("callback", &e, &mut out);
            }

            out
        }
        .instrument(span)
        .await
    }

    /// Invokes the callback for the entry downloaded this tick, or else for
    /// the oldest entry still waiting on delivery. Deleted on success.
    ///
    /// The entry is leased for the whole invocation, so an overlapping tick
    /// cannot pick it up again.
    async fn deliver_one(
        &self,
        kind: JobKind,
        just_downloaded: Option<JobEntry>,
        out: &mut KindReport,
    ) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        let entry = match just_downloaded {
            Some(entry) => Some(entry),
            None => {
                let now = Utc::now();
                let waiting =
                    stage::candidates(store, kind, &self.options, Stage::ReadyForCallback, now)
                        .await?;
                match stage::oldest_first(waiting, |e| e.attempts.last_invoke_at) {
                    Some(next) => stage::claim(store, next, &self.options, now).await?,
                    None => None,
                }
            }
        };
        let Some(mut entry) = entry else {
            return Ok(());
        };

        let delivery = match (&entry.state, entry.ensure_deliverable()) {
            (
                EntryState::ReadyForCallback {
                    remote_id,
                    generated_id,
                    result,
                },
                Ok(()),
            ) => Delivery {
                entry_id: entry.id,
                kind,
                owner: entry.owner.clone(),
                remote_id: remote_id.clone(),
                generated_id: generated_id.clone(),
                content: result.content.clone(),
            },
            (_, Err(e)) => {
                error!(entry_id = %entry.id, error = %e, "entry is not deliverable");
                return Ok(());
            }
            (_, Ok(())) => return Ok(()),
        };

        let attempted_at = Utc::now();
        match self.callbacks.invoke(&entry.callback, delivery).await {
            Ok(()) => {
                out.delivered += 1;
                if self.retire(&entry, kind).await? {
                    info!(
                        entry_id = %entry.id,
                        entry = %entry.label(),
                        handler = %entry.callback.handler,
                        "delivered and retired"
                    );
                } else {
                    out.lost_writes += 1;
                    error!(
                        entry_id = %entry.id,
                        "callback delivered but entry could not be retired"
                    );
                }
            }
            Err(e) => {
                out.delivery_failures += 1;
                entry.attempts.last_invoke_at = Some(attempted_at);
                stage::note_failure(
                    &mut entry,
                    RetryStage::Invoke,
                    format!("{}: {e}", e.code()),
                    &self.options.retry,
                    attempted_at,
                );
                entry.lease = None;
                if stage::commit_one(store, entry, kind, "callback")
                    .await?
                    .is_none()
                {
                    out.lost_writes += 1;
                }
            }
        }

        Ok(())
    }

    /// Deletes a delivered entry, retrying once at the current version when
    /// the first delete is stale.
    async fn retire(&self, entry: &JobEntry, kind: JobKind) -> Result<bool, StoreError> {
        let store = self.store.as_ref();
        let mut changes = ChangeSet::new();
        changes.delete(entry);
        if stage::commit(store, changes, kind, "callback").await?.is_some() {
            return Ok(true);
        }

        let Some(current) = store.get(entry.id).await? else {
            return Ok(true);
        };
        warn!(
            entry_id = %entry.id,
            expected_version = entry.version,
            current_version = current.version,
            "retiring delivered entry at its current version"
        );
        let mut changes = ChangeSet::new();
        changes.delete(&current);
        Ok(stage::commit(store, changes, kind, "callback")
            .await?
            .is_some())
    }
}

fn stage_failed(stage: &'static str, e: &StoreError, out: &mut KindReport) {
    error!(stage, error = %e, "stage failed");
    out.stage_errors += 1;
}
