//! Building blocks shared by the report and feed processors: candidate
//! selection, leased claims, failure bookkeeping and version-checked commits.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorOptions;
use crate::jobs::lifecycle::Stage;
use crate::jobs::model::{DownloadedResult, EntryState, JobEntry, JobKind, Lease, RetryStage};
use crate::jobs::retry::RetryPolicy;
use crate::jobs::store::{ChangeSet, EntryFilter, EntryStore, StoreError};
use crate::jobs::verify::{verify_content, DigestAlgorithm, VerifyError};
use crate::remote::{ProcessingStatus, RemoteJobService, RemoteStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted { entry_id: Uuid, remote_id: String },
    Failed { entry_id: Uuid, retries: u32 },
    /// The entry changed underneath the submission and the write was
    /// rejected. `remote_id` is set when the remote had accepted the job.
    Lost {
        entry_id: Uuid,
        remote_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub checked: usize,
    pub ready: usize,
    pub cancelled: usize,
    pub failed: usize,
    /// The batch write was rejected, so none of the above was persisted.
    pub rejected: bool,
}

#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    Idle,
    /// Content fetched and persisted; the entry is `ReadyForCallback` and
    /// still leased by this instance.
    Ready(JobEntry),
    Failed { entry_id: Uuid, retries: u32 },
    VerifyFailed { entry_id: Uuid, retries: u32 },
    /// The write after the attempt was rejected; nothing was persisted.
    Lost { entry_id: Uuid },
}

/// When a downloaded result must carry a matching digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    WhenDigestPresent,
    Required,
}

impl Verification {
    pub fn check(
        self,
        algorithm: DigestAlgorithm,
        result: &DownloadedResult,
    ) -> Result<(), VerifyError> {
        match (self, result.digest.as_deref()) {
            (Verification::WhenDigestPresent, None) => Ok(()),
            (_, expected) => verify_content(algorithm, &result.content, expected),
        }
    }
}

pub(crate) fn owned_filter(kind: JobKind, options: &OrchestratorOptions) -> EntryFilter {
    EntryFilter::new().kind(kind).owner(&options.owner)
}

/// Entries in `stage` that are due and not under a live lease.
pub(crate) async fn candidates(
    store: &dyn EntryStore,
    kind: JobKind,
    options: &OrchestratorOptions,
    stage: Stage,
    now: DateTime<Utc>,
) -> Result<Vec<JobEntry>, StoreError> {
    let mut entries = store
        .query(&owned_filter(kind, options).stage(stage))
        .await?;
    entries.retain(|e| e.is_due(now) && e.is_claimable(now));
    Ok(entries)
}

/// Least recently attempted first (never attempted before anything else),
/// ties broken by creation order.
pub(crate) fn oldest_first<F>(entries: Vec<JobEntry>, last_attempt: F) -> Option<JobEntry>
where
    F: Fn(&JobEntry) -> Option<DateTime<Utc>>,
{
    entries.into_iter().min_by_key(|e| (last_attempt(e), e.seq))
}

/// Takes a lease on `entry` with a version-checked save. `None` when the
/// entry is already leased or another tick got there first.
pub(crate) async fn claim(
    store: &dyn EntryStore,
    mut entry: JobEntry,
    options: &OrchestratorOptions,
    now: DateTime<Utc>,
) -> Result<Option<JobEntry>, StoreError> {
    if !entry.is_claimable(now) {
        return Ok(None);
    }
    entry.lease = Some(Lease {
        owner: options.instance_id.clone(),
        expires_at: now + Duration::seconds(options.lease_seconds),
    });

    match store.update(entry).await {
        Ok(claimed) => Ok(Some(claimed)),
        Err(StoreError::Conflict { id, .. }) | Err(StoreError::NotFound(id)) => {
            debug!(entry_id = %id, "entry claimed elsewhere, skipping");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Commits one stage's writes. A stale version rejects the whole set, which
/// is logged and reported as `None`.
pub(crate) async fn commit(
    store: &dyn EntryStore,
    changes: ChangeSet,
    kind: JobKind,
    stage: &'static str,
) -> Result<Option<Vec<JobEntry>>, StoreError> {
    if changes.is_empty() {
        return Ok(Some(Vec::new()));
    }
    let size = changes.len();
    match store.save_changes(changes).await {
        Ok(updated) => Ok(Some(updated)),
        Err(e @ StoreError::Conflict { .. }) | Err(e @ StoreError::NotFound(_)) => {
            warn!(kind = kind.as_str(), stage, changes = size, error = %e, "change set rejected");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Writes a single entry. `None` when its version went stale.
pub(crate) async fn commit_one(
    store: &dyn EntryStore,
    entry: JobEntry,
    kind: JobKind,
    stage: &'static str,
) -> Result<Option<JobEntry>, StoreError> {
    let mut changes = ChangeSet::new();
    changes.update(entry);
    Ok(commit(store, changes, kind, stage)
        .await?
        .and_then(|mut updated| updated.pop()))
}

/// Bumps the stage counter and schedules the next attempt.
pub(crate) fn note_failure(
    entry: &mut JobEntry,
    stage: RetryStage,
    message: impl Into<String>,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> u32 {
    let message = message.into();
    let retries = entry.record_failure(stage, message.clone());
    entry.retry_after = policy.retry_after(retries, now, &mut rand::thread_rng());
    warn!(
        entry_id = %entry.id,
        entry = %entry.label(),
        stage = stage.as_str(),
        retries,
        max = policy.max_for(stage),
        error = %message,
        "stage attempt failed"
    );
    retries
}

/// Deletes every entry of `kind` with a counter past its ceiling.
pub(crate) async fn purge_exhausted(
    store: &dyn EntryStore,
    kind: JobKind,
    options: &OrchestratorOptions,
) -> Result<usize, StoreError> {
    let now = Utc::now();
    let entries = store.query(&owned_filter(kind, options)).await?;

    let mut changes = ChangeSet::new();
    for entry in &entries {
        let Some(stage) = options.retry.exhausted_stage(entry) else {
            continue;
        };
        if !entry.is_claimable(now) {
            continue;
        }
        warn!(
            entry_id = %entry.id,
            entry = %entry.label(),
            stage = entry.stage().as_str(),
            exhausted = stage.as_str(),
            retries = entry.retries.get(stage),
            last_error = entry.last_error.as_deref().unwrap_or(""),
            "retries exhausted, purging entry"
        );
        changes.delete(entry);
    }

    let purged = changes.len();
    match commit(store, changes, kind, "cleanup").await? {
        Some(_) => Ok(purged),
        None => Ok(0),
    }
}

/// Submits at most one queued entry. Remote failures only bump the request
/// counter; the attempt timestamp is always written.
pub(crate) async fn submit_next(
    store: &dyn EntryStore,
    remote: &dyn RemoteJobService,
    kind: JobKind,
    options: &OrchestratorOptions,
) -> Result<Option<SubmitOutcome>, StoreError> {
    let now = Utc::now();
    let queued = candidates(store, kind, options, Stage::Queued, now).await?;
    let Some(next) = oldest_first(queued, |e| e.attempts.last_requested_at) else {
        return Ok(None);
    };
    let Some(mut entry) = claim(store, next, options, now).await? else {
        return Ok(None);
    };

    let attempted_at = Utc::now();
    entry.attempts.last_requested_at = Some(attempted_at);
    entry.lease = None;

    let submitted: anyhow::Result<String> =
        match remote.submit(kind, &entry.owner, &entry.payload).await {
            Ok(Some(remote_id)) => entry
                .transition(EntryState::AwaitingRemote {
                    remote_id: remote_id.clone(),
                })
                .map(|()| remote_id)
                .map_err(anyhow::Error::from),
            Ok(None) => Err(anyhow::anyhow!("remote returned no id")),
            Err(e) => Err(e),
        };

    let entry_id = entry.id;
    let label = entry.label();
    let outcome = match submitted {
        Ok(remote_id) => {
            entry.retry_after = None;
            SubmitOutcome::Submitted {
                entry_id,
                remote_id,
            }
        }
        Err(e) => {
            let retries = note_failure(
                &mut entry,
                RetryStage::Request,
                format!("submit failed: {e:#}"),
                &options.retry,
                attempted_at,
            );
            SubmitOutcome::Failed { entry_id, retries }
        }
    };

    if commit_one(store, entry, kind, "request").await?.is_some() {
        if let SubmitOutcome::Submitted { remote_id, .. } = &outcome {
            info!(
                entry_id = %entry_id,
                entry = %label,
                remote_id = %remote_id,
                "submitted to remote"
            );
        }
        return Ok(Some(outcome));
    }

    let remote_id = match outcome {
        SubmitOutcome::Submitted { remote_id, .. } => {
            error!(
                entry_id = %entry_id,
                entry = %label,
                orphaned_remote_id = %remote_id,
                "remote accepted the job but the entry could not be updated"
            );
            Some(remote_id)
        }
        _ => None,
    };
    Ok(Some(SubmitOutcome::Lost {
        entry_id,
        remote_id,
    }))
}

/// Asks the remote about every awaiting entry in one batch. `on_done`
/// computes the next state for an entry the remote reports finished.
pub(crate) async fn poll_pending<F>(
    store: &dyn EntryStore,
    remote: &dyn RemoteJobService,
    kind: JobKind,
    options: &OrchestratorOptions,
    on_done: F,
) -> Result<StatusSummary, StoreError>
where
    F: Fn(&JobEntry, &RemoteStatus) -> Result<EntryState, String> + Send + Sync,
{
    let now = Utc::now();
    let mut pending = store
        .query(&owned_filter(kind, options).stage(Stage::AwaitingRemote))
        .await?;
    pending.retain(|e| e.is_claimable(now));
    if pending.is_empty() {
        return Ok(StatusSummary::default());
    }

    let ids: Vec<String> = pending
        .iter()
        .filter_map(|e| e.remote_id().map(str::to_string))
        .collect();
    let mut summary = StatusSummary {
        checked: pending.len(),
        ..StatusSummary::default()
    };

    let response = remote.query_status(kind, &options.owner, &ids).await;
    let mut changes = ChangeSet::new();

    match response {
        Err(e) => {
            let message = format!("status query failed: {e:#}");
            for mut entry in pending {
                entry.attempts.last_status_at = Some(now);
                note_failure(&mut entry, RetryStage::Status, &message, &options.retry, now);
                summary.failed += 1;
                changes.update(entry);
            }
        }
        Ok(statuses) => {
            let by_id: HashMap<&str, &RemoteStatus> = statuses
                .iter()
                .map(|s| (s.remote_id.as_str(), s))
                .collect();

            for mut entry in pending {
                entry.attempts.last_status_at = Some(now);
                let status = entry.remote_id().and_then(|id| by_id.get(id).copied());

                let Some(status) = status else {
                    note_failure(
                        &mut entry,
                        RetryStage::Status,
                        "missing from status response",
                        &options.retry,
                        now,
                    );
                    summary.failed += 1;
                    changes.update(entry);
                    continue;
                };

                entry.last_remote_status = Some(status.status.as_str().to_string());
                match &status.status {
                    ProcessingStatus::Done => {
                        let moved = on_done(&entry, status).and_then(|next| {
                            entry.transition(next).map_err(|e| e.to_string())
                        });
                        match moved {
                            Ok(()) => {
                                entry.retry_after = None;
                                info!(
                                    entry_id = %entry.id,
                                    entry = %entry.label(),
                                    generated_id = entry.generated_id().unwrap_or(""),
                                    "result ready for download"
                                );
                                summary.ready += 1;
                            }
                            Err(reason) => {
                                note_failure(
                                    &mut entry,
                                    RetryStage::Status,
                                    reason,
                                    &options.retry,
                                    now,
                                );
                                summary.failed += 1;
                            }
                        }
                    }
                    ProcessingStatus::Cancelled => match entry.transition(EntryState::Queued) {
                        Ok(()) => {
                            note_failure(
                                &mut entry,
                                RetryStage::Request,
                                "cancelled by remote",
                                &options.retry,
                                now,
                            );
                            summary.cancelled += 1;
                        }
                        Err(e) => {
                            note_failure(
                                &mut entry,
                                RetryStage::Status,
                                e.to_string(),
                                &options.retry,
                                now,
                            );
                            summary.failed += 1;
                        }
                    },
                    other => {
                        debug!(
                            entry_id = %entry.id,
                            status = other.as_str(),
                            "still processing"
                        );
                    }
                }
                changes.update(entry);
            }
        }
    }

    if commit(store, changes, kind, "status").await?.is_none() {
        return Ok(StatusSummary {
            checked: summary.checked,
            rejected: true,
            ..StatusSummary::default()
        });
    }
    Ok(summary)
}

/// Downloads at most one ready entry and checks its digest. On success the
/// content is persisted with the entry, which moves to `ReadyForCallback`.
pub(crate) async fn download_one<F>(
    store: &dyn EntryStore,
    remote: &dyn RemoteJobService,
    kind: JobKind,
    options: &OrchestratorOptions,
    download_id: F,
    verification: Verification,
) -> Result<DownloadOutcome, StoreError>
where
    F: Fn(&JobEntry) -> Option<String> + Send + Sync,
{
    let now = Utc::now();
    let ready = candidates(store, kind, options, Stage::ReadyForDownload, now).await?;
    let Some(next) = oldest_first(ready, |e| e.attempts.last_download_at) else {
        return Ok(DownloadOutcome::Idle);
    };
    let Some(mut entry) = claim(store, next, options, now).await? else {
        return Ok(DownloadOutcome::Idle);
    };

    let attempted_at = Utc::now();
    entry.attempts.last_download_at = Some(attempted_at);

    let fetched = match download_id(&entry) {
        Some(id) => remote
            .download(kind, &entry.owner, &id)
            .await
            .map_err(|e| format!("download failed: {e:#}")),
        None => Err("entry has no id to download".to_string()),
    };

    let result = match fetched {
        Ok(result) => result,
        Err(message) => {
            let retries = note_failure(
                &mut entry,
                RetryStage::Download,
                message,
                &options.retry,
                attempted_at,
            );
            return release_after_failure(store, entry, kind, "download", |entry_id| {
                DownloadOutcome::Failed { entry_id, retries }
            })
            .await;
        }
    };

    if let Err(e) = verification.check(options.digest, &result) {
        // content is dropped; the entry stays ReadyForDownload and is fetched again
        let retries = note_failure(
            &mut entry,
            RetryStage::Verify,
            e.to_string(),
            &options.retry,
            attempted_at,
        );
        return release_after_failure(store, entry, kind, "verify", |entry_id| {
            DownloadOutcome::VerifyFailed { entry_id, retries }
        })
        .await;
    }

    let remote_id = entry.remote_id().unwrap_or_default().to_string();
    let generated_id = entry.generated_id().map(str::to_string);
    let bytes = result.content.len();
    if let Err(e) = entry.transition(EntryState::ReadyForCallback {
        remote_id,
        generated_id,
        result,
    }) {
        let retries = note_failure(
            &mut entry,
            RetryStage::Download,
            e.to_string(),
            &options.retry,
            attempted_at,
        );
        return release_after_failure(store, entry, kind, "download", |entry_id| {
            DownloadOutcome::Failed { entry_id, retries }
        })
        .await;
    }
    entry.retry_after = None;

    let entry_id = entry.id;
    match commit_one(store, entry, kind, "download").await? {
        Some(updated) => {
            info!(entry_id = %entry_id, bytes, "result downloaded");
            Ok(DownloadOutcome::Ready(updated))
        }
        None => Ok(DownloadOutcome::Lost { entry_id }),
    }
}

async fn release_after_failure<F>(
    store: &dyn EntryStore,
    mut entry: JobEntry,
    kind: JobKind,
    stage: &'static str,
    outcome: F,
) -> Result<DownloadOutcome, StoreError>
where
    F: FnOnce(Uuid) -> DownloadOutcome,
{
    let entry_id = entry.id;
    entry.lease = None;
    match commit_one(store, entry, kind, stage).await? {
        Some(_) => Ok(outcome(entry_id)),
        None => Ok(DownloadOutcome::Lost { entry_id }),
    }
}
