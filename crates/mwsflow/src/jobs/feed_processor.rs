use std::sync::Arc;

use async_trait::async_trait;

use crate::config::OrchestratorOptions;
use crate::jobs::model::{EntryState, JobEntry, JobKind};
use crate::jobs::processor::JobProcessor;
use crate::jobs::stage::{
    self, DownloadOutcome, StatusSummary, SubmitOutcome, Verification,
};
use crate::jobs::store::{EntryStore, StoreError};
use crate::remote::{RemoteJobService, RemoteStatus};

/// Feed lifecycle: one submission id for the whole job. The processing
/// report is fetched by that id and must match the digest the remote sends.
pub struct FeedProcessor {
    store: Arc<dyn EntryStore>,
    remote: Arc<dyn RemoteJobService>,
    options: OrchestratorOptions,
}

impl FeedProcessor {
    pub fn new(
        store: Arc<dyn EntryStore>,
        remote: Arc<dyn RemoteJobService>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            store,
            remote,
            options,
        }
    }

    fn on_done(entry: &JobEntry, _status: &RemoteStatus) -> Result<EntryState, String> {
        let submission_id = entry
            .remote_id()
            .ok_or_else(|| "feed has no submission id".to_string())?;
        Ok(EntryState::ReadyForDownload {
            remote_id: submission_id.to_string(),
            generated_id: None,
        })
    }

    fn download_id(entry: &JobEntry) -> Option<String> {
        entry.remote_id().map(str::to_string)
    }
}

#[async_trait]
impl JobProcessor for FeedProcessor {
    fn kind(&self) -> JobKind {
        JobKind::Feed
    }

    async fn cleanup_expired(&self) -> Result<usize, StoreError> {
        stage::purge_exhausted(self.store.as_ref(), JobKind::Feed, &self.options).await
    }

    async fn request_next(&self) -> Result<Option<SubmitOutcome>, StoreError> {
        stage::submit_next(
            self.store.as_ref(),
            self.remote.as_ref(),
            JobKind::Feed,
            &self.options,
        )
        .await
    }

    async fn poll_statuses(&self) -> Result<StatusSummary, StoreError> {
        stage::poll_pending(
            self.store.as_ref(),
            self.remote.as_ref(),
            JobKind::Feed,
            &self.options,
            Self::on_done,
        )
        .await
    }

    async fn download_next(&self) -> Result<DownloadOutcome, StoreError> {
        stage::download_one(
            self.store.as_ref(),
            self.remote.as_ref(),
            JobKind::Feed,
            &self.options,
            Self::download_id,
            Verification::Required,
        )
        .await
    }
}
