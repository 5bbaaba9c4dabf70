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

/// Report lifecycle: the remote accepts a request id, later announces a
/// generated report id, and the report is downloaded by that generated id.
pub struct ReportProcessor {
    store: Arc<dyn EntryStore>,
    remote: Arc<dyn RemoteJobService>,
    options: OrchestratorOptions,
}

impl ReportProcessor {
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

    fn on_done(entry: &JobEntry, status: &RemoteStatus) -> Result<EntryState, String> {
        let generated_id = status
            .generated_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| "report done without a generated report id".to_string())?;

        Ok(EntryState::ReadyForDownload {
            remote_id: entry.remote_id().unwrap_or_default().to_string(),
            generated_id: Some(generated_id.to_string()),
        })
    }

    fn download_id(entry: &JobEntry) -> Option<String> {
        entry.generated_id().map(str::to_string)
    }
}

#[async_trait]
impl JobProcessor for ReportProcessor {
    fn kind(&self) -> JobKind {
        JobKind::Report
    }

    async fn cleanup_expired(&self) -> Result<usize, StoreError> {
        stage::purge_exhausted(self.store.as_ref(), JobKind::Report, &self.options).await
    }

    async fn request_next(&self) -> Result<Option<SubmitOutcome>, StoreError> {
        stage::submit_next(
            self.store.as_ref(),
            self.remote.as_ref(),
            JobKind::Report,
            &self.options,
        )
        .await
    }

    async fn poll_statuses(&self) -> Result<StatusSummary, StoreError> {
        stage::poll_pending(
            self.store.as_ref(),
            self.remote.as_ref(),
            JobKind::Report,
            &self.options,
            Self::on_done,
        )
        .await
    }

    async fn download_next(&self) -> Result<DownloadOutcome, StoreError> {
        // reports are only checked when the remote sends a digest
        stage::download_one(
            self.store.as_ref(),
            self.remote.as_ref(),
            JobKind::Report,
            &self.options,
            Self::download_id,
            Verification::WhenDigestPresent,
        )
        .await
    }
}
