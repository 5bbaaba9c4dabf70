//! Boundary to the poll-only remote batch service.

use async_trait::async_trait;
use serde_json::Value;

use crate::jobs::model::{DownloadedResult, JobKind, Owner};

/// Processing status as reported by the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingStatus {
    Submitted,
    InProgress,
    Done,
    Cancelled,
    Other(String),
}

impl ProcessingStatus {
    /// Accepts both the bare names and the `_NAME_` wire form.
    pub fn parse(raw: &str) -> Self {
        let name = raw.trim().trim_matches('_').to_uppercase();
        match name.as_str() {
            "SUBMITTED" => ProcessingStatus::Submitted,
            "IN_PROGRESS" => ProcessingStatus::InProgress,
            "DONE" => ProcessingStatus::Done,
            "CANCELLED" | "CANCELED" => ProcessingStatus::Cancelled,
            _ => ProcessingStatus::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProcessingStatus::Submitted => "_SUBMITTED_",
            ProcessingStatus::InProgress => "_IN_PROGRESS_",
            ProcessingStatus::Done => "_DONE_",
            ProcessingStatus::Cancelled => "_CANCELLED_",
            ProcessingStatus::Other(s) => s,
        }
    }
}

/// One row of a batched status response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub remote_id: String,
    /// Id of the produced result. Reports only.
    pub generated_id: Option<String>,
    pub status: ProcessingStatus,
}

impl RemoteStatus {
    pub fn new(remote_id: impl Into<String>, status: ProcessingStatus) -> Self {
        Self {
            remote_id: remote_id.into(),
            generated_id: None,
            status,
        }
    }

    pub fn with_generated_id(mut self, generated_id: impl Into<String>) -> Self {
        self.generated_id = Some(generated_id.into());
        self
    }
}

/// Client for the remote service. Errors are treated as transient by the
/// processors and only ever bump a retry counter.
#[async_trait]
pub trait RemoteJobService: Send + Sync {
    /// Returns the remote id, or `None` when the service accepted the call but
    /// handed back no usable id.
    async fn submit(
        &self,
        kind: JobKind,
        owner: &Owner,
        payload: &Value,
    ) -> anyhow::Result<Option<String>>;

    async fn query_status(
        &self,
        kind: JobKind,
        owner: &Owner,
        remote_ids: &[String],
    ) -> anyhow::Result<Vec<RemoteStatus>>;

    /// `id` is the generated id for reports and the submission id for feeds.
    async fn download(
        &self,
        kind: JobKind,
        owner: &Owner,
        id: &str,
    ) -> anyhow::Result<DownloadedResult>;
}

/// Stand-in used when no vendor client is wired up. Every call fails.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredRemote;

#[async_trait]
impl RemoteJobService for UnconfiguredRemote {
    async fn submit(
        &self,
        kind: JobKind,
        _owner: &Owner,
        _payload: &Value,
    ) -> anyhow::Result<Option<String>> {
        anyhow::bail!("no remote client configured (submit {})", kind.as_str())
    }

    async fn query_status(
        &self,
        kind: JobKind,
        _owner: &Owner,
        _remote_ids: &[String],
    ) -> anyhow::Result<Vec<RemoteStatus>> {
        anyhow::bail!("no remote client configured (status {})", kind.as_str())
    }

    async fn download(
        &self,
        kind: JobKind,
        _owner: &Owner,
        _id: &str,
    ) -> anyhow::Result<DownloadedResult> {
        anyhow::bail!("no remote client configured (download {})", kind.as_str())
    }
}
