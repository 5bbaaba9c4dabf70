use async_trait::async_trait;

use crate::jobs::model::JobKind;
use crate::jobs::stage::{DownloadOutcome, StatusSummary, SubmitOutcome};
use crate::jobs::store::StoreError;

/// Drives one job kind through its lifecycle, one stage per call.
///
/// Remote failures never surface as errors here; they are recorded on the
/// entry. An `Err` means the store itself failed.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Deletes entries whose retries are exhausted. Returns how many.
    async fn cleanup_expired(&self) -> Result<usize, StoreError>;

    /// Submits at most one queued entry.
    async fn request_next(&self) -> Result<Option<SubmitOutcome>, StoreError>;

    /// Checks every awaiting entry with one batched status query.
    async fn poll_statuses(&self) -> Result<StatusSummary, StoreError>;

    /// Downloads at most one finished result.
    async fn download_next(&self) -> Result<DownloadOutcome, StoreError>;
}
