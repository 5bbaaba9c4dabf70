// crates/mwsflow/src/api/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::model::{AttemptTimestamps, JobEntry, RetryCounters};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryListItem {
    pub id: Uuid,
    pub kind: String,
    pub region: String,
    pub merchant_id: String,
    pub stage: String,

    pub remote_id: Option<String>,
    pub generated_id: Option<String>,
    pub superseded_remote_ids: Vec<String>,

    pub retries: RetryCounters,
    pub attempts: AttemptTimestamps,
    pub retry_after: Option<DateTime<Utc>>,

    pub last_remote_status: Option<String>,
    pub has_errors: bool,
    pub last_error: Option<String>,

    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&JobEntry> for EntryListItem {
    fn from(e: &JobEntry) -> Self {
        Self {
            id: e.id,
            kind: e.kind.as_str().to_string(),
            region: e.owner.region.as_str().to_string(),
            merchant_id: e.owner.merchant_id.clone(),
            stage: e.stage().as_str().to_string(),
            remote_id: e.remote_id().map(str::to_string),
            generated_id: e.generated_id().map(str::to_string),
            superseded_remote_ids: e.superseded_remote_ids.clone(),
            retries: e.retries,
            attempts: e.attempts,
            retry_after: e.retry_after,
            last_remote_status: e.last_remote_status.clone(),
            has_errors: e.has_errors,
            last_error: e.last_error.clone(),
            lease_owner: e.lease.as_ref().map(|l| l.owner.clone()),
            lease_expires_at: e.lease.as_ref().map(|l| l.expires_at),
            version: e.version,
            created_at: e.created_at,
            updated_at: e.updated_at,
        }
    }
}

/// Single-entry view. Content itself is not returned, only its size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDetail {
    #[serde(flatten)]
    pub summary: EntryListItem,
    pub payload: Value,
    pub callback_handler: String,
    pub callback_argument_type: String,
    pub content_bytes: Option<usize>,
    pub content_digest: Option<String>,
}

impl From<&JobEntry> for EntryDetail {
    fn from(e: &JobEntry) -> Self {
        let (content_bytes, content_digest) = match &e.state {
            crate::jobs::model::EntryState::ReadyForCallback { result, .. } => {
                (Some(result.content.len()), result.digest.clone())
            }
            _ => (None, None),
        };
        Self {
            summary: EntryListItem::from(e),
            payload: e.payload.clone(),
            callback_handler: e.callback.handler.clone(),
            callback_argument_type: e.callback.argument_type.clone(),
            content_bytes,
            content_digest,
        }
    }
}
