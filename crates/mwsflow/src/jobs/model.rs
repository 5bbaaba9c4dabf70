use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::lifecycle::{self, Stage, TransitionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Report,
    Feed,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Report => "report",
            JobKind::Feed => "feed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "report" => Some(JobKind::Report),
            "feed" => Some(JobKind::Feed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Australia,
    Brazil,
    China,
    Europe,
    India,
    Japan,
    NorthAmerica,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Australia => "australia",
            Region::Brazil => "brazil",
            Region::China => "china",
            Region::Europe => "europe",
            Region::India => "india",
            Region::Japan => "japan",
            Region::NorthAmerica => "north_america",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "australia" | "au" => Some(Region::Australia),
            "brazil" | "br" => Some(Region::Brazil),
            "china" | "cn" => Some(Region::China),
            "europe" | "eu" => Some(Region::Europe),
            "india" | "in" => Some(Region::India),
            "japan" | "jp" => Some(Region::Japan),
            "north_america" | "northamerica" | "na" => Some(Region::NorthAmerica),
            _ => None,
        }
    }
}

/// Region + merchant pair an entry belongs to. Fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub region: Region,
    pub merchant_id: String,
}

impl Owner {
    pub fn new(region: Region, merchant_id: impl Into<String>) -> Self {
        Self {
            region,
            merchant_id: merchant_id.into(),
        }
    }
}

/// Persisted reference to a registered callback handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackDescriptor {
    pub handler: String,
    pub argument: Value,
    pub argument_type: String,
}

/// Result bytes fetched from the remote service plus the digest it reported.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DownloadedResult {
    pub content: Vec<u8>,
    pub digest: Option<String>,
}

/// Lifecycle state of an entry.
///
/// `remote_id` is the report request id or the feed submission id;
/// `generated_id` is only ever set for reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Queued,
    AwaitingRemote {
        remote_id: String,
    },
    ReadyForDownload {
        remote_id: String,
        generated_id: Option<String>,
    },
    ReadyForCallback {
        remote_id: String,
        generated_id: Option<String>,
        result: DownloadedResult,
    },
}

impl EntryState {
    pub fn stage(&self) -> Stage {
        match self {
            EntryState::Queued => Stage::Queued,
            EntryState::AwaitingRemote { .. } => Stage::AwaitingRemote,
            EntryState::ReadyForDownload { .. } => Stage::ReadyForDownload,
            EntryState::ReadyForCallback { .. } => Stage::ReadyForCallback,
        }
    }

    pub fn remote_id(&self) -> Option<&str> {
        match self {
            EntryState::Queued => None,
            EntryState::AwaitingRemote { remote_id }
            | EntryState::ReadyForDownload { remote_id, .. }
            | EntryState::ReadyForCallback { remote_id, .. } => Some(remote_id),
        }
    }

    pub fn generated_id(&self) -> Option<&str> {
        match self {
            EntryState::ReadyForDownload { generated_id, .. }
            | EntryState::ReadyForCallback { generated_id, .. } => generated_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStage {
    Request,
    Status,
    Download,
    Verify,
    Invoke,
}

impl RetryStage {
    pub const ALL: [RetryStage; 5] = [
        RetryStage::Request,
        RetryStage::Status,
        RetryStage::Download,
        RetryStage::Verify,
        RetryStage::Invoke,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStage::Request => "request",
            RetryStage::Status => "status",
            RetryStage::Download => "download",
            RetryStage::Verify => "verify",
            RetryStage::Invoke => "invoke",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    pub request: u32,
    pub status: u32,
    pub download: u32,
    pub verify: u32,
    pub invoke: u32,
}

impl RetryCounters {
    pub fn get(&self, stage: RetryStage) -> u32 {
        match stage {
            RetryStage::Request => self.request,
            RetryStage::Status => self.status,
            RetryStage::Download => self.download,
            RetryStage::Verify => self.verify,
            RetryStage::Invoke => self.invoke,
        }
    }

    /// Counters only ever go up.
    pub fn increment(&mut self, stage: RetryStage) -> u32 {
        let slot = match stage {
            RetryStage::Request => &mut self.request,
            RetryStage::Status => &mut self.status,
            RetryStage::Download => &mut self.download,
            RetryStage::Verify => &mut self.verify,
            RetryStage::Invoke => &mut self.invoke,
        };
        *slot = slot.saturating_add(1);
        *slot
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptTimestamps {
    pub last_requested_at: Option<DateTime<Utc>>,
    pub last_status_at: Option<DateTime<Utc>>,
    pub last_download_at: Option<DateTime<Utc>>,
    pub last_invoke_at: Option<DateTime<Utc>>,
}

/// Time-bounded claim on an entry by one orchestrator instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JobEntry {
    pub id: Uuid,
    /// Monotonic creation order, used as the tie breaker when selecting.
    pub seq: i64,
    pub kind: JobKind,
    pub owner: Owner,
    pub payload: Value,
    pub callback: CallbackDescriptor,
    pub state: EntryState,
    pub superseded_remote_ids: Vec<String>,
    pub retries: RetryCounters,
    pub attempts: AttemptTimestamps,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_remote_status: Option<String>,
    pub has_errors: bool,
    pub last_error: Option<String>,
    pub lease: Option<Lease>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobEntry {
    pub fn stage(&self) -> Stage {
        self.state.stage()
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.state.remote_id()
    }

    pub fn generated_id(&self) -> Option<&str> {
        self.state.generated_id()
    }

    pub fn accepted_by_remote(&self) -> bool {
        self.stage() != Stage::Queued
    }

    pub fn result_ready(&self) -> bool {
        matches!(
            self.stage(),
            Stage::ReadyForDownload | Stage::ReadyForCallback
        )
    }

    /// Moves the entry to `next`, enforcing the transition table and the
    /// write-once rule for remote ids.
    pub fn transition(&mut self, next: EntryState) -> Result<(), TransitionError> {
        lifecycle::ensure_transition(self.stage(), next.stage())?;

        match (&self.state, &next) {
            (EntryState::Queued, EntryState::AwaitingRemote { remote_id }) => {
                if remote_id.trim().is_empty() {
                    return Err(TransitionError::EmptyRemoteId);
                }
                if self.superseded_remote_ids.iter().any(|id| id == remote_id) {
                    return Err(TransitionError::IdReused(remote_id.clone()));
                }
            }
            (EntryState::AwaitingRemote { remote_id: old }, EntryState::Queued) => {
                self.superseded_remote_ids.push(old.clone());
            }
            (current, _) => {
                lifecycle::ensure_same_id("remote_id", current.remote_id(), next.remote_id())?;
                if current.generated_id().is_some() {
                    lifecycle::ensure_same_id(
                        "generated_id",
                        current.generated_id(),
                        next.generated_id(),
                    )?;
                }
            }
        }

        self.state = next;
        Ok(())
    }

    /// Confirms the entry may be retired as delivered.
    pub fn ensure_deliverable(&self) -> Result<(), TransitionError> {
        lifecycle::ensure_transition(self.stage(), Stage::Delivered)
    }

    pub fn record_failure(&mut self, stage: RetryStage, message: impl Into<String>) -> u32 {
        self.has_errors = true;
        self.last_error = Some(message.into());
        self.retries.increment(stage)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.map_or(true, |at| at <= now)
    }

    /// True when nobody holds an unexpired lease. A lease also excludes the
    /// instance that took it, so overlapping ticks of one process never share
    /// an entry.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().map_or(true, |lease| lease.expires_at <= now)
    }

    /// Short human label used in log lines.
    pub fn label(&self) -> String {
        let subtype = self
            .payload
            .get("report_type")
            .or_else(|| self.payload.get("feed_type"))
            .and_then(Value::as_str)
            .unwrap_or("?");
        format!(
            "[region:'{}', {}:'{}']",
            self.owner.region.as_str(),
            self.kind.as_str(),
            subtype
        )
    }
}

#[derive(Debug, Clone)]
pub struct NewJobEntry {
    pub kind: JobKind,
    pub owner: Owner,
    pub payload: Value,
    pub callback: CallbackDescriptor,
}
