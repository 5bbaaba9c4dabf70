use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::lifecycle::Stage;
use crate::jobs::model::{JobEntry, JobKind, NewJobEntry, Owner};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Someone else saved the entry since it was read.
    #[error("entry {id} was modified concurrently (expected version {expected_version})")]
    Conflict { id: Uuid, expected_version: i64 },

    #[error("entry {0} not found")]
    NotFound(Uuid),

    #[error("entry {id} has an invalid persisted shape: {reason}")]
    Corrupt { id: Uuid, reason: String },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Selection predicate for `EntryStore::query`. Results come back in
/// creation order.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub kind: Option<JobKind>,
    pub owner: Option<Owner>,
    pub stage: Option<Stage>,
    pub limit: Option<i64>,
}

impl EntryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn owner(mut self, owner: &Owner) -> Self {
        self.owner = Some(owner.clone());
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &JobEntry) -> bool {
        self.kind.map_or(true, |k| entry.kind == k)
            && self.owner.as_ref().map_or(true, |o| &entry.owner == o)
            && self.stage.map_or(true, |s| entry.stage() == s)
    }
}

#[derive(Debug, Clone)]
pub enum Change {
    Update(JobEntry),
    Delete { id: Uuid, version: i64 },
}

/// Writes produced by one stage, committed together.
///
/// Every change carries the version it was read at; the store rejects the
/// whole set if any of them is stale.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, entry: JobEntry) -> &mut Self {
        self.changes.push(Change::Update(entry));
        self
    }

    pub fn delete(&mut self, entry: &JobEntry) -> &mut Self {
        self.changes.push(Change::Delete {
            id: entry.id,
            version: entry.version,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn into_changes(self) -> Vec<Change> {
        self.changes
    }
}

/// Durable storage for job entries.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Insert a fresh `Queued` entry.
    async fn create(&self, entry: NewJobEntry) -> Result<JobEntry, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<JobEntry>, StoreError>;

    async fn query(&self, filter: &EntryFilter) -> Result<Vec<JobEntry>, StoreError>;

    /// Atomically apply a change set. Returns the updated entries with their
    /// new versions, in change order.
    async fn save_changes(&self, changes: ChangeSet) -> Result<Vec<JobEntry>, StoreError>;

    /// Drop leases that expired before `now`. Returns how many were released.
    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn update(&self, entry: JobEntry) -> Result<JobEntry, StoreError> {
        let id = entry.id;
        let mut changes = ChangeSet::new();
        changes.update(entry);
        self.save_changes(changes)
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound(id))
    }

    async fn delete(&self, entry: &JobEntry) -> Result<(), StoreError> {
        let mut changes = ChangeSet::new();
        changes.delete(entry);
        self.save_changes(changes).await?;
        Ok(())
    }
}
