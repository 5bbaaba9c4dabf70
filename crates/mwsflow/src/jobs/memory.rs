use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::jobs::model::{
    AttemptTimestamps, EntryState, JobEntry, NewJobEntry, RetryCounters,
};
use crate::jobs::store::{Change, ChangeSet, EntryFilter, EntryStore, StoreError};

/// Operation counts, handy for asserting on store traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub conflicts: u64,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<Uuid, JobEntry>,
    next_seq: i64,
    stats: StoreStats,
}

/// Process-local store with the same versioning rules as `PgEntryStore`.
#[derive(Default)]
pub struct InMemoryEntryStore {
    inner: Mutex<Inner>,
}

impl InMemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stats(&self) -> StoreStats {
        self.inner.lock().await.stats
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EntryStore for InMemoryEntryStore {
    async fn create(&self, entry: NewJobEntry) -> Result<JobEntry, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_seq += 1;
        let now = Utc::now();

        let created = JobEntry {
            id: Uuid::new_v4(),
            seq: inner.next_seq,
            kind: entry.kind,
            owner: entry.owner,
            payload: entry.payload,
            callback: entry.callback,
            state: EntryState::Queued,
            superseded_remote_ids: Vec::new(),
            retries: RetryCounters::default(),
            attempts: AttemptTimestamps::default(),
            retry_after: None,
            last_remote_status: None,
            has_errors: false,
            last_error: None,
            lease: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        inner.entries.insert(created.id, created.clone());
        inner.stats.creates += 1;
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobEntry>, StoreError> {
        Ok(self.inner.lock().await.entries.get(&id).cloned())
    }

    async fn query(&self, filter: &EntryFilter) -> Result<Vec<JobEntry>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<JobEntry> = inner
            .entries
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.seq);
        if let Some(limit) = filter.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }

    async fn save_changes(&self, changes: ChangeSet) -> Result<Vec<JobEntry>, StoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        // validate everything first so a stale change leaves nothing applied
        for change in changes.iter() {
            let (id, expected) = match change {
                Change::Update(entry) => (entry.id, entry.version),
                Change::Delete { id, version } => (*id, *version),
            };
            match inner.entries.get(&id) {
                None => return Err(StoreError::NotFound(id)),
                Some(current) if current.version != expected => {
                    inner.stats.conflicts += 1;
                    return Err(StoreError::Conflict {
                        id,
                        expected_version: expected,
                    });
                }
                Some(_) => {}
            }
        }

        let now = Utc::now();
        let mut updated = Vec::new();
        for change in changes.into_changes() {
            match change {
                Change::Update(mut entry) => {
                    entry.version += 1;
                    entry.updated_at = now;
                    inner.entries.insert(entry.id, entry.clone());
                    inner.stats.updates += 1;
                    updated.push(entry);
                }
                Change::Delete { id, .. } => {
                    inner.entries.remove(&id);
                    inner.stats.deletes += 1;
                }
            }
        }

        Ok(updated)
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut released = 0;
        for entry in inner.entries.values_mut() {
            if entry.lease.as_ref().is_some_and(|l| l.expires_at < now) {
                entry.lease = None;
                entry.version += 1;
                entry.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }
}
