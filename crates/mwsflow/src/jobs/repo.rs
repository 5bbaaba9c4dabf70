// crates/mwsflow/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::jobs::lifecycle::Stage;
use crate::jobs::model::{
    AttemptTimestamps, CallbackDescriptor, DownloadedResult, EntryState, JobEntry, JobKind, Lease,
    NewJobEntry, Owner, Region, RetryCounters,
};
use crate::jobs::store::{Change, ChangeSet, EntryFilter, EntryStore, StoreError};

#[derive(Debug, Clone, sqlx::FromRow)]
struct EntryRow {
    id: Uuid,
    seq: i64,

    kind: String,
    region: String,
    merchant_id: String,
    payload: Value,

    callback_handler: String,
    callback_argument: Value,
    callback_argument_type: String,

    stage: String,
    remote_id: Option<String>,
    generated_id: Option<String>,
    superseded_remote_ids: Json<Vec<String>>,
    result_content: Option<Vec<u8>>,
    result_digest: Option<String>,

    request_retry_count: i32,
    status_retry_count: i32,
    download_retry_count: i32,
    verify_retry_count: i32,
    invoke_retry_count: i32,

    last_requested_at: Option<DateTime<Utc>>,
    last_status_at: Option<DateTime<Utc>>,
    last_download_at: Option<DateTime<Utc>>,
    last_invoke_at: Option<DateTime<Utc>>,
    retry_after: Option<DateTime<Utc>>,

    last_remote_status: Option<String>,
    has_errors: bool,
    last_error: Option<String>,

    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,

    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EntryRow> for JobEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |reason: String| StoreError::Corrupt { id, reason };

        let kind =
            JobKind::parse(&row.kind).ok_or_else(|| corrupt(format!("unknown kind {}", row.kind)))?;
        let region = Region::parse(&row.region)
            .ok_or_else(|| corrupt(format!("unknown region {}", row.region)))?;
        let stage = Stage::parse(&row.stage)
            .ok_or_else(|| corrupt(format!("unknown stage {}", row.stage)))?;

        let state = match stage {
            Stage::Queued => EntryState::Queued,
            Stage::AwaitingRemote => EntryState::AwaitingRemote {
                remote_id: row
                    .remote_id
                    .ok_or_else(|| corrupt("awaiting_remote without remote_id".into()))?,
            },
            Stage::ReadyForDownload => EntryState::ReadyForDownload {
                remote_id: row
                    .remote_id
                    .ok_or_else(|| corrupt("ready_for_download without remote_id".into()))?,
                generated_id: row.generated_id,
            },
            Stage::ReadyForCallback => EntryState::ReadyForCallback {
                remote_id: row
                    .remote_id
                    .ok_or_else(|| corrupt("ready_for_callback without remote_id".into()))?,
                generated_id: row.generated_id,
                result: DownloadedResult {
                    content: row
                        .result_content
                        .ok_or_else(|| corrupt("ready_for_callback without content".into()))?,
                    digest: row.result_digest,
                },
            },
            Stage::Delivered => return Err(corrupt("delivered entries are never stored".into())),
        };

        let lease = match (row.lease_owner, row.lease_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
            _ => None,
        };

        Ok(JobEntry {
            id,
            seq: row.seq,
            kind,
            owner: Owner::new(region, row.merchant_id),
            payload: row.payload,
            callback: CallbackDescriptor {
                handler: row.callback_handler,
                argument: row.callback_argument,
                argument_type: row.callback_argument_type,
            },
            state,
            superseded_remote_ids: row.superseded_remote_ids.0,
            retries: RetryCounters {
                request: row.request_retry_count.max(0) as u32,
                status: row.status_retry_count.max(0) as u32,
                download: row.download_retry_count.max(0) as u32,
                verify: row.verify_retry_count.max(0) as u32,
                invoke: row.invoke_retry_count.max(0) as u32,
            },
            attempts: AttemptTimestamps {
                last_requested_at: row.last_requested_at,
                last_status_at: row.last_status_at,
                last_download_at: row.last_download_at,
                last_invoke_at: row.last_invoke_at,
            },
            retry_after: row.retry_after,
            last_remote_status: row.last_remote_status,
            has_errors: row.has_errors,
            last_error: row.last_error,
            lease,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn count(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

/// Postgres-backed `EntryStore`. Every change set runs in one transaction and
/// each row write is guarded by `version`.
#[derive(Clone)]
pub struct PgEntryStore {
    pool: PgPool,
}

impl PgEntryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn apply_update(
        tx: &mut Transaction<'_, Postgres>,
        entry: &JobEntry,
    ) -> Result<Option<EntryRow>, StoreError> {
        let (result_content, result_digest) = match &entry.state {
            EntryState::ReadyForCallback { result, .. } => {
                (Some(result.content.clone()), result.digest.clone())
            }
            _ => (None, None),
        };
        let (lease_owner, lease_expires_at) = match &entry.lease {
            Some(l) => (Some(l.owner.clone()), Some(l.expires_at)),
            None => (None, None),
        };

        // ownership, payload and callback columns are never rewritten
        let row = sqlx::query_as::<_, EntryRow>(
            r#"
            UPDATE job_entries
            SET stage = $3,
                remote_id = $4,
                generated_id = $5,
                superseded_remote_ids = $6,
                result_content = $7,
                result_digest = $8,
                request_retry_count = $9,
                status_retry_count = $10,
                download_retry_count = $11,
                verify_retry_count = $12,
                invoke_retry_count = $13,
                last_requested_at = $14,
                last_status_at = $15,
                last_download_at = $16,
                last_invoke_at = $17,
                retry_after = $18,
                last_remote_status = $19,
                has_errors = $20,
                last_error = $21,
                lease_owner = $22,
                lease_expires_at = $23,
                version = version + 1,
                updated_at = now()
            WHERE id = $1
              AND version = $2
            RETURNING *
            "#,
        )
        .bind(entry.id)
        .bind(entry.version)
        .bind(entry.stage().as_str())
        .bind(entry.remote_id())
        .bind(entry.generated_id())
        .bind(Json(&entry.superseded_remote_ids))
        .bind(result_content)
        .bind(result_digest)
        .bind(count(entry.retries.request))
        .bind(count(entry.retries.status))
        .bind(count(entry.retries.download))
        .bind(count(entry.retries.verify))
        .bind(count(entry.retries.invoke))
        .bind(entry.attempts.last_requested_at)
        .bind(entry.attempts.last_status_at)
        .bind(entry.attempts.last_download_at)
        .bind(entry.attempts.last_invoke_at)
        .bind(entry.retry_after)
        .bind(entry.last_remote_status.as_deref())
        .bind(entry.has_errors)
        .bind(entry.last_error.as_deref())
        .bind(lease_owner)
        .bind(lease_expires_at)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row)
    }

    async fn stale_or_missing(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        expected_version: i64,
    ) -> Result<StoreError, StoreError> {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT version FROM job_entries WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?;

        Ok(match exists {
            Some(_) => StoreError::Conflict {
                id,
                expected_version,
            },
            None => StoreError::NotFound(id),
        })
    }
}

#[async_trait]
impl EntryStore for PgEntryStore {
    async fn create(&self, entry: NewJobEntry) -> Result<JobEntry, StoreError> {
        let row = sqlx::query_as::<_, EntryRow>(
            r#"
            INSERT INTO job_entries (
                id, kind, region, merchant_id, payload,
                callback_handler, callback_argument, callback_argument_type,
                stage
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'queued')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.kind.as_str())
        .bind(entry.owner.region.as_str())
        .bind(&entry.owner.merchant_id)
        .bind(&entry.payload)
        .bind(&entry.callback.handler)
        .bind(&entry.callback.argument)
        .bind(&entry.callback.argument_type)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobEntry>, StoreError> {
        let row = sqlx::query_as::<_, EntryRow>("SELECT * FROM job_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobEntry::try_from).transpose()
    }

    async fn query(&self, filter: &EntryFilter) -> Result<Vec<JobEntry>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM job_entries WHERE TRUE");

        if let Some(kind) = filter.kind {
            qb.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(owner) = &filter.owner {
            qb.push(" AND region = ").push_bind(owner.region.as_str());
            qb.push(" AND merchant_id = ").push_bind(owner.merchant_id.clone());
        }
        if let Some(stage) = filter.stage {
            qb.push(" AND stage = ").push_bind(stage.as_str());
        }
        qb.push(" ORDER BY seq ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit.clamp(0, 10_000));
        }

        let rows = qb.build_query_as::<EntryRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(JobEntry::try_from).collect()
    }

    async fn save_changes(&self, changes: ChangeSet) -> Result<Vec<JobEntry>, StoreError> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut updated = Vec::with_capacity(changes.len());

        for change in changes.into_changes() {
            match change {
                Change::Update(entry) => match Self::apply_update(&mut tx, &entry).await? {
                    Some(row) => updated.push(JobEntry::try_from(row)?),
                    None => {
                        // tx is dropped => rolled back
                        return Err(Self::stale_or_missing(&mut tx, entry.id, entry.version).await?);
                    }
                },
                Change::Delete { id, version } => {
                    let affected = sqlx::query(
                        "DELETE FROM job_entries WHERE id = $1 AND version = $2",
                    )
                    .bind(id)
                    .bind(version)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

                    if affected == 0 {
                        return Err(Self::stale_or_missing(&mut tx, id, version).await?);
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE job_entries
            SET lease_owner = NULL,
                lease_expires_at = NULL,
                version = version + 1,
                updated_at = now()
            WHERE lease_expires_at IS NOT NULL
              AND lease_expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}
