#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mwsflow::jobs::{
    BackoffConfig, DigestAlgorithm, DownloadedResult, EntryFilter, EntryStore,
    InMemoryEntryStore, JobEntry, JobKind, Owner, Region, RetryPolicy,
};
use mwsflow::{
    CallbackRegistry, Delivery, Orchestrator, OrchestratorOptions, ProcessingStatus,
    RemoteJobService, RemoteStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

pub const REPORT_TYPE: &str = "_GET_FLAT_FILE_ORDERS_DATA_";
pub const FEED_TYPE: &str = "_POST_PRODUCT_DATA_";

pub fn owner() -> Owner {
    Owner::new(Region::Europe, "A2TESTMERCHANT")
}

/// No backoff so every tick retries.
pub fn test_options() -> OrchestratorOptions {
    OrchestratorOptions::new(owner())
        .instance_id("test-instance")
        .retry(RetryPolicy {
            backoff: BackoffConfig::immediate(),
            ..RetryPolicy::default()
        })
}

// ---------------------------------------------------------------------------
// scripted remote

#[derive(Default)]
struct RemoteState {
    next_id: u32,
    scripted_submits: VecDeque<Option<String>>,
    fail_submits: bool,
    fail_status: bool,
    fail_downloads: bool,
    statuses: HashMap<String, RemoteStatus>,
    hidden: HashSet<String>,
    digest_overrides: HashMap<String, Option<String>>,
    latency: Option<Duration>,

    submits: Vec<(JobKind, Value)>,
    status_calls: Vec<Vec<String>>,
    downloads: Vec<String>,
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    pub fn content_for(id: &str) -> Vec<u8> {
        format!("content-of-{id}").into_bytes()
    }

    /// Next submit returns exactly this instead of a fresh id.
    pub fn script_submit(&self, id: Option<&str>) {
        self.state
            .lock()
            .unwrap()
            .scripted_submits
            .push_back(id.map(str::to_string));
    }

    pub fn fail_submits(&self, on: bool) {
        self.state.lock().unwrap().fail_submits = on;
    }

    pub fn fail_status(&self, on: bool) {
        self.state.lock().unwrap().fail_status = on;
    }

    pub fn fail_downloads(&self, on: bool) {
        self.state.lock().unwrap().fail_downloads = on;
    }

    pub fn complete(&self, remote_id: &str, generated_id: Option<&str>) {
        let mut status = RemoteStatus::new(remote_id, ProcessingStatus::Done);
        if let Some(g) = generated_id {
            status = status.with_generated_id(g);
        }
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(remote_id.to_string(), status);
    }

    pub fn cancel(&self, remote_id: &str) {
        self.state.lock().unwrap().statuses.insert(
            remote_id.to_string(),
            RemoteStatus::new(remote_id, ProcessingStatus::Cancelled),
        );
    }

    /// Leave `remote_id` out of status responses.
    pub fn hide(&self, remote_id: &str) {
        self.state
            .lock()
            .unwrap()
            .hidden
            .insert(remote_id.to_string());
    }

    pub fn override_digest(&self, download_id: &str, digest: Option<&str>) {
        self.state
            .lock()
            .unwrap()
            .digest_overrides
            .insert(download_id.to_string(), digest.map(str::to_string));
    }

    pub fn clear_digest_override(&self, download_id: &str) {
        self.state
            .lock()
            .unwrap()
            .digest_overrides
            .remove(download_id);
    }

    /// Every call sleeps this long before answering.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }

    async fn respond_after_latency(&self) {
        let latency = self.state.lock().unwrap().latency;
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }

    pub fn submit_count(&self) -> usize {
        self.state.lock().unwrap().submits.len()
    }

    pub fn status_call_count(&self) -> usize {
        self.state.lock().unwrap().status_calls.len()
    }

    pub fn download_count(&self) -> usize {
        self.state.lock().unwrap().downloads.len()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.state.lock().unwrap().downloads.clone()
    }
}

#[async_trait]
impl RemoteJobService for FakeRemote {
    async fn submit(
        &self,
        kind: JobKind,
        _owner: &Owner,
        payload: &Value,
    ) -> anyhow::Result<Option<String>> {
        self.respond_after_latency().await;
        let mut s = self.state.lock().unwrap();
        s.submits.push((kind, payload.clone()));
        if s.fail_submits {
            anyhow::bail!("throttled");
        }
        if let Some(scripted) = s.scripted_submits.pop_front() {
            return Ok(scripted);
        }

        s.next_id += 1;
        let prefix = match kind {
            JobKind::Report => "req",
            JobKind::Feed => "sub",
        };
        let id = format!("{prefix}-{}", s.next_id);
        s.statuses.insert(
            id.clone(),
            RemoteStatus::new(id.clone(), ProcessingStatus::Submitted),
        );
        Ok(Some(id))
    }

    async fn query_status(
        &self,
        _kind: JobKind,
        _owner: &Owner,
        remote_ids: &[String],
    ) -> anyhow::Result<Vec<RemoteStatus>> {
        self.respond_after_latency().await;
        let mut s = self.state.lock().unwrap();
        s.status_calls.push(remote_ids.to_vec());
        if s.fail_status {
            anyhow::bail!("status endpoint unavailable");
        }
        Ok(remote_ids
            .iter()
            .filter(|id| !s.hidden.contains(*id))
            .filter_map(|id| s.statuses.get(id).cloned())
            .collect())
    }

    async fn download(
        &self,
        _kind: JobKind,
        _owner: &Owner,
        id: &str,
    ) -> anyhow::Result<DownloadedResult> {
        self.respond_after_latency().await;
        let mut s = self.state.lock().unwrap();
        s.downloads.push(id.to_string());
        if s.fail_downloads {
            anyhow::bail!("connection reset");
        }
        let content = Self::content_for(id);
        let digest = match s.digest_overrides.get(id) {
            Some(d) => d.clone(),
            None => Some(mwsflow::jobs::verify::compute_digest(
                DigestAlgorithm::Md5,
                &content,
            )),
        };
        Ok(DownloadedResult { content, digest })
    }
}

// ---------------------------------------------------------------------------
// recording handler

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub label: String,
}

impl Tag {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delivered {
    pub entry_id: Uuid,
    pub kind: JobKind,
    pub remote_id: String,
    pub content: Vec<u8>,
    pub tag: Tag,
}

#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Delivered>>>,
    failures_left: Arc<AtomicUsize>,
    delay_ms: Arc<AtomicU64>,
}

impl Recorder {
    /// The next `n` invocations fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Each invocation sleeps this long before recording.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn pause(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    pub fn calls(&self) -> Vec<Delivered> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, d: Delivery, tag: Tag) -> anyhow::Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("scripted handler failure");
        }
        self.calls.lock().unwrap().push(Delivered {
            entry_id: d.entry_id,
            kind: d.kind,
            remote_id: d.remote_id,
            content: d.content,
            tag,
        });
        Ok(())
    }
}

pub fn registry_with(recorder: &Recorder) -> CallbackRegistry {
    let mut registry = CallbackRegistry::new();
    let rec = recorder.clone();
    registry.register("record", move |d: Delivery, tag: Tag| {
        let rec = rec.clone();
        async move {
            rec.pause().await;
            rec.record(d, tag)
        }
    });
    registry
}

// ---------------------------------------------------------------------------
// harness

pub struct Harness {
    pub store: Arc<InMemoryEntryStore>,
    pub remote: Arc<FakeRemote>,
    pub recorder: Recorder,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn harness() -> Harness {
    harness_with(test_options())
}

pub fn harness_with(options: OrchestratorOptions) -> Harness {
    let store = Arc::new(InMemoryEntryStore::new());
    let remote = Arc::new(FakeRemote::default());
    let recorder = Recorder::default();
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        remote.clone(),
        registry_with(&recorder),
        options,
    ));
    Harness {
        store,
        remote,
        recorder,
        orchestrator,
    }
}

impl Harness {
    pub async fn entries(&self) -> Vec<JobEntry> {
        self.store.query(&EntryFilter::new()).await.unwrap()
    }

    pub async fn entry(&self, id: Uuid) -> Option<JobEntry> {
        self.store.get(id).await.unwrap()
    }

    pub async fn poll_times(&self, n: usize) {
        for _ in 0..n {
            self.orchestrator.poll().await;
        }
    }
}

// ---------------------------------------------------------------------------
// postgres

/// `None` when TEST_DATABASE_URL is not set, so the caller can skip.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE job_entries RESTART IDENTITY")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}
