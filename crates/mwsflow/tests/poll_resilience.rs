// tests/poll_resilience.rs
mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::{registry_with, test_options, FakeRemote, Recorder, Tag, FEED_TYPE, REPORT_TYPE};
use serde_json::Value;

use mwsflow::jobs::{
    DownloadedResult, EntryStore, FeedSubmissionParams, InMemoryEntryStore, JobKind, Owner,
    ReportRequestParams, Stage,
};
use mwsflow::{CallbackRegistry, Delivery, Orchestrator, RemoteJobService, RemoteStatus};

/// Releases every lease in the store while a submit is in flight, which
/// bumps the entry's version behind the submitting tick.
struct ReapingRemote {
    inner: Arc<FakeRemote>,
    store: Arc<InMemoryEntryStore>,
}

#[async_trait]
impl RemoteJobService for ReapingRemote {
    async fn submit(
        &self,
        kind: JobKind,
        owner: &Owner,
        payload: &Value,
    ) -> anyhow::Result<Option<String>> {
        self.store
            .release_expired_leases(Utc::now() + Duration::days(1))
            .await?;
        self.inner.submit(kind, owner, payload).await
    }

    async fn query_status(
        &self,
        kind: JobKind,
        owner: &Owner,
        remote_ids: &[String],
    ) -> anyhow::Result<Vec<RemoteStatus>> {
        self.inner.query_status(kind, owner, remote_ids).await
    }

    async fn download(
        &self,
        kind: JobKind,
        owner: &Owner,
        id: &str,
    ) -> anyhow::Result<DownloadedResult> {
        self.inner.download(kind, owner, id).await
    }
}

/// Panics on report submissions; feeds go through.
struct PanickingReports {
    inner: Arc<FakeRemote>,
}

#[async_trait]
impl RemoteJobService for PanickingReports {
    async fn submit(
        &self,
        kind: JobKind,
        owner: &Owner,
        payload: &Value,
    ) -> anyhow::Result<Option<String>> {
        if kind == JobKind::Report {
            panic!("report client blew up");
        }
        self.inner.submit(kind, owner, payload).await
    }

    async fn query_status(
        &self,
        kind: JobKind,
        owner: &Owner,
        remote_ids: &[String],
    ) -> anyhow::Result<Vec<RemoteStatus>> {
        self.inner.query_status(kind, owner, remote_ids).await
    }

    async fn download(
        &self,
        kind: JobKind,
        owner: &Owner,
        id: &str,
    ) -> anyhow::Result<DownloadedResult> {
        self.inner.download(kind, owner, id).await
    }
}

fn orchestrator_over(
    store: &Arc<InMemoryEntryStore>,
    remote: Arc<dyn RemoteJobService>,
    registry: CallbackRegistry,
) -> Orchestrator {
    Orchestrator::new(store.clone(), remote, registry, test_options())
}

#[tokio::test]
async fn rejected_write_after_submit_is_reported_as_lost() {
    let store = Arc::new(InMemoryEntryStore::new());
    let fake = Arc::new(FakeRemote::default());
    let remote = Arc::new(ReapingRemote {
        inner: fake.clone(),
        store: store.clone(),
    });
    let orchestrator = orchestrator_over(&store, remote, registry_with(&Recorder::default()));

    let id = orchestrator
        .queue_report(ReportRequestParams::new(REPORT_TYPE), "record", &Tag::new("r"))
        .await
        .unwrap();

    let report = orchestrator.poll().await;

    assert_eq!(report.reports.submitted, 0);
    assert_eq!(report.reports.lost_writes, 1);
    assert_eq!(report.reports.stage_errors, 0);
    assert_eq!(fake.submit_count(), 1);

    let e = store.get(id).await.unwrap().unwrap();
    assert_eq!(e.stage(), Stage::Queued);
    assert_eq!(e.remote_id(), None);
}

#[tokio::test]
async fn panicking_report_pass_does_not_stop_feeds() {
    let store = Arc::new(InMemoryEntryStore::new());
    let fake = Arc::new(FakeRemote::default());
    let remote = Arc::new(PanickingReports {
        inner: fake.clone(),
    });
    let orchestrator = orchestrator_over(&store, remote, registry_with(&Recorder::default()));

    orchestrator
        .queue_report(ReportRequestParams::new(REPORT_TYPE), "record", &Tag::new("r"))
        .await
        .unwrap();
    let feed = orchestrator
        .queue_feed(
            FeedSubmissionParams::new(FEED_TYPE, "<feed/>"),
            "record",
            &Tag::new("f"),
        )
        .await
        .unwrap();

    let report = orchestrator.poll().await;

    assert_eq!(report.reports.stage_errors, 1);
    assert_eq!(report.reports.submitted, 0);
    assert_eq!(report.feeds.submitted, 1);
    assert_eq!(report.feeds.stage_errors, 0);
    assert_eq!(
        store.get(feed).await.unwrap().unwrap().stage(),
        Stage::AwaitingRemote
    );
}

#[tokio::test]
async fn delivered_entry_is_retired_even_if_touched_during_the_callback() {
    let store = Arc::new(InMemoryEntryStore::new());
    let fake = Arc::new(FakeRemote::default());
    let recorder = Recorder::default();

    // the handler rewrites its own entry, so the delete sees a newer version
    let mut registry = registry_with(&recorder);
    let touched = store.clone();
    registry.register("touch_then_record", move |d: Delivery, _tag: Tag| {
        let store = touched.clone();
        async move {
            if let Some(entry) = store.get(d.entry_id).await? {
                store.update(entry).await?;
            }
            Ok(())
        }
    });
    let orchestrator = orchestrator_over(&store, fake.clone(), registry);

    let id = orchestrator
        .queue_report(
            ReportRequestParams::new(REPORT_TYPE),
            "touch_then_record",
            &Tag::new("r"),
        )
        .await
        .unwrap();
    orchestrator.poll().await;
    fake.complete("req-1", Some("gen-1"));

    let report = orchestrator.poll().await;
    assert_eq!(report.reports.delivered, 1);
    assert_eq!(report.reports.lost_writes, 0);
    assert!(store.get(id).await.unwrap().is_none());

    let replay = orchestrator.poll().await;
    assert_eq!(replay.reports.delivered, 0);
}
