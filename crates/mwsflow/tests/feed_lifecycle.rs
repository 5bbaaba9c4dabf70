// tests/feed_lifecycle.rs
mod common;

use common::{harness, harness_with, test_options, FakeRemote, Tag, FEED_TYPE};

use mwsflow::jobs::{FeedSubmissionParams, JobKind, RetryPolicy, Stage};

const FEED_BODY: &str = "sku\tprice\nA-1\t9.99\n";

async fn queue_feed(h: &common::Harness) -> uuid::Uuid {
    h.orchestrator
        .queue_feed(
            FeedSubmissionParams::new(FEED_TYPE, FEED_BODY),
            "record",
            &Tag::new("prices"),
        )
        .await
        .expect("enqueue failed")
}

#[tokio::test]
async fn feed_is_submitted_verified_and_delivered() {
    let h = harness();
    let id = queue_feed(&h).await;

    let first = h.orchestrator.poll().await;
    assert_eq!(first.feeds.submitted, 1);
    assert_eq!(first.reports, Default::default());
    assert_eq!(h.entry(id).await.unwrap().remote_id(), Some("sub-1"));

    h.remote.complete("sub-1", None);
    let second = h.orchestrator.poll().await;
    assert_eq!(second.feeds.became_ready, 1);
    assert_eq!(second.feeds.downloaded, 1);
    assert_eq!(second.feeds.delivered, 1);

    // the processing report is fetched by the submission id itself
    assert_eq!(h.remote.downloads(), vec!["sub-1".to_string()]);
    let calls = h.recorder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, JobKind::Feed);
    assert_eq!(calls[0].remote_id, "sub-1");
    assert_eq!(calls[0].content, FakeRemote::content_for("sub-1"));
    assert!(h.entry(id).await.is_none());
}

#[tokio::test]
async fn digest_mismatch_skips_callback_and_downloads_again() {
    let h = harness();
    let id = queue_feed(&h).await;
    h.orchestrator.poll().await;
    h.remote.complete("sub-1", None);
    h.remote.override_digest("sub-1", Some("bm90IHRoZSByaWdodCBkaWdlc3Q="));

    let report = h.orchestrator.poll().await;
    assert_eq!(report.feeds.verify_failures, 1);
    assert_eq!(report.feeds.delivered, 0);

    let e = h.entry(id).await.unwrap();
    assert_eq!(e.stage(), Stage::ReadyForDownload);
    assert_eq!(e.retries.verify, 1);
    assert_eq!(e.retries.download, 0);
    assert!(e.last_error.as_deref().unwrap_or("").contains("mismatch"));
    assert_eq!(h.recorder.count(), 0);

    h.remote.clear_digest_override("sub-1");
    h.orchestrator.poll().await;
    assert_eq!(h.remote.download_count(), 2);
    assert_eq!(h.recorder.count(), 1);
    assert!(h.entry(id).await.is_none());
}

#[tokio::test]
async fn missing_digest_fails_feed_verification() {
    let h = harness();
    let id = queue_feed(&h).await;
    h.orchestrator.poll().await;
    h.remote.complete("sub-1", None);
    h.remote.override_digest("sub-1", None);

    h.orchestrator.poll().await;
    let e = h.entry(id).await.unwrap();
    assert_eq!(e.stage(), Stage::ReadyForDownload);
    assert_eq!(e.retries.verify, 1);
    assert_eq!(h.recorder.count(), 0);
}

#[tokio::test]
async fn hex_digest_is_accepted() {
    let h = harness();
    let id = queue_feed(&h).await;
    h.orchestrator.poll().await;
    h.remote.complete("sub-1", None);

    let content = FakeRemote::content_for("sub-1");
    let b64 = mwsflow::jobs::verify::compute_digest(Default::default(), &content);
    let raw = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64).unwrap();
    h.remote.override_digest("sub-1", Some(&hex::encode_upper(raw)));

    h.orchestrator.poll().await;
    assert_eq!(h.recorder.count(), 1);
    assert!(h.entry(id).await.is_none());
}

#[tokio::test]
async fn repeated_mismatch_purges_the_feed() {
    let h = harness_with(test_options().retry(RetryPolicy {
        max_verify_retries: 2,
        ..test_options().retry
    }));
    let id = queue_feed(&h).await;
    h.orchestrator.poll().await;
    h.remote.complete("sub-1", None);
    h.remote.override_digest("sub-1", Some("AAAA"));

    h.poll_times(3).await;
    assert_eq!(h.entry(id).await.unwrap().retries.verify, 3);

    let report = h.orchestrator.poll().await;
    assert_eq!(report.feeds.purged, 1);
    assert!(h.entry(id).await.is_none());
    assert_eq!(h.recorder.count(), 0);
    assert_eq!(h.remote.download_count(), 3);
}

#[tokio::test]
async fn feed_enqueue_validates_content() {
    let h = harness();
    let err = h
        .orchestrator
        .queue_feed(FeedSubmissionParams::new(FEED_TYPE, ""), "record", &Tag::new("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, mwsflow::EnqueueError::InvalidParams(_)));
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn reports_and_feeds_progress_in_the_same_poll() {
    let h = harness();
    let report_id = h
        .orchestrator
        .queue_report(
            mwsflow::jobs::ReportRequestParams::new(common::REPORT_TYPE),
            "record",
            &Tag::new("orders"),
        )
        .await
        .unwrap();
    let feed_id = queue_feed(&h).await;

    let report = h.orchestrator.poll().await;
    assert_eq!(report.reports.submitted, 1);
    assert_eq!(report.feeds.submitted, 1);
    assert_eq!(h.entry(report_id).await.unwrap().remote_id(), Some("req-1"));
    assert_eq!(h.entry(feed_id).await.unwrap().remote_id(), Some("sub-2"));
}
