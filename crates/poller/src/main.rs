use std::sync::Arc;

use mwsflow::api;
use mwsflow::config;
use mwsflow::db;
use mwsflow::jobs::{EntryStore, PgEntryStore};
use mwsflow::logging;
use mwsflow::{Orchestrator, PollReport, UnconfiguredRemote};

mod handlers;
use handlers::build_registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    logging::init(cfg.log_json);

    let api_addr = cfg.admin_addr.clone();
    tracing::info!(
        instance_id = %cfg.instance_id,
        region = cfg.owner.region.as_str(),
        merchant_id = %cfg.owner.merchant_id,
        poll_interval_secs = cfg.poll_interval.as_secs(),
        lease_seconds = cfg.lease_seconds,
        digest = cfg.digest.as_str(),
        api = api_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        "mwsflow poller starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store: Arc<dyn EntryStore> = Arc::new(PgEntryStore::new(pool.clone()));
    let registry = build_registry();
    tracing::info!(handlers = ?registry.names(), "callback handlers registered");

    // no vendor client is bundled; every remote call fails until one is wired in
    let remote = Arc::new(UnconfiguredRemote);
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        remote,
        registry,
        cfg.orchestrator_options(),
    ));

    // ---- API task ----
    let app = api::router(api::ApiState {
        orchestrator: orchestrator.clone(),
    });
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("admin api listening on http://{addr}");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Poll loop task ----
    let poll_interval = cfg.poll_interval;
    let poll_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            // reclaim entries held by instances that died mid-stage
            match store.release_expired_leases(chrono::Utc::now()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(released = n, "released expired leases"),
                Err(e) => tracing::error!(error = %e, "lease reaping failed"),
            }

            let report = orchestrator.poll().await;
            log_report(&report);
        }
    });

    tokio::select! {
        res = api_handle => res??,
        res = poll_handle => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    Ok(())
}

fn log_report(report: &PollReport) {
    for (kind, r) in [("report", &report.reports), ("feed", &report.feeds)] {
        let quiet = r.submitted + r.submit_failures + r.statuses_checked + r.downloaded
            + r.download_failures
            + r.verify_failures
            + r.delivered
            + r.delivery_failures
            + r.purged
            + r.stage_errors
            + r.lost_writes
            == 0;
        if quiet {
            continue;
        }
        tracing::info!(
            kind,
            purged = r.purged,
            submitted = r.submitted,
            submit_failures = r.submit_failures,
            statuses_checked = r.statuses_checked,
            became_ready = r.became_ready,
            cancelled = r.cancelled,
            downloaded = r.downloaded,
            verify_failures = r.verify_failures,
            delivered = r.delivered,
            delivery_failures = r.delivery_failures,
            stage_errors = r.stage_errors,
            lost_writes = r.lost_writes,
            "poll finished"
        );
    }
}
