use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::jobs::lifecycle::Stage;
use crate::jobs::model::{JobKind, Owner};
use crate::jobs::store::{EntryFilter, EntryStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindMetrics {
    /// Keyed by stage name; every persisted stage is present.
    pub by_stage: BTreeMap<&'static str, u64>,
    pub total: u64,
    pub with_errors: u64,
    pub leased: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub at: DateTime<Utc>,
    pub reports: KindMetrics,
    pub feeds: KindMetrics,
}

/// Point-in-time entry counts by kind and stage.
pub async fn snapshot(store: &dyn EntryStore, owner: Option<&Owner>) -> Result<Metrics, StoreError> {
    let at = Utc::now();
    let mut reports = empty();
    let mut feeds = empty();

    let mut filter = EntryFilter::new();
    if let Some(owner) = owner {
        filter = filter.owner(owner);
    }

    for entry in store.query(&filter).await? {
        let m = match entry.kind {
            JobKind::Report => &mut reports,
            JobKind::Feed => &mut feeds,
        };
        *m.by_stage.entry(entry.stage().as_str()).or_default() += 1;
        m.total += 1;
        if entry.has_errors {
            m.with_errors += 1;
        }
        if entry.lease.as_ref().is_some_and(|l| l.expires_at > at) {
            m.leased += 1;
        }
    }

    Ok(Metrics { at, reports, feeds })
}

fn empty() -> KindMetrics {
    KindMetrics {
        by_stage: Stage::PERSISTED.iter().map(|s| (s.as_str(), 0)).collect(),
        ..KindMetrics::default()
    }
}
