use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::models::{EntryDetail, EntryListItem};
use crate::jobs::lifecycle::Stage;
use crate::jobs::metrics::{self, Metrics};
use crate::jobs::model::JobKind;
use crate::jobs::store::{EntryFilter, EntryStore, StoreError};
use crate::orchestrator::{Orchestrator, PollReport};

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

impl ApiState {
    fn store(&self) -> &dyn EntryStore {
        self.orchestrator.store().as_ref()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Inspect
        .route("/entries", get(list_entries))
        .route("/entries/:id", get(get_entry))
        // Metrics
        .route("/metrics", get(get_metrics))
        // Drive one tick by hand
        .route("/poll", post(poll_now))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

fn internal_err(e: StoreError) -> (StatusCode, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("internal error: {e}"),
    )
}

fn bad_request(msg: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, msg.into())
}

#[derive(Debug, Deserialize)]
pub struct ListEntriesQuery {
    pub kind: Option<String>,
    pub stage: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListEntriesResponse {
    pub items: Vec<EntryListItem>,
}

pub async fn list_entries(
    State(state): State<ApiState>,
    Query(q): Query<ListEntriesQuery>,
) -> Result<Json<ListEntriesResponse>, (StatusCode, String)> {
    let mut filter = EntryFilter::new()
        .owner(&state.orchestrator.options().owner)
        .limit(q.limit.unwrap_or(100).clamp(1, 1000));

    if let Some(raw) = q.kind.as_deref() {
        let kind = JobKind::parse(raw).ok_or_else(|| bad_request(format!("unknown kind {raw}")))?;
        filter = filter.kind(kind);
    }
    if let Some(raw) = q.stage.as_deref() {
        let stage = Stage::parse(raw)
            .filter(|s| Stage::PERSISTED.contains(s))
            .ok_or_else(|| bad_request(format!("unknown stage {raw}")))?;
        filter = filter.stage(stage);
    }

    let entries = state.store().query(&filter).await.map_err(internal_err)?;
    Ok(Json(ListEntriesResponse {
        items: entries.iter().map(EntryListItem::from).collect(),
    }))
}

pub async fn get_entry(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EntryDetail>, (StatusCode, String)> {
    match state.store().get(id).await.map_err(internal_err)? {
        Some(entry) => Ok(Json(EntryDetail::from(&entry))),
        None => Err((StatusCode::NOT_FOUND, format!("entry {id} not found"))),
    }
}

pub async fn get_metrics(
    State(state): State<ApiState>,
) -> Result<Json<Metrics>, (StatusCode, String)> {
    let owner = state.orchestrator.options().owner.clone();
    let snapshot = metrics::snapshot(state.store(), Some(&owner))
        .await
        .map_err(internal_err)?;
    Ok(Json(snapshot))
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report: PollReport,
}

pub async fn poll_now(State(state): State<ApiState>) -> Json<PollResponse> {
    let started_at = Utc::now();
    let report = state.orchestrator.poll().await;
    Json(PollResponse {
        started_at,
        finished_at: Utc::now(),
        report,
    })
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
