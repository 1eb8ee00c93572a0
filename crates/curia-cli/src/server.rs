//! HTTP API of one agency node.
//!
//! Exposes the private election endpoints (`requestVote`, `notifyAll`) and
//! the public write/read/dump surface. Writes are leader-only: followers
//! answer 503 and name the leader they currently believe in.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use curia_agency::constituent::{
    Constituent, NotifyAllBody, VoteRequest, NOTIFY_ALL_PATH, REQUEST_VOTE_PATH,
};
use curia_agency::metrics::MetricsRegistry;
use curia_agency::replicator::{Replicator, ReplicatorError};
use curia_agency::store::Store;
use curia_core::AgentId;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::warn;

/// Application state shared across handlers.
pub struct AppState {
    pub store: Arc<Store>,
    pub constituent: Arc<Constituent>,
    pub replicator: Arc<dyn Replicator>,
    pub metrics: Arc<MetricsRegistry>,
    /// Server start time for uptime reporting.
    pub start_time: Instant,
}

/// Builds the node's router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(REQUEST_VOTE_PATH, get(request_vote))
        .route(NOTIFY_ALL_PATH, post(notify_all))
        .route("/_api/agency/write", post(write))
        .route("/_api/agency/read", post(read))
        .route("/_api/agency/dump", get(dump))
        .route("/_api/agency/config", get(config))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET `/_api/agency_priv/requestVote?term=T&candidateId=C&...`
async fn request_vote(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    match VoteRequest::from_params(&params) {
        Some(request) => {
            let response = state.constituent.vote(request).await;
            (StatusCode::OK, Json(json!(response)))
        }
        None => {
            warn!("malformed vote solicitation");
            (StatusCode::BAD_REQUEST, Json(json!({"error": "malformed vote request"})))
        }
    }
}

/// POST `/_api/agency_priv/notifyAll?term=T&agencyId=C`
async fn notify_all(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<NotifyAllBody>,
) -> impl IntoResponse {
    let term = params.get("term").and_then(|t| t.parse().ok()).unwrap_or(0);
    let agency_id = params
        .get("agencyId")
        .and_then(|i| i.parse().ok())
        .map(AgentId::new)
        .unwrap_or(AgentId::new(0));
    state.constituent.handle_notify(term, agency_id, body);
    Json(json!({}))
}

/// POST `/_api/agency/write` - a transaction envelope, leader-only.
async fn write(State(state): State<Arc<AppState>>, Json(envelope): Json<Value>) -> impl IntoResponse {
    if !state.constituent.is_leader() {
        let leader = state.constituent.leader_id();
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "not the leader",
                "leaderId": leader,
            })),
        );
    }
    match state.replicator.write(&envelope).await {
        Ok(results) => (StatusCode::OK, Json(json!({ "results": results }))),
        Err(ReplicatorError::NotLeader) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "not the leader",
                "leaderId": state.constituent.leader_id(),
            })),
        ),
        Err(e) => {
            warn!(error = %e, "write submission failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))
        }
    }
}

/// POST `/_api/agency/read` - an array of arrays of paths.
async fn read(State(state): State<Arc<AppState>>, Json(queries): Json<Value>) -> impl IntoResponse {
    let (success, result) = state.store.read(&queries);
    Json(json!({ "success": success, "result": result }))
}

/// GET `/_api/agency/dump` - tree plus time table, for diagnostics.
async fn dump(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut dump = state.store.dump();
    if let Some(map) = dump.as_object_mut() {
        map.insert(
            "uptime_secs".to_string(),
            json!(state.start_time.elapsed().as_secs()),
        );
    }
    Json(dump)
}

/// GET `/_api/agency/config` - node identity and role.
async fn config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.constituent.status();
    Json(json!({
        "configuration": {
            "id": status.id,
            "size": status.size,
            "endpoints": state.constituent.endpoints(),
        },
        "role": status.role,
        "term": status.term,
        "leaderId": status.leader_id,
    }))
}

/// GET `/metrics` - Prometheus text export (empty without the feature).
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.export() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
