//! Dashboard HTTP surface.
//!
//! Thin REST layer over the orchestrator plus a WebSocket live feed. Handlers
//! never mutate state themselves; every write goes through an orchestrator
//! control action and surfaces on the bus as a delta.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::adapters::agent::HttpAgentClient;
use crate::adapters::issues::GitHubIssueSource;
use crate::config::Settings;
use crate::errors::{AdapterError, OrchestratorError};
use crate::orchestrator::Orchestrator;
use crate::poller::Poller;
use crate::session::{IssueRef, Phase, SessionId, SessionRecord};
use crate::table::SessionFilter;
use crate::ws;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Tracker label stamped into issue refs created via the API.
    pub tracker: String,
}

pub type SharedState = Arc<AppState>;

// ── Request/response types ────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct SessionsQuery {
    pub issue: Option<i64>,
    pub phase: Option<Phase>,
    pub state: Option<String>,
    #[serde(default)]
    pub active: bool,
}

#[derive(Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionRecord>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound(_) => ApiError::NotFound(err.to_string()),
            OrchestratorError::DuplicateActiveSession { .. }
            | OrchestratorError::InvalidChain { .. } => ApiError::Conflict(err.to_string()),
            OrchestratorError::Adapter(AdapterError::Fatal { .. })
            | OrchestratorError::Adapter(AdapterError::Transient { .. }) => {
                ApiError::Upstream(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/issues", get(list_issues))
        .route("/api/issues/{number}/triage", post(start_triage))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/execute", post(start_execute))
        .route("/api/sessions/{id}/verify", post(start_verify))
        .route("/api/sessions/{id}/cancel", post(cancel_session))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn list_issues(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let issues = state
        .orchestrator
        .issues()
        .list_issues()
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    Ok(Json(issues).into_response())
}

async fn list_sessions(
    State(state): State<SharedState>,
    Query(query): Query<SessionsQuery>,
) -> Json<SessionListResponse> {
    let filter = SessionFilter {
        issue_ref: query
            .issue
            .map(|n| IssueRef::new(state.tracker.clone(), n)),
        phase: query.phase,
        state: query.state,
        active_only: query.active,
    };
    Json(SessionListResponse {
        sessions: state.orchestrator.list(&filter),
    })
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionRecord>, ApiError> {
    Ok(Json(state.orchestrator.get(id)?))
}

async fn start_triage(
    State(state): State<SharedState>,
    Path(number): Path<i64>,
) -> Result<(StatusCode, Json<SessionRecord>), ApiError> {
    if number <= 0 {
        return Err(ApiError::BadRequest(format!("invalid issue number {number}")));
    }
    let issue = IssueRef::new(state.tracker.clone(), number);
    let record = state.orchestrator.start_triage(issue).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn start_execute(
    State(state): State<SharedState>,
    Path(id): Path<SessionId>,
) -> Result<(StatusCode, Json<SessionRecord>), ApiError> {
    let record = state.orchestrator.start_execute(id).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn start_verify(
    State(state): State<SharedState>,
    Path(id): Path<SessionId>,
) -> Result<(StatusCode, Json<SessionRecord>), ApiError> {
    let record = state.orchestrator.start_verify(id).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn cancel_session(
    State(state): State<SharedState>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionRecord>, ApiError> {
    Ok(Json(state.orchestrator.cancel(id).await?))
}

// ── Startup ───────────────────────────────────────────────────────────

/// Wire the adapters, orchestrator, and poller, then serve until Ctrl+C.
pub async fn start_server(settings: Settings) -> Result<()> {
    let agent = Arc::new(HttpAgentClient::new(
        &settings.agent_base_url,
        &settings.agent_api_key,
        settings.conductor.poll_timeout,
    ));
    let issues = Arc::new(GitHubIssueSource::new(
        &settings.github_owner,
        &settings.github_repo,
        &settings.github_token,
    ));
    let tracker = issues.tracker();
    let orchestrator = Orchestrator::new(agent, issues, settings.conductor.clone());

    let shutdown = CancellationToken::new();
    let poller = Poller::new(Arc::clone(&orchestrator));
    let poller_shutdown = shutdown.clone();
    let poller_task = tokio::spawn(async move { poller.run(poller_shutdown).await });

    let state = Arc::new(AppState {
        orchestrator,
        tracker,
    });
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(addr = %listener.local_addr()?, "conductor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = poller_task.await;
    info!("conductor shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to install Ctrl+C handler");
    }
}
