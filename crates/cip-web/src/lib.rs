//! JSON run monitor and batch controls over axum.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cip_core::{BatchRun, QueueCounts, QueueItem, QueueStatus};
use cip_storage::StoreError;
use cip_sync::{BatchSettings, ImportServices, OrchestratorError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "cip-web";

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub services: ImportServices,
}

impl AppState {
    pub fn new(services: ImportServices) -> Self {
        Self { services }
    }
}

#[derive(Debug, Serialize)]
struct RunView {
    active: bool,
    run: BatchRun,
}

#[derive(Debug, Serialize)]
struct QueueSummary {
    total: u64,
    counts: QueueCounts,
}

#[derive(Debug, Default, Deserialize)]
struct ItemsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartRequest {
    batch_size: Option<usize>,
    cooldown_secs: Option<u64>,
    max_retries: Option<i32>,
}

impl StartRequest {
    fn apply(&self, defaults: BatchSettings) -> BatchSettings {
        BatchSettings {
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            cooldown: self
                .cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/run", get(run_handler))
        .route("/api/run/start", post(start_handler))
        .route("/api/run/stop", post(stop_handler))
        .route("/api/queue/summary", get(summary_handler))
        .route("/api/queue/items", get(items_handler))
        .route("/api/queue/failures", get(failures_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(services: ImportServices, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "run monitor listening");
    axum::serve(listener, app(AppState::new(services))).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    let orchestrator = &state.services.orchestrator;
    match orchestrator.status().await {
        Ok(run) => Json(RunView {
            active: orchestrator.is_active(),
            run,
        })
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn start_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        match serde_json::from_slice::<StartRequest>(&body) {
            Ok(request) => request,
            Err(err) => return client_error(StatusCode::BAD_REQUEST, format!("invalid body: {err}")),
        }
    };

    let settings = request.apply(state.services.settings);
    match state.services.orchestrator.start(settings).await {
        Ok(run) => (StatusCode::ACCEPTED, Json(run)).into_response(),
        Err(OrchestratorError::AlreadyRunning) => {
            client_error(StatusCode::CONFLICT, "a batch run is already running".to_string())
        }
        Err(OrchestratorError::InvalidSettings(msg)) => client_error(StatusCode::BAD_REQUEST, msg),
        Err(err) => {
            error!(error = %err, "failed to start batch run");
            server_error(err.to_string())
        }
    }
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Response {
    let stopping = state.services.orchestrator.stop();
    Json(serde_json::json!({ "stopping": stopping })).into_response()
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.services.monitor.status_counts().await {
        Ok(counts) => Json(QueueSummary {
            total: counts.total(),
            counts,
        })
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn items_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ItemsQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::parse::<QueueStatus>).transpose() {
        Ok(status) => status,
        Err(err) => return client_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    match state
        .services
        .monitor
        .list_items(status, clamp_limit(query.limit))
        .await
    {
        Ok(items) => Json::<Vec<QueueItem>>(items).into_response(),
        Err(err) => store_error(err),
    }
}

async fn failures_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ItemsQuery>,
) -> Response {
    match state
        .services
        .monitor
        .recent_failures(clamp_limit(query.limit))
        .await
    {
        Ok(items) => Json(items).into_response(),
        Err(err) => store_error(err),
    }
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

fn client_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(message: String) -> Response {
    client_error(StatusCode::INTERNAL_SERVER_ERROR, message)
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "store query failed");
    server_error("store unavailable".to_string())
}
