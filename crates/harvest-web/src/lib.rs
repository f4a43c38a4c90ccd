//! Axum HTTP surface: health, job status and the manual crawl trigger.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use harvest_core::CrawlJob;
use harvest_sync::{CrawlError, CrawlService, RunSummary, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CrawlService>,
}

impl AppState {
    pub fn new(service: Arc<CrawlService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CrawlRequest {
    #[serde(default)]
    sources: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CrawlResponse {
    job_id: Uuid,
    events: usize,
    summary: RunSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceRow {
    name: String,
    base_url: String,
    enabled: bool,
    schedule: String,
    pages: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sources", get(sources_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/{id}", get(job_detail_handler))
        .route("/crawl", post(crawl_handler))
        .with_state(Arc::new(state))
}

/// Binds `HARVEST_WEB_PORT` (default 8000) and serves until the listener fails.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("HARVEST_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let service = Arc::new(CrawlService::from_config(&config)?);
    serve(AppState::new(service), port).await
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "running": state.service.run_lock().is_running(),
    }))
    .into_response()
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    let rows: Vec<SourceRow> = state
        .service
        .registry()
        .sources
        .iter()
        .map(|s| SourceRow {
            name: s.name.clone(),
            base_url: s.base_url.clone(),
            enabled: s.enabled,
            schedule: s.schedule.to_string(),
            pages: s.event_urls.len(),
        })
        .collect();
    Json(rows).into_response()
}

async fn jobs_handler(State(state): State<Arc<AppState>>) -> Json<Vec<CrawlJob>> {
    Json(state.service.jobs().list().await)
}

async fn job_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.service.jobs().get(id).await {
        Some(job) => Json(job).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("job {id} not found")),
    }
}

async fn crawl_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CrawlRequest::default()
    } else {
        match serde_json::from_slice::<CrawlRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {err}"))
            }
        }
    };

    match state.service.run_manual(request.sources).await {
        Ok(summary) => Json(CrawlResponse {
            job_id: summary.job_id,
            events: summary.events_forwarded,
            summary,
        })
        .into_response(),
        Err(err) => crawl_error(err),
    }
}

fn crawl_error(err: CrawlError) -> Response {
    let status = match &err {
        CrawlError::AlreadyRunning => StatusCode::CONFLICT,
        CrawlError::UnknownSources(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
