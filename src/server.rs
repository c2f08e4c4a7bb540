//! HTTP server: SSE search endpoint, audit lookup, health, metrics

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{error, info};

use crate::error::PipelineError;
use crate::orchestrator::{SearchSubmission, SharedOrchestrator};
use crate::types::Constraints;

/// Inbound search request body
#[derive(Debug, Deserialize)]
pub struct SearchRequestHttp {
    pub query: String,
    #[serde(default)]
    pub constraints: Option<Constraints>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub backends: Vec<BackendHealth>,
}

#[derive(Debug, Serialize)]
pub struct BackendHealth {
    pub name: String,
    pub healthy: bool,
}

/// Named backend probe registered at startup for `/health`
pub struct HealthProbe {
    pub name: String,
    pub check: Box<dyn Fn() -> futures::future::BoxFuture<'static, bool> + Send + Sync>,
}

pub struct AppState {
    pub orchestrator: SharedOrchestrator,
    pub probes: Vec<HealthProbe>,
}

pub type SharedAppState = Arc<AppState>;

/// Streaming search handler: each envelope event becomes one SSE event
async fn search_handler(
    State(state): State<SharedAppState>,
    Json(req): Json<SearchRequestHttp>,
) -> Result<
    Sse<impl Stream<Item = Result<Event, Infallible>>>,
    (StatusCode, Json<ErrorResponse>),
> {
    info!("search request: '{}'", req.query);

    let submission = SearchSubmission {
        text: req.query,
        constraints: req.constraints,
        trace_id: req.trace_id,
        attachments: req.attachments,
    };

    let stream = state.orchestrator.submit(submission).await.map_err(reject)?;

    let sse_stream = stream.map(|event| {
        let kind = serde_json::to_value(event.event)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "event".to_string());
        Ok(Event::default()
            .event(kind)
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("serialization error")))
    });

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}

fn reject(err: PipelineError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        PipelineError::InputInvalid(_) => StatusCode::BAD_REQUEST,
        PipelineError::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!("search rejected: {}", err);
    (status, Json(ErrorResponse { error: err.to_string(), kind: err.kind().to_string() }))
}

/// Audit lookup by trace id
async fn audit_handler(
    State(state): State<SharedAppState>,
    Path(trace_id): Path<String>,
) -> Result<Json<crate::types::AuditRecord>, StatusCode> {
    match state.orchestrator.audit_sink().fetch(&trace_id).await {
        Some(record) => Ok(Json(record)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// Liveness of the core and each configured backend
async fn health_handler(State(state): State<SharedAppState>) -> Json<HealthResponse> {
    let mut backends = Vec::new();
    for probe in &state.probes {
        let healthy = (probe.check)().await;
        backends.push(BackendHealth { name: probe.name.clone(), healthy });
    }
    let up = backends.iter().filter(|b| b.healthy).count();
    let status = if backends.is_empty() || up == backends.len() {
        "ok"
    } else if up > 0 {
        "degraded"
    } else {
        "down"
    };
    Json(HealthResponse {
        status: status.to_string(),
        service: "quorum".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backends,
    })
}

async fn metrics_handler(State(state): State<SharedAppState>) -> String {
    state.orchestrator.metrics().render()
}

/// Create and configure the HTTP router
pub fn create_router(state: SharedAppState) -> Router {
    Router::new()
        .route("/search", post(search_handler))
        .route("/audit/:trace_id", get(audit_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(state: SharedAppState, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!("starting quorum server on {}", addr);

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
