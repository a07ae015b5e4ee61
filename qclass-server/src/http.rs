//! Qclass HTTP REST API
//!
//! Axum-based HTTP server exposing prediction and interaction records.
//! Runs alongside the Unix socket IPC server on port 8080 (configurable).
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! taking plain arguments; the inner functions are tested directly.
//!
//! Endpoints:
//! - GET    /            — liveness
//! - GET    /health      — store health and cache statistics
//! - GET    /version     — server version info
//! - GET    /api/about   — predictor, store and cache details
//! - POST   /api/predict — classify a query (cache or predictor)
//! - POST   /chat        — create a pending record
//! - GET    /chat?query= — records for a query, newest first
//! - GET    /chat/:id    — fetch a record
//! - DELETE /chat/:id    — delete a record
//!
//! Every response carries an `X-Process-Time` header in seconds.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use qclass_core::models::{InteractionRecord, PredictionOutcome};
use qclass_core::{QclassConfig, QclassError, RequestCoordinator};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::services::Services;

pub const PROCESS_TIME_HEADER: &str = "x-process-time";

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub coordinator: Arc<RequestCoordinator>,
    pub config: QclassConfig,
}

impl From<&Services> for HttpState {
    fn from(services: &Services) -> Self {
        Self {
            coordinator: Arc::clone(&services.coordinator),
            config: services.config.clone(),
        }
    }
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/api/about", get(about_handler))
        .route("/api/predict", post(predict_handler))
        .route("/chat", post(create_handler).get(history_handler))
        .route("/chat/:id", get(get_handler).delete(delete_handler))
        .layer(middleware::from_fn(process_time))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: HttpState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(Arc::new(state));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Qclass HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

/// Stamp every response with the wall time spent producing it.
async fn process_time(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let mut response = next.run(request).await;
    let elapsed = format!("{:.3}", start.elapsed().as_secs_f64());
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        response.headers_mut().insert(PROCESS_TIME_HEADER, value);
    }
    response
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct QueryRequest {
    pub user_query: Option<String>,
    pub session_id: Option<Uuid>,
    /// Pending record to complete; ignored by `POST /chat`.
    pub chat_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
pub struct HistoryParams {
    pub query: Option<String>,
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub fn status_inner() -> serde_json::Value {
    serde_json::json!({ "status": "ok" })
}

/// Inner health check — store health plus cache statistics.
pub async fn health_inner(
    coordinator: &RequestCoordinator,
    socket_path: &str,
) -> (StatusCode, serde_json::Value) {
    let store = match coordinator.store().health().await {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                }),
            );
        }
    };

    let cache = match coordinator.cache().stats() {
        Ok(stats) => serde_json::json!(stats),
        Err(e) => serde_json::json!(format!("unavailable: {}", e)),
    };

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "store": store,
            "cache": cache,
            "socket": socket_path,
        }),
    )
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "qclass/1",
    })
}

/// Deployment details, for debugging.
pub fn about_inner(coordinator: &RequestCoordinator, config: &QclassConfig) -> serde_json::Value {
    let stats = coordinator.cache().stats().ok();
    serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "predictor": {
            "backend": coordinator.predictor_name(),
            "timeout_seconds": config.predictor.timeout_seconds,
            "labels": config.predictor.labels,
        },
        "store": coordinator.store().name(),
        "cache": {
            "capacity": config.cache.capacity,
            "ttl_seconds": config.cache.ttl_seconds,
            "sliding_ttl": config.cache.sliding_ttl,
            "stats": stats,
        },
        "inflight": coordinator.inflight_len(),
    })
}

pub async fn predict_inner(
    coordinator: &RequestCoordinator,
    req: QueryRequest,
) -> (StatusCode, serde_json::Value) {
    let query = match required_query(req.user_query) {
        Ok(q) => q,
        Err(e) => return error_response(&e),
    };

    match coordinator.predict(&query, req.session_id, req.chat_id).await {
        Ok(outcome) => (StatusCode::OK, outcome_json(&outcome)),
        Err(e) => error_response(&e),
    }
}

pub async fn create_inner(
    coordinator: &RequestCoordinator,
    req: QueryRequest,
) -> (StatusCode, serde_json::Value) {
    let query = match required_query(req.user_query) {
        Ok(q) => q,
        Err(e) => return error_response(&e),
    };

    match coordinator.create(&query, req.session_id).await {
        Ok(record) => (StatusCode::CREATED, record_json(&record)),
        Err(e) => error_response(&e),
    }
}

pub async fn get_inner(coordinator: &RequestCoordinator, id: &str) -> (StatusCode, serde_json::Value) {
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };

    match coordinator.get(id).await {
        Ok(record) => (StatusCode::OK, record_json(&record)),
        Err(e) => error_response(&e),
    }
}

/// Returns `NO_CONTENT` with a null body on success.
pub async fn delete_inner(
    coordinator: &RequestCoordinator,
    id: &str,
) -> (StatusCode, serde_json::Value) {
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };

    match coordinator.delete(id).await {
        Ok(()) => (StatusCode::NO_CONTENT, serde_json::Value::Null),
        Err(e) => error_response(&e),
    }
}

pub async fn history_inner(
    coordinator: &RequestCoordinator,
    params: HistoryParams,
) -> (StatusCode, serde_json::Value) {
    let query = match required_query(params.query) {
        Ok(q) => q,
        Err(e) => return error_response(&e),
    };

    match coordinator.history(&query).await {
        Ok(records) => (
            StatusCode::OK,
            serde_json::json!({
                "query": query,
                "count": records.len(),
                "records": records.iter().map(record_json).collect::<Vec<_>>(),
            }),
        ),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn status_handler() -> impl IntoResponse {
    tracing::debug!("Status check");
    (StatusCode::OK, Json(status_inner()))
}

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.coordinator, &state.config.service.socket_path).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn about_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(about_inner(&state.coordinator, &state.config)))
}

pub async fn predict_handler(
    State(state): State<Arc<HttpState>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> impl IntoResponse {
    let (status, body) = match json_body(payload) {
        Ok(req) => predict_inner(&state.coordinator, req).await,
        Err(e) => error_response(&e),
    };
    (status, Json(body))
}

pub async fn create_handler(
    State(state): State<Arc<HttpState>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> impl IntoResponse {
    let (status, body) = match json_body(payload) {
        Ok(req) => create_inner(&state.coordinator, req).await,
        Err(e) => error_response(&e),
    };
    (status, Json(body))
}

pub async fn history_handler(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let (status, body) = history_inner(&state.coordinator, params).await;
    (status, Json(body))
}

pub async fn get_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = get_inner(&state.coordinator, &id).await;
    (status, Json(body))
}

pub async fn delete_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> Response {
    match delete_inner(&state.coordinator, &id).await {
        (StatusCode::NO_CONTENT, _) => StatusCode::NO_CONTENT.into_response(),
        (status, body) => (status, Json(body)).into_response(),
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// HTTP status for each error kind.
pub fn error_status(e: &QclassError) -> StatusCode {
    match e {
        QclassError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        QclassError::NotFound(_) => StatusCode::NOT_FOUND,
        QclassError::InvalidTransition { .. } => StatusCode::CONFLICT,
        QclassError::PredictionFailed(_) | QclassError::Cache(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        QclassError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn error_response(e: &QclassError) -> (StatusCode, serde_json::Value) {
    (
        error_status(e),
        serde_json::json!({
            "error": e.to_string(),
            "code": e.code(),
            "status": "error",
        }),
    )
}

/// Unreadable request bodies get the same error shape as any other bad input.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, QclassError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| QclassError::Validation(rejection.body_text()))
}

fn required_query(query: Option<String>) -> Result<String, QclassError> {
    match query {
        Some(q) if !q.trim().is_empty() => Ok(q),
        _ => Err(QclassError::Validation("user_query field is required".to_string())),
    }
}

fn parse_id(id: &str) -> Result<Uuid, QclassError> {
    Uuid::parse_str(id).map_err(|e| QclassError::Validation(format!("invalid record id '{id}': {e}")))
}

pub fn outcome_json(outcome: &PredictionOutcome) -> serde_json::Value {
    serde_json::json!({
        "chat_id": outcome.record_id,
        "session_id": outcome.session_id,
        "user_query": outcome.query_text,
        "prediction_label": outcome.label,
        "prediction_probability": outcome.probability,
        "status": "completed",
        "source": outcome.source,
    })
}

pub fn record_json(record: &InteractionRecord) -> serde_json::Value {
    serde_json::json!({
        "chat_id": record.record_id,
        "session_id": record.session_id,
        "user_query": record.query_text,
        "prediction_label": record.label,
        "prediction_probability": record.probability,
        "status": record.status,
        "created_at": record.created_at,
        "updated_at": record.updated_at,
    })
}

// ============================================================================
// Unit Tests — call inner functions directly
// ============================================================================
