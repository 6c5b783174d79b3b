//! HTTP handlers.
//!
//! Prediction requests go through the batching queue; everything else reads
//! shared state. Errors use one body shape: `{"error": msg, "code": CODE}`.

use std::time::{Duration, Instant};

use axum::Json;
use axum::body::Bytes;
use axum::extract::{MatchedPath, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use inferline_core::{Prediction, ServeError};

use crate::ApiState;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

/// HTTP status for each serving error.
pub fn status_for(err: &ServeError) -> StatusCode {
    match err {
        ServeError::Overloaded { .. } | ServeError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ServeError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ServeError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ServeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
    }
}

fn error_response(err: &ServeError) -> Response {
    (
        status_for(err),
        Json(ErrorBody {
            error: err.to_string(),
            code: err.code(),
        }),
    )
        .into_response()
}

/// Count every handled request by method, route and status.
pub async fn count_requests(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let response = next.run(req).await;
    state
        .metrics
        .record_http(&method, &path, response.status().as_u16());
    response
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

// ── Prediction ─────────────────────────────────────────────────

/// Prediction request body.
#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub inputs: Option<Vec<serde_json::Value>>,
    /// Per-request deadline, milliseconds from arrival.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub predictions: Prediction,
    pub model: String,
    pub version: String,
}

fn parse_predict(body: &[u8]) -> Result<PredictRequest, ServeError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ServeError::InvalidInput("request body is empty".to_string()));
    }
    let req: PredictRequest = serde_json::from_slice(body)
        .map_err(|e| ServeError::InvalidInput(format!("malformed JSON: {e}")))?;
    match &req.inputs {
        None => Err(ServeError::InvalidInput("missing field `inputs`".to_string())),
        Some(inputs) if inputs.is_empty() => {
            Err(ServeError::InvalidInput("`inputs` must not be empty".to_string()))
        }
        Some(_) => Ok(req),
    }
}

/// POST /predict
pub async fn predict(State(state): State<ApiState>, body: Bytes) -> Response {
    let arrival = Instant::now();
    let req = match parse_predict(&body) {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, "rejected prediction request");
            state.metrics.record_error(e.code());
            return error_response(&e);
        }
    };

    let deadline = req
        .timeout_ms
        .map(|ms| arrival + Duration::from_millis(ms));
    let inputs = req.inputs.unwrap_or_default();

    match state.queue.submit(inputs, deadline).await {
        Ok(predictions) => Json(PredictResponse {
            predictions,
            model: state.model.name.clone(),
            version: state.model.version.clone(),
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Models ─────────────────────────────────────────────────────

/// GET /models
///
/// One model is served; it is also the default.
pub async fn list_models(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "models": [&state.model],
        "default": state.model,
    }))
}

// ── Status ─────────────────────────────────────────────────────

/// GET /status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let capacity = state.capacity.borrow().clone();
    let alerts = state.alerts.borrow().clone();
    Json(serde_json::json!({
        "model": state.model,
        "uptime_secs": state.started.elapsed().as_secs(),
        "draining": state.queue.is_shutting_down(),
        "capacity": capacity,
        "alerts": alerts,
        "batching": state.queue.stats(),
        "metrics": state.metrics.snapshot(),
    }))
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = inferline_metrics::render_prometheus(&state.metrics.snapshot(), &state.metrics.counters());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
