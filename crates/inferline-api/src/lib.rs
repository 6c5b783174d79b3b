//! inferline-api — HTTP surface of the serving core.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness probe |
//! | POST | `/predict` | Run a prediction through the batching queue |
//! | GET | `/models` | Served model identity |
//! | GET | `/status` | Capacity, alerts and batching counters |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tokio::sync::watch;

use inferline_alerts::AlertState;
use inferline_autoscale::CapacityStatus;
use inferline_batch::BatchingQueue;
use inferline_core::ModelIdentity;
use inferline_metrics::MetricsAggregator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<BatchingQueue>,
    pub metrics: Arc<MetricsAggregator>,
    pub model: ModelIdentity,
    pub capacity: watch::Receiver<CapacityStatus>,
    pub alerts: watch::Receiver<Vec<AlertState>>,
    pub started: Instant,
}

/// Build the complete router, with per-route request counting.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/predict", post(handlers::predict))
        .route("/models", get(handlers::list_models))
        .route("/status", get(handlers::status))
        .route("/metrics", get(handlers::prometheus_metrics))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::count_requests,
        ))
        .with_state(state)
}
