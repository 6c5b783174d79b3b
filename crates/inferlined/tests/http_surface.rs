//! HTTP surface regression tests.
//!
//! Drives the full router the daemon serves: prediction through the
//! batching queue and cache, error mapping, status, and metrics exposition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use inferline_alerts::AlertEvaluator;
use inferline_api::{ApiState, build_router};
use inferline_autoscale::{Autoscaler, ScalingPolicy};
use inferline_batch::{BatchSettings, BatchingQueue};
use inferline_cache::ResultCache;
use inferline_core::config::AlertsConfig;
use inferline_core::{ModelIdentity, Payload};
use inferline_executor::{BatchOutput, EchoModel, ModelBinding, SlotPool};
use inferline_metrics::MetricsAggregator;

/// Echo binding that takes a while per batch.
struct SlowEcho {
    identity: ModelIdentity,
    delay: Duration,
}

impl ModelBinding for SlowEcho {
    fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    fn infer(&self, inputs: &[Payload]) -> anyhow::Result<BatchOutput> {
        std::thread::sleep(self.delay);
        Ok(BatchOutput::Complete(inputs.to_vec()))
    }
}

struct Server {
    router: Router,
    queue: Arc<BatchingQueue>,
}

fn server_with(model: Arc<dyn ModelBinding>) -> Server {
    let identity = model.identity().clone();
    let metrics = Arc::new(MetricsAggregator::new(Duration::from_secs(60)).with_slots(2));
    let queue = BatchingQueue::start(
        BatchSettings {
            max_wait: Duration::from_millis(5),
            ..BatchSettings::default()
        },
        model,
        Arc::new(ResultCache::new(128, None)),
        Arc::new(SlotPool::new(2).unwrap()),
        Arc::clone(&metrics),
    );
    let router = build_router(ApiState {
        queue: Arc::clone(&queue),
        metrics,
        model: identity,
        capacity: Autoscaler::new(ScalingPolicy::default(), 2).subscribe(),
        alerts: AlertEvaluator::from_config(&AlertsConfig::default()).subscribe(),
        started: Instant::now(),
    });
    Server { router, queue }
}

fn server() -> Server {
    server_with(Arc::new(EchoModel::new(ModelIdentity::new("echo", "1.0"))))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(resp: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    String::from_utf8(body_bytes(resp).await).unwrap()
}

#[tokio::test]
async fn health_reports_healthy() {
    let s = server();
    let resp = s.router.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({ "status": "healthy" }));
}

#[tokio::test]
async fn predict_returns_model_output() {
    let s = server();
    let body = json!({ "inputs": [[1.0, 2.0], "text"] }).to_string();
    let resp = s.router.oneshot(post("/predict", body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["predictions"], json!([[1.0, 2.0], "text"]));
    assert_eq!(body["model"], "echo");
    assert_eq!(body["version"], "1.0");
}

#[tokio::test]
async fn concurrent_predictions_each_get_their_own_result() {
    let s = server();
    let mut handles = Vec::new();
    for i in 0..16 {
        let router = s.router.clone();
        handles.push(tokio::spawn(async move {
            let body = json!({ "inputs": [i] }).to_string();
            let resp = router.oneshot(post("/predict", body)).await.unwrap();
            (i, resp.status(), body_json(resp).await)
        }));
    }
    for handle in handles {
        let (i, status, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["predictions"], json!([i]));
    }
    assert!(s.queue.stats().batches_dispatched < 16);
}

#[tokio::test]
async fn invalid_bodies_are_rejected() {
    let s = server();
    for body in ["", "{\"inputs\": ", "{\"timeout_ms\": 10}", "{\"inputs\": []}"] {
        let resp = s
            .router
            .clone()
            .oneshot(post("/predict", body.to_string()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body {body:?}");
        let json = body_json(resp).await;
        assert_eq!(json["code"], "INVALID_INPUT");
        assert!(json["error"].is_string());
    }
    assert_eq!(s.queue.stats().batches_dispatched, 0);
}

#[tokio::test]
async fn repeated_prediction_is_served_from_cache() {
    let s = server();
    let body = json!({ "inputs": ["same"] }).to_string();
    for _ in 0..2 {
        let resp = s
            .router
            .clone()
            .oneshot(post("/predict", body.clone()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    assert_eq!(s.queue.stats().batches_dispatched, 1);

    let resp = s.router.oneshot(get("/metrics")).await.unwrap();
    let text = body_text(resp).await;
    assert!(text.contains("inferline_cache_hits_total 1"));
    assert!(text.contains("inferline_requests_total 2"));
}

#[tokio::test]
async fn expired_deadline_maps_to_gateway_timeout() {
    let s = server_with(Arc::new(SlowEcho {
        identity: ModelIdentity::new("slow", "1"),
        delay: Duration::from_millis(200),
    }));
    let body = json!({ "inputs": [1], "timeout_ms": 20 }).to_string();
    let resp = s.router.oneshot(post("/predict", body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(resp).await["code"], "DEADLINE_EXCEEDED");
}

#[tokio::test]
async fn draining_server_is_unavailable() {
    let s = server();
    s.queue.shutdown().await;
    let body = json!({ "inputs": [1] }).to_string();
    let resp = s.router.oneshot(post("/predict", body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(resp).await["code"], "SHUTTING_DOWN");
}

#[tokio::test]
async fn models_lists_served_model() {
    let s = server();
    let resp = s.router.oneshot(get("/models")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["models"], json!([{ "name": "echo", "version": "1.0" }]));
    assert_eq!(body["default"], json!({ "name": "echo", "version": "1.0" }));
}

#[tokio::test]
async fn status_reports_capacity_alerts_and_batching() {
    let s = server();
    let resp = s.router.oneshot(get("/status")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["capacity"]["current"], 2);
    assert!(body["capacity"]["last_decision"].is_null());
    assert_eq!(body["draining"], false);
    let alerts = body["alerts"].as_array().unwrap();
    assert_eq!(alerts.len(), 6);
    assert!(alerts.iter().all(|a| a["phase"] == "resolved"));
    assert_eq!(body["batching"]["batches_dispatched"], 0);
}

#[tokio::test]
async fn metrics_exposition_counts_http_requests() {
    let s = server();
    let resp = s.router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = s
        .router
        .clone()
        .oneshot(post("/predict", String::new()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = s.router.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain; version=0.0.4"));

    let text = body_text(resp).await;
    assert!(text.contains(
        "inferline_http_requests_total{method=\"GET\",path=\"/health\",status=\"200\"} 1"
    ));
    assert!(text.contains(
        "inferline_http_requests_total{method=\"POST\",path=\"/predict\",status=\"400\"} 1"
    ));
    assert!(text.contains("inferline_errors_total{code=\"INVALID_INPUT\"} 1"));
}
