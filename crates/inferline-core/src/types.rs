//! Shared types passed between inferline components.

use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::MAX_DURATION;

/// Ordered input units of a single request.
pub type Payload = Vec<serde_json::Value>;

/// Ordered outputs produced for a single request.
pub type Prediction = Vec<serde_json::Value>;

/// Name and version of the model being served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub name: String,
    pub version: String,
}

impl ModelIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Deterministic hash of a payload and the model that serves it.
///
/// Two requests with the same fingerprint are guaranteed to produce the
/// same prediction, so the fingerprint keys both the result cache and
/// in-flight coalescing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn compute(model: &ModelIdentity, payload: &[serde_json::Value]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(model.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(model.version.as_bytes());
        hasher.update([0u8]);
        // serde_json maps are key-sorted, so this serialization is canonical.
        for value in payload {
            hasher.update(value.to_string().as_bytes());
            hasher.update([b'\n']);
        }
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

/// A request admitted to the serving core.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub payload: Payload,
    pub arrival: Instant,
    pub deadline: Option<Instant>,
    pub fingerprint: Fingerprint,
}

impl Request {
    pub fn new(id: impl Into<String>, payload: Payload, model: &ModelIdentity) -> Self {
        let fingerprint = Fingerprint::compute(model, &payload);
        Self {
            id: id.into(),
            payload,
            arrival: Instant::now(),
            deadline: None,
            fingerprint,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

/// Point-in-time read of the aggregated serving metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Unix timestamp (seconds) when the snapshot was taken.
    pub taken_at: u64,
    /// Length of the window the rates and quantiles cover.
    pub window_secs: f64,
    /// Completed requests per second over the window.
    pub request_rate: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    /// Requests waiting in the batching queue.
    pub queue_depth: u64,
    /// Mean size of the batch an executed request rode in.
    pub mean_batch_size: f64,
    /// Resident memory of the serving process (bytes).
    pub memory_usage_bytes: u64,
    /// Resident memory over the executor memory budget (0.0–1.0+).
    pub memory_utilization: f64,
    /// Executor busy fraction over the window (0.0–1.0).
    pub cpu_utilization: f64,
    /// Device memory in use over device memory available (0.0–1.0).
    pub gpu_memory_utilization: f64,
    /// hits / (hits + misses) over the window.
    pub cache_hit_ratio: f64,
    /// Used cache capacity over configured capacity (0.0–1.0).
    pub cache_utilization: f64,
    /// errors / (completions + errors) over the window.
    pub error_rate: f64,
    pub requests_total: u64,
    pub errors_total: u64,
    pub restart_count: u64,
    pub slots_total: u64,
    pub slots_busy: u64,
}

/// Anything the periodic controllers can read a snapshot from.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> anyhow::Result<MetricSnapshot>;
}

/// `start + after`, saturating to the furthest representable deadline.
pub fn deadline_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .or_else(|| start.checked_add(MAX_DURATION))
        .unwrap_or(start)
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
