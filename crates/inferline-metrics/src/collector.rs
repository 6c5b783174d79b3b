//! Metrics aggregator — rolling-window serving metrics.
//!
//! Lifetime counters and gauges are atomics. Everything that has to be read
//! over the window (rates, quantiles, ratios) lives in a mutex-protected
//! ring of one-second buckets.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use inferline_cache::CacheStats;
use inferline_core::{MetricSnapshot, SnapshotSource, epoch_secs};

use crate::window::Window;

/// Resource gauges sampled outside the request path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Resident memory of the serving process.
    pub memory_bytes: u64,
    pub gpu_used_bytes: u64,
    pub gpu_total_bytes: u64,
}

/// Requests handled by the HTTP layer, keyed by method, path and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpCount {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub count: u64,
}

/// Lifetime counters for the Prometheus exposition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricCounters {
    pub requests_total: u64,
    pub cache_hits_total: u64,
    pub cache_misses_total: u64,
    pub batches_total: u64,
    pub batch_items_total: u64,
    pub cache_evictions_total: u64,
    pub errors_by_code: Vec<(String, u64)>,
    pub http: Vec<HttpCount>,
}

/// Aggregates everything the serving core reports.
pub struct MetricsAggregator {
    window: Mutex<Window>,
    started: Instant,
    memory_budget_bytes: u64,

    requests_total: AtomicU64,
    errors_total: AtomicU64,
    cache_hits_total: AtomicU64,
    cache_misses_total: AtomicU64,
    batches_total: AtomicU64,
    batch_items_total: AtomicU64,

    queue_depth: AtomicU64,
    memory_usage_bytes: AtomicU64,
    gpu_used_bytes: AtomicU64,
    gpu_total_bytes: AtomicU64,
    cache_used: AtomicU64,
    cache_capacity: AtomicU64,
    cache_evictions: AtomicU64,
    slots_total: AtomicU64,
    slots_busy: AtomicU64,
    restart_count: AtomicU64,

    errors_by_code: Mutex<BTreeMap<String, u64>>,
    http: Mutex<BTreeMap<(String, String, u16), u64>>,
}

impl MetricsAggregator {
    /// Create an aggregator whose window starts now.
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    /// Create an aggregator whose window starts at `started`.
    pub fn starting_at(window: Duration, started: Instant) -> Self {
        Self {
            window: Mutex::new(Window::new(window.as_secs())),
            started,
            memory_budget_bytes: 0,
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            cache_hits_total: AtomicU64::new(0),
            cache_misses_total: AtomicU64::new(0),
            batches_total: AtomicU64::new(0),
            batch_items_total: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            memory_usage_bytes: AtomicU64::new(0),
            gpu_used_bytes: AtomicU64::new(0),
            gpu_total_bytes: AtomicU64::new(0),
            cache_used: AtomicU64::new(0),
            cache_capacity: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
            slots_total: AtomicU64::new(0),
            slots_busy: AtomicU64::new(0),
            restart_count: AtomicU64::new(0),
            errors_by_code: Mutex::new(BTreeMap::new()),
            http: Mutex::new(BTreeMap::new()),
        }
    }

    /// Memory budget that `memory_utilization` is measured against.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    /// Number of executor slots, used as the CPU utilization denominator.
    pub fn with_slots(self, slots: usize) -> Self {
        self.slots_total.store(slots as u64, Ordering::Relaxed);
        self
    }

    fn second(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started).as_secs()
    }

    fn with_bucket(&self, now: Instant, f: impl FnOnce(&mut crate::window::Bucket)) {
        let second = self.second(now);
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        f(window.bucket_mut(second));
    }

    /// Record a delivered response.
    ///
    /// `batch_size` is the size of the batch that computed the prediction;
    /// it is ignored for cache hits.
    pub fn record_completion(&self, latency: Duration, batch_size: usize, cache_hit: bool) {
        self.record_completion_at(latency, batch_size, cache_hit, Instant::now());
    }

    pub fn record_completion_at(
        &self,
        latency: Duration,
        batch_size: usize,
        cache_hit: bool,
        now: Instant,
    ) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            self.cache_hits_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses_total.fetch_add(1, Ordering::Relaxed);
        }
        self.with_bucket(now, |b| {
            b.completions += 1;
            if cache_hit {
                b.cache_hits += 1;
            } else {
                b.batch_size_sum += batch_size as u64;
            }
            b.record_latency(latency.as_micros() as u64);
        });
    }

    /// Record a request that ended in an error (including rejections).
    pub fn record_error(&self, code: &str) {
        self.record_error_at(code, Instant::now());
    }

    pub fn record_error_at(&self, code: &str, now: Instant) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        {
            let mut by_code = self.errors_by_code.lock().unwrap_or_else(|e| e.into_inner());
            *by_code.entry(code.to_string()).or_default() += 1;
        }
        self.with_bucket(now, |b| b.errors += 1);
    }

    /// Record one executed batch and how long it held its slot.
    pub fn record_batch(&self, size: usize, busy: Duration) {
        self.record_batch_at(size, busy, Instant::now());
    }

    pub fn record_batch_at(&self, size: usize, busy: Duration, now: Instant) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
        self.batch_items_total.fetch_add(size as u64, Ordering::Relaxed);
        self.with_bucket(now, |b| {
            b.batches += 1;
            b.busy_us += busy.as_micros() as u64;
        });
        debug!(size, busy_ms = busy.as_millis() as u64, "batch recorded");
    }

    pub fn record_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn update_resources(&self, usage: ResourceUsage) {
        self.memory_usage_bytes
            .store(usage.memory_bytes, Ordering::Relaxed);
        self.gpu_used_bytes
            .store(usage.gpu_used_bytes, Ordering::Relaxed);
        self.gpu_total_bytes
            .store(usage.gpu_total_bytes, Ordering::Relaxed);
    }

    pub fn update_cache(&self, stats: &CacheStats) {
        self.cache_used.store(stats.used, Ordering::Relaxed);
        self.cache_capacity.store(stats.capacity, Ordering::Relaxed);
        self.cache_evictions.store(stats.evictions, Ordering::Relaxed);
    }

    pub fn update_slots(&self, busy: usize) {
        self.slots_busy.store(busy as u64, Ordering::Relaxed);
    }

    pub fn set_restart_count(&self, count: u64) {
        self.restart_count.store(count, Ordering::Relaxed);
    }

    /// Count one request handled by the HTTP layer.
    ///
    /// Methods outside the standard set share the `other` label.
    pub fn record_http(&self, method: &str, path: &str, status: u16) {
        let method = http_method_label(method);
        let mut http = self.http.lock().unwrap_or_else(|e| e.into_inner());
        *http
            .entry((method.to_string(), path.to_string(), status))
            .or_default() += 1;
    }

    pub fn snapshot(&self) -> MetricSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Read the window ending at `now`.
    ///
    /// Until a full window has elapsed since start, rates are measured over
    /// the elapsed time (at least one second).
    pub fn snapshot_at(&self, now: Instant) -> MetricSnapshot {
        let (merged, window_len) = {
            let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            (window.merged(self.second(now)), window.len_secs())
        };

        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let window_secs = elapsed.clamp(1.0, window_len as f64);

        let executed = merged.completions - merged.cache_hits;
        let attempts = merged.completions + merged.errors;
        let slots_total = self.slots_total.load(Ordering::Relaxed);
        let memory_usage_bytes = self.memory_usage_bytes.load(Ordering::Relaxed);
        let gpu_total = self.gpu_total_bytes.load(Ordering::Relaxed);
        let cache_capacity = self.cache_capacity.load(Ordering::Relaxed);

        MetricSnapshot {
            taken_at: epoch_secs(),
            window_secs,
            request_rate: merged.completions as f64 / window_secs,
            latency_p50_ms: merged.quantile_ms(0.50),
            latency_p95_ms: merged.quantile_ms(0.95),
            latency_p99_ms: merged.quantile_ms(0.99),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            mean_batch_size: ratio(merged.batch_size_sum, executed),
            memory_usage_bytes,
            memory_utilization: ratio(memory_usage_bytes, self.memory_budget_bytes),
            cpu_utilization: if slots_total == 0 {
                0.0
            } else {
                let capacity_us = slots_total as f64 * window_secs * 1_000_000.0;
                (merged.busy_us as f64 / capacity_us).min(1.0)
            },
            gpu_memory_utilization: ratio(self.gpu_used_bytes.load(Ordering::Relaxed), gpu_total),
            cache_hit_ratio: ratio(merged.cache_hits, merged.completions),
            cache_utilization: ratio(self.cache_used.load(Ordering::Relaxed), cache_capacity),
            error_rate: ratio(merged.errors, attempts),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            restart_count: self.restart_count.load(Ordering::Relaxed),
            slots_total,
            slots_busy: self.slots_busy.load(Ordering::Relaxed),
        }
    }

    pub fn counters(&self) -> MetricCounters {
        let errors_by_code = self
            .errors_by_code
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(code, n)| (code.clone(), *n))
            .collect();
        let http = self
            .http
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|((method, path, status), count)| HttpCount {
                method: method.clone(),
                path: path.clone(),
                status: *status,
                count: *count,
            })
            .collect();

        MetricCounters {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            cache_hits_total: self.cache_hits_total.load(Ordering::Relaxed),
            cache_misses_total: self.cache_misses_total.load(Ordering::Relaxed),
            batches_total: self.batches_total.load(Ordering::Relaxed),
            batch_items_total: self.batch_items_total.load(Ordering::Relaxed),
            cache_evictions_total: self.cache_evictions.load(Ordering::Relaxed),
            errors_by_code,
            http,
        }
    }
}

impl SnapshotSource for MetricsAggregator {
    fn snapshot(&self) -> anyhow::Result<MetricSnapshot> {
        Ok(MetricsAggregator::snapshot(self))
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        return 0.0;
    }
    num as f64 / den as f64
}

fn http_method_label(method: &str) -> &str {
    match method {
        "GET" | "HEAD" | "POST" | "PUT" | "DELETE" | "CONNECT" | "OPTIONS" | "TRACE"
        | "PATCH" => method,
        _ => "other",
    }
}
