//! Prometheus text exposition format.
//!
//! Renders a snapshot plus the lifetime counters into the text exposition
//! format (v0.0.4) served on `/metrics`.

use std::fmt::Write;

use inferline_core::MetricSnapshot;

use crate::collector::MetricCounters;

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP inferline_{name} {help}");
    let _ = writeln!(out, "# TYPE inferline_{name} {kind}");
}

fn gauge(out: &mut String, name: &str, help: &str, value: f64) {
    header(out, name, help, "gauge");
    let _ = writeln!(out, "inferline_{name} {value}");
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    header(out, name, help, "counter");
    let _ = writeln!(out, "inferline_{name} {value}");
}

/// Escape a label value per the exposition format.
fn label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Render a snapshot and counters into Prometheus text format.
pub fn render_prometheus(snapshot: &MetricSnapshot, counters: &MetricCounters) -> String {
    let mut out = String::new();

    gauge(
        &mut out,
        "request_rate",
        "Completed requests per second over the window.",
        snapshot.request_rate,
    );

    header(
        &mut out,
        "request_latency_ms",
        "Request latency quantiles in milliseconds over the window.",
        "gauge",
    );
    for (q, v) in [
        ("0.5", snapshot.latency_p50_ms),
        ("0.95", snapshot.latency_p95_ms),
        ("0.99", snapshot.latency_p99_ms),
    ] {
        let _ = writeln!(out, "inferline_request_latency_ms{{quantile=\"{q}\"}} {v}");
    }

    gauge(
        &mut out,
        "queue_depth",
        "Requests waiting in the batching queue.",
        snapshot.queue_depth as f64,
    );
    gauge(
        &mut out,
        "memory_usage_bytes",
        "Resident memory of the serving process.",
        snapshot.memory_usage_bytes as f64,
    );
    gauge(
        &mut out,
        "memory_utilization",
        "Resident memory over the executor memory budget.",
        snapshot.memory_utilization,
    );
    gauge(
        &mut out,
        "cpu_utilization",
        "Executor slot busy fraction over the window.",
        snapshot.cpu_utilization,
    );
    gauge(
        &mut out,
        "gpu_memory_utilization",
        "Device memory in use over device memory available.",
        snapshot.gpu_memory_utilization,
    );
    gauge(
        &mut out,
        "cache_hit_ratio",
        "Cache hits over cache lookups in the window.",
        snapshot.cache_hit_ratio,
    );
    gauge(
        &mut out,
        "cache_utilization",
        "Used result cache capacity over configured capacity.",
        snapshot.cache_utilization,
    );
    gauge(
        &mut out,
        "error_rate",
        "Failed requests over all requests in the window.",
        snapshot.error_rate,
    );
    gauge(
        &mut out,
        "executor_slots",
        "Executor slots in the pool.",
        snapshot.slots_total as f64,
    );
    gauge(
        &mut out,
        "executor_slots_busy",
        "Executor slots currently running a batch.",
        snapshot.slots_busy as f64,
    );
    gauge(
        &mut out,
        "restart_count",
        "Restarts of the serving process.",
        snapshot.restart_count as f64,
    );

    counter(
        &mut out,
        "requests_total",
        "Requests answered with a prediction.",
        counters.requests_total,
    );
    counter(
        &mut out,
        "cache_hits_total",
        "Requests answered from the result cache.",
        counters.cache_hits_total,
    );
    counter(
        &mut out,
        "cache_misses_total",
        "Requests that needed model execution.",
        counters.cache_misses_total,
    );
    counter(
        &mut out,
        "cache_evictions_total",
        "Entries evicted from the result cache.",
        counters.cache_evictions_total,
    );

    header(&mut out, "errors_total", "Failed requests by error code.", "counter");
    for (code, n) in &counters.errors_by_code {
        let _ = writeln!(out, "inferline_errors_total{{code=\"{}\"}} {n}", label(code));
    }

    header(&mut out, "batch_size", "Size of executed batches.", "summary");
    let _ = writeln!(out, "inferline_batch_size_sum {}", counters.batch_items_total);
    let _ = writeln!(out, "inferline_batch_size_count {}", counters.batches_total);

    header(
        &mut out,
        "http_requests_total",
        "HTTP requests by method, path and status.",
        "counter",
    );
    for h in &counters.http {
        let _ = writeln!(
            out,
            "inferline_http_requests_total{{method=\"{}\",path=\"{}\",status=\"{}\"}} {}",
            label(&h.method),
            label(&h.path),
            h.status,
            h.count
        );
    }

    out
}
