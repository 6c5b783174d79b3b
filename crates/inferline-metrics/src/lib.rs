//! inferline-metrics — observability for the serving core.
//!
//! One [`MetricsAggregator`] is built at startup and shared (by `Arc`) with
//! every component that reports or reads metrics.
//!
//! # Architecture
//!
//! ```text
//! MetricsAggregator
//!   ├── record_completion() ← every delivered response
//!   ├── record_error()      ← every rejected or failed request
//!   ├── record_batch()      ← every executed batch (slot busy time)
//!   ├── record_queue_depth(), update_resources(), update_cache()
//!   └── snapshot() → MetricSnapshot (autoscaler, alert evaluator)
//!
//! Rolling window
//!   └── one bucket per second, latency histogram per bucket
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics
//! ```

pub mod collector;
pub mod prometheus;
pub mod resources;
pub mod window;

pub use collector::{HttpCount, MetricCounters, MetricsAggregator, ResourceUsage};
pub use prometheus::render_prometheus;
pub use resources::read_rss_bytes;
