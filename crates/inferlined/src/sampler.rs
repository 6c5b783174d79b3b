//! Periodic resource sampling into the metrics aggregator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use inferline_cache::ResultCache;
use inferline_executor::{ModelBinding, SlotPool};
use inferline_metrics::{MetricsAggregator, ResourceUsage, read_rss_bytes};

/// Feeds gauges that nothing on the request path updates: process memory,
/// device memory, cache occupancy and slot usage.
pub struct ResourceSampler {
    metrics: Arc<MetricsAggregator>,
    model: Arc<dyn ModelBinding>,
    cache: Arc<ResultCache>,
    pool: Arc<SlotPool>,
}

impl ResourceSampler {
    pub fn new(
        metrics: Arc<MetricsAggregator>,
        model: Arc<dyn ModelBinding>,
        cache: Arc<ResultCache>,
        pool: Arc<SlotPool>,
    ) -> Self {
        Self {
            metrics,
            model,
            cache,
            pool,
        }
    }

    /// Take one sample.
    pub fn sample(&self) -> ResourceUsage {
        let device = self.model.device_memory();
        let usage = ResourceUsage {
            memory_bytes: read_rss_bytes().unwrap_or(0),
            gpu_used_bytes: device.map(|d| d.used_bytes).unwrap_or(0),
            gpu_total_bytes: device.map(|d| d.total_bytes).unwrap_or(0),
        };
        self.metrics.update_resources(usage);
        self.metrics.update_cache(&self.cache.stats());
        self.metrics.update_slots(self.pool.busy());
        debug!(
            rss_bytes = usage.memory_bytes,
            gpu_used_bytes = usage.gpu_used_bytes,
            slots_busy = self.pool.busy(),
            "resources sampled"
        );
        usage
    }

    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "resource sampler started");
        self.sample();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sample();
                }
                _ = shutdown.changed() => {
                    info!("resource sampler shutting down");
                    break;
                }
            }
        }
    }
}
