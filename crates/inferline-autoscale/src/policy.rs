//! Scaling policy and the per-metric desired-capacity computation.

use std::time::Duration;

use serde::Serialize;

use inferline_core::MetricSnapshot;
use inferline_core::config::AutoscalingConfig;

/// Ratios within this distance of 1.0 are treated as on target.
const TOLERANCE: f64 = 0.1;

/// Guards `ceil` against ratios like 2.0000000000000004.
const EPSILON: f64 = 1e-9;

/// A utilization signal the autoscaler can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMetric {
    Cpu,
    Memory,
    Requests,
    Gpu,
}

impl ScaleMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleMetric::Cpu => "cpu",
            ScaleMetric::Memory => "memory",
            ScaleMetric::Requests => "requests",
            ScaleMetric::Gpu => "gpu",
        }
    }
}

/// Autoscaling limits and targets, with durations already parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Target CPU utilization, percent.
    pub target_cpu: Option<f64>,
    /// Target memory utilization, percent.
    pub target_memory: Option<f64>,
    /// Requests per second one capacity unit should carry.
    pub requests_per_pod: Option<f64>,
    /// Target device memory utilization, 0.0–1.0.
    pub gpu_memory_threshold: Option<f64>,
    pub scale_up_step: u32,
    pub scale_down_step: u32,
    pub stabilization: Duration,
    pub scale_down_period: Duration,
}

impl ScalingPolicy {
    pub fn from_config(config: &AutoscalingConfig) -> Self {
        Self {
            min_replicas: config.min_replicas,
            max_replicas: config.max_replicas,
            target_cpu: config.target_cpu_utilization_percentage,
            target_memory: config.target_memory_utilization_percentage,
            requests_per_pod: config.requests_per_pod,
            gpu_memory_threshold: config.gpu_memory_threshold,
            scale_up_step: config.scale_up_step,
            scale_down_step: config.scale_down_step,
            stabilization: config.scale_down_stabilization(),
            scale_down_period: config.scale_down_period(),
        }
    }

    /// (metric, current, target) for every enabled target.
    fn signals(&self, snapshot: &MetricSnapshot) -> Vec<(ScaleMetric, f64, f64)> {
        let candidates = [
            (
                ScaleMetric::Cpu,
                snapshot.cpu_utilization * 100.0,
                self.target_cpu,
            ),
            (
                ScaleMetric::Memory,
                snapshot.memory_utilization * 100.0,
                self.target_memory,
            ),
            (
                ScaleMetric::Requests,
                snapshot.request_rate,
                self.requests_per_pod,
            ),
            (
                ScaleMetric::Gpu,
                snapshot.gpu_memory_utilization,
                self.gpu_memory_threshold,
            ),
        ];
        candidates
            .into_iter()
            .filter_map(|(metric, current, target)| {
                target
                    .filter(|t| *t > 0.0)
                    .map(|target| (metric, current, target))
            })
            .collect()
    }

    /// Desired capacity for each enabled metric, before clamping.
    pub fn desired_per_metric(&self, current: u32, snapshot: &MetricSnapshot) -> Vec<Desired> {
        let base = current.max(1) as f64;
        self.signals(snapshot)
            .into_iter()
            .map(|(metric, value, target)| {
                let ratio = value / target;
                let desired = if (ratio - 1.0).abs() <= TOLERANCE {
                    current
                } else {
                    (base * ratio - EPSILON).ceil().max(0.0) as u32
                };
                Desired {
                    metric,
                    value,
                    target,
                    desired,
                }
            })
            .collect()
    }

    /// Overall desired capacity: the maximum across metrics, clamped.
    ///
    /// With no enabled metric the current capacity is kept (clamped).
    pub fn desired(&self, current: u32, snapshot: &MetricSnapshot) -> Option<Desired> {
        let best = self
            .desired_per_metric(current, snapshot)
            .into_iter()
            .max_by_key(|d| d.desired)?;
        Some(Desired {
            desired: self.clamp(best.desired),
            ..best
        })
    }

    pub fn clamp(&self, n: u32) -> u32 {
        n.clamp(self.min_replicas, self.max_replicas.max(self.min_replicas))
    }
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self::from_config(&AutoscalingConfig::default())
    }
}

/// Desired capacity derived from one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Desired {
    pub metric: ScaleMetric,
    pub value: f64,
    pub target: f64,
    pub desired: u32,
}
