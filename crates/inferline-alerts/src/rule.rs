//! Alert rules and their per-rule phase tracking.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use inferline_core::MetricSnapshot;
use inferline_core::config::{AlertMetric, AlertRuleConfig, Comparison};

/// Phase of a single alert rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPhase {
    Resolved,
    Pending,
    Firing,
}

impl AlertPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertPhase::Resolved => "resolved",
            AlertPhase::Pending => "pending",
            AlertPhase::Firing => "firing",
        }
    }
}

/// A threshold rule over one snapshot metric.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub name: String,
    pub metric: AlertMetric,
    pub op: Comparison,
    pub threshold: f64,
    pub for_duration: Duration,
    pub severity: String,
    pub summary: Option<String>,
}

impl AlertRule {
    pub fn from_config(config: &AlertRuleConfig) -> Self {
        Self {
            name: config.name.clone(),
            metric: config.metric,
            op: config.op,
            threshold: config.threshold,
            for_duration: config.for_duration(),
            severity: config.severity.clone(),
            summary: config.summary.clone(),
        }
    }

    /// The snapshot value this rule compares.
    pub fn value(&self, snapshot: &MetricSnapshot) -> f64 {
        match self.metric {
            AlertMetric::ErrorRate => snapshot.error_rate,
            AlertMetric::LatencyP95Ms => snapshot.latency_p95_ms,
            AlertMetric::GpuMemoryUtilization => snapshot.gpu_memory_utilization,
            AlertMetric::CacheUtilization => snapshot.cache_utilization,
            AlertMetric::RequestRate => snapshot.request_rate,
            AlertMetric::RestartCount => snapshot.restart_count as f64,
        }
    }

    pub fn holds(&self, value: f64) -> bool {
        self.op.holds(value, self.threshold)
    }
}

/// Tracks the phase of one rule across evaluations.
#[derive(Debug)]
pub struct RuleTracker {
    phase: AlertPhase,
    /// When the condition most recently became true.
    active_since: Option<Instant>,
    /// When the current phase was entered.
    phase_since: Option<Instant>,
    for_duration: Duration,
}

impl RuleTracker {
    pub fn new(for_duration: Duration) -> Self {
        Self {
            phase: AlertPhase::Resolved,
            active_since: None,
            phase_since: None,
            for_duration,
        }
    }

    /// Record one evaluation; returns `(from, to)` if the phase changed.
    pub fn record(&mut self, condition: bool, now: Instant) -> Option<(AlertPhase, AlertPhase)> {
        let from = self.phase;
        let to = if condition {
            let since = *self.active_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= self.for_duration {
                AlertPhase::Firing
            } else {
                AlertPhase::Pending
            }
        } else {
            self.active_since = None;
            AlertPhase::Resolved
        };

        if to == from {
            return None;
        }
        self.phase = to;
        self.phase_since = Some(now);
        Some((from, to))
    }

    pub fn phase(&self) -> AlertPhase {
        self.phase
    }

    pub fn active_since(&self) -> Option<Instant> {
        self.active_since
    }

    pub fn phase_since(&self) -> Option<Instant> {
        self.phase_since
    }
}

/// Log a phase change at a level matching its weight.
pub(crate) fn log_transition(rule: &AlertRule, from: AlertPhase, to: AlertPhase, value: f64) {
    match to {
        AlertPhase::Firing => warn!(
            rule = %rule.name,
            severity = %rule.severity,
            metric = rule.metric.as_str(),
            value,
            threshold = rule.threshold,
            "alert firing"
        ),
        AlertPhase::Resolved if from == AlertPhase::Firing => info!(
            rule = %rule.name,
            metric = rule.metric.as_str(),
            value,
            "alert resolved"
        ),
        _ => debug!(
            rule = %rule.name,
            from = from.as_str(),
            to = to.as_str(),
            value,
            "alert phase changed"
        ),
    }
}
