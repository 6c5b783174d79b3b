//! Alert evaluator — runs every rule against each snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use inferline_core::config::AlertsConfig;
use inferline_core::{MetricSnapshot, SnapshotSource, epoch_secs};

use crate::rule::{AlertPhase, AlertRule, RuleTracker, log_transition};

/// A phase change of one rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertTransition {
    pub rule: String,
    pub severity: String,
    pub metric: &'static str,
    pub from: AlertPhase,
    pub to: AlertPhase,
    pub value: f64,
    pub threshold: f64,
    pub summary: Option<String>,
    /// Unix seconds.
    pub timestamp: u64,
}

/// Current state of one rule, as reported on the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertState {
    pub rule: String,
    pub severity: String,
    pub metric: &'static str,
    pub phase: AlertPhase,
    /// Value seen at the last evaluation.
    pub value: Option<f64>,
    pub threshold: f64,
    /// Seconds the condition has held, while pending or firing.
    pub active_for_secs: Option<u64>,
}

/// Callback invoked for every transition.
pub type AlertCallback = Arc<dyn Fn(AlertTransition) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

struct RuleSlot {
    rule: AlertRule,
    tracker: RuleTracker,
    last_value: Option<f64>,
}

pub struct AlertEvaluator {
    rules: Vec<RuleSlot>,
    last_evaluated: Option<Instant>,
    states: watch::Sender<Vec<AlertState>>,
    on_transition: Option<AlertCallback>,
}

impl AlertEvaluator {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        let rules: Vec<RuleSlot> = rules
            .into_iter()
            .map(|rule| RuleSlot {
                tracker: RuleTracker::new(rule.for_duration),
                rule,
                last_value: None,
            })
            .collect();
        let (states, _) = watch::channel(Vec::new());
        let evaluator = Self {
            rules,
            last_evaluated: None,
            states,
            on_transition: None,
        };
        evaluator.publish(Instant::now());
        evaluator
    }

    pub fn from_config(config: &AlertsConfig) -> Self {
        Self::new(config.rules.iter().map(AlertRule::from_config).collect())
    }

    /// Set a callback for rule transitions.
    pub fn with_callback(mut self, callback: AlertCallback) -> Self {
        self.on_transition = Some(callback);
        self
    }

    /// Receiver that always holds the latest rule states.
    pub fn subscribe(&self) -> watch::Receiver<Vec<AlertState>> {
        self.states.subscribe()
    }

    pub fn evaluate(&mut self, snapshot: &MetricSnapshot) -> Vec<AlertTransition> {
        self.evaluate_at(snapshot, Instant::now())
    }

    /// Evaluate every rule against `snapshot` at `now`.
    pub fn evaluate_at(&mut self, snapshot: &MetricSnapshot, now: Instant) -> Vec<AlertTransition> {
        let timestamp = epoch_secs();
        let mut transitions = Vec::new();

        for slot in &mut self.rules {
            let value = slot.rule.value(snapshot);
            slot.last_value = Some(value);
            let condition = slot.rule.holds(value);

            if let Some((from, to)) = slot.tracker.record(condition, now) {
                log_transition(&slot.rule, from, to, value);
                transitions.push(AlertTransition {
                    rule: slot.rule.name.clone(),
                    severity: slot.rule.severity.clone(),
                    metric: slot.rule.metric.as_str(),
                    from,
                    to,
                    value,
                    threshold: slot.rule.threshold,
                    summary: slot.rule.summary.clone(),
                    timestamp,
                });
            }
        }

        self.last_evaluated = Some(now);
        self.publish(now);
        transitions
    }

    fn publish(&self, now: Instant) {
        let states = self.states_at(now);
        self.states.send_replace(states);
    }

    pub fn states(&self) -> Vec<AlertState> {
        self.states_at(self.last_evaluated.unwrap_or_else(Instant::now))
    }

    fn states_at(&self, now: Instant) -> Vec<AlertState> {
        self.rules
            .iter()
            .map(|slot| AlertState {
                rule: slot.rule.name.clone(),
                severity: slot.rule.severity.clone(),
                metric: slot.rule.metric.as_str(),
                phase: slot.tracker.phase(),
                value: slot.last_value,
                threshold: slot.rule.threshold,
                active_for_secs: slot
                    .tracker
                    .active_since()
                    .map(|since| now.saturating_duration_since(since).as_secs()),
            })
            .collect()
    }

    /// Rules currently firing.
    pub fn firing(&self) -> Vec<String> {
        self.rules
            .iter()
            .filter(|slot| slot.tracker.phase() == AlertPhase::Firing)
            .map(|slot| slot.rule.name.clone())
            .collect()
    }

    /// Read one snapshot, evaluate it and report transitions.
    pub async fn tick(&mut self, source: &dyn SnapshotSource) -> anyhow::Result<Vec<AlertTransition>> {
        let snapshot = source.snapshot()?;
        let transitions = self.evaluate(&snapshot);
        if let Some(ref cb) = self.on_transition {
            for transition in &transitions {
                cb(transition.clone()).await;
            }
        }
        Ok(transitions)
    }

    /// Run the evaluation loop.
    pub async fn run(
        &mut self,
        source: Arc<dyn SnapshotSource>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = interval.as_secs(),
            rules = self.rules.len(),
            "alert evaluator started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick(source.as_ref()).await {
                        tracing::error!(error = %e, "alert evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("alert evaluator shutting down");
                    break;
                }
            }
        }
    }
}
