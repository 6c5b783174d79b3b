//! Autoscaler — turns metric snapshots into capacity targets.
//!
//! Keeps the capacity it last applied, the recent history of desired
//! values for scale-down stabilization, and the time of the last
//! scale-down. Applying a target is delegated to an optional callback.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use inferline_core::{MetricSnapshot, SnapshotSource, epoch_secs};

use crate::policy::{Desired, ScaleMetric, ScalingPolicy};

/// A change of capacity target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingDecision {
    pub previous: u32,
    pub target: u32,
    /// Clamped desired capacity before step caps.
    pub desired: u32,
    pub metric: ScaleMetric,
    pub reason: String,
    /// Unix seconds.
    pub timestamp: u64,
}

/// Current capacity as published to readers (the status endpoint).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityStatus {
    pub current: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub last_decision: Option<ScalingDecision>,
}

/// Callback type for applying a capacity target.
pub type ScaleCallback = Box<dyn Fn(&ScalingDecision) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>;

pub struct Autoscaler {
    policy: ScalingPolicy,
    current: u32,
    /// Desired values inside the stabilization window, oldest first.
    history: VecDeque<(Instant, u32)>,
    /// Start of the current run of ticks with desired < current.
    below_since: Option<Instant>,
    last_scale_down: Option<Instant>,
    status: watch::Sender<CapacityStatus>,
    scale_fn: Option<ScaleCallback>,
}

impl Autoscaler {
    /// Create an autoscaler starting at `initial` capacity (clamped).
    pub fn new(policy: ScalingPolicy, initial: u32) -> Self {
        let current = policy.clamp(initial);
        let (status, _) = watch::channel(CapacityStatus {
            current,
            min_replicas: policy.min_replicas,
            max_replicas: policy.max_replicas,
            last_decision: None,
        });
        Self {
            policy,
            current,
            history: VecDeque::new(),
            below_since: None,
            last_scale_down: None,
            status,
            scale_fn: None,
        }
    }

    /// Set the callback used to apply capacity targets.
    pub fn with_scale_fn(mut self, f: ScaleCallback) -> Self {
        self.scale_fn = Some(f);
        self
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Receiver that always holds the latest capacity status.
    pub fn subscribe(&self) -> watch::Receiver<CapacityStatus> {
        self.status.subscribe()
    }

    pub fn tick(&mut self, snapshot: &MetricSnapshot) -> Option<ScalingDecision> {
        self.tick_at(snapshot, Instant::now())
    }

    /// Evaluate one snapshot at `now`; returns a decision only when the
    /// capacity target changes.
    pub fn tick_at(&mut self, snapshot: &MetricSnapshot, now: Instant) -> Option<ScalingDecision> {
        let desired = self.policy.desired(self.current, snapshot)?;

        self.history.push_back((now, desired.desired));
        while let Some((at, _)) = self.history.front()
            && now.saturating_duration_since(*at) > self.policy.stabilization
        {
            self.history.pop_front();
        }

        let c = self.current;
        if desired.desired > c {
            self.below_since = None;
            let target = desired.desired.min(c.saturating_add(self.policy.scale_up_step));
            return Some(self.apply(target, &desired, "above target"));
        }

        if desired.desired == c {
            self.below_since = None;
            return None;
        }

        let since = *self.below_since.get_or_insert(now);
        let stable_for = now.saturating_duration_since(since);
        if stable_for < self.policy.stabilization {
            debug!(
                current = c,
                desired = desired.desired,
                stable_secs = stable_for.as_secs(),
                "scale-down pending stabilization"
            );
            return None;
        }
        if let Some(last) = self.last_scale_down
            && now.saturating_duration_since(last) < self.policy.scale_down_period
        {
            return None;
        }

        // Every desired value in the window is below `c` here.
        let window_max = self
            .history
            .iter()
            .map(|(_, d)| *d)
            .max()
            .unwrap_or(desired.desired);
        let floor = c.saturating_sub(self.policy.scale_down_step);
        let target = self.policy.clamp(window_max.max(floor));
        if target >= c {
            return None;
        }
        self.last_scale_down = Some(now);
        Some(self.apply(target, &desired, "below target"))
    }

    fn apply(&mut self, target: u32, desired: &Desired, direction: &str) -> ScalingDecision {
        let decision = ScalingDecision {
            previous: self.current,
            target,
            desired: desired.desired,
            metric: desired.metric,
            reason: format!(
                "{} {direction}: {:.2} vs {:.2}",
                desired.metric.as_str(),
                desired.value,
                desired.target
            ),
            timestamp: epoch_secs(),
        };
        self.current = target;
        info!(
            from = decision.previous,
            to = decision.target,
            desired = decision.desired,
            metric = decision.metric.as_str(),
            reason = %decision.reason,
            "capacity target changed"
        );
        self.status.send_modify(|s| {
            s.current = target;
            s.last_decision = Some(decision.clone());
        });
        decision
    }

    /// Read one snapshot, evaluate it and apply any decision.
    pub async fn evaluate(&mut self, source: &dyn SnapshotSource) -> anyhow::Result<Option<ScalingDecision>> {
        let snapshot = source.snapshot()?;
        let decision = self.tick(&snapshot);

        if let Some(decision) = &decision
            && let Some(ref scale_fn) = self.scale_fn
            && let Err(e) = scale_fn(decision).await
        {
            warn!(
                target = decision.target,
                error = %e,
                "scaling action failed"
            );
        }

        Ok(decision)
    }

    /// Run the autoscaler loop.
    pub async fn run(
        &mut self,
        source: Arc<dyn SnapshotSource>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = interval.as_secs(),
            capacity = self.current,
            "autoscaler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.evaluate(source.as_ref()).await {
                        tracing::error!(error = %e, "autoscaler evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn cpu_policy() -> ScalingPolicy {
        ScalingPolicy {
            min_replicas: 1,
            max_replicas: 20,
            target_cpu: Some(80.0),
            target_memory: None,
            requests_per_pod: None,
            gpu_memory_threshold: None,
            scale_up_step: 2,
            scale_down_step: 1,
            stabilization: Duration::from_secs(300),
            scale_down_period: Duration::from_secs(60),
        }
    }

    fn cpu(utilization: f64) -> MetricSnapshot {
        MetricSnapshot {
            cpu_utilization: utilization,
            ..MetricSnapshot::default()
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn scale_up_applies_on_same_tick() {
        let policy = ScalingPolicy {
            scale_up_step: 10,
            ..cpu_policy()
        };
        let mut scaler = Autoscaler::new(policy, 4);
        let decision = scaler.tick_at(&cpu(1.6), Instant::now()).unwrap();
        assert_eq!(decision.previous, 4);
        assert_eq!(decision.desired, 8);
        assert_eq!(decision.target, 8);
        assert_eq!(decision.metric, ScaleMetric::Cpu);
        assert_eq!(scaler.current(), 8);
    }

    #[test]
    fn scale_up_is_step_capped() {
        let mut scaler = Autoscaler::new(cpu_policy(), 2);
        let t0 = Instant::now();
        // 4x target wants 8.
        let first = scaler.tick_at(&cpu(3.2), t0).unwrap();
        assert_eq!((first.desired, first.target), (8, 4));
        // Same relative load at 4 units still wants more.
        let second = scaler.tick_at(&cpu(3.2), t0 + secs(15)).unwrap();
        assert_eq!(second.target, 6);
    }

    #[test]
    fn scale_up_respects_max() {
        let policy = ScalingPolicy {
            max_replicas: 5,
            scale_up_step: 10,
            ..cpu_policy()
        };
        let mut scaler = Autoscaler::new(policy, 4);
        let d = scaler.tick_at(&cpu(4.0), Instant::now()).unwrap();
        assert_eq!(d.target, 5);
    }

    #[test]
    fn steady_load_emits_nothing() {
        let mut scaler = Autoscaler::new(cpu_policy(), 3);
        let t0 = Instant::now();
        for i in 0..10 {
            assert!(scaler.tick_at(&cpu(0.8), t0 + secs(i * 15)).is_none());
        }
        assert_eq!(scaler.current(), 3);
    }

    #[test]
    fn scale_down_waits_for_stabilization() {
        let mut scaler = Autoscaler::new(cpu_policy(), 4);
        let t0 = Instant::now();
        let low = cpu(0.2);

        for t in [0, 100, 200, 299] {
            assert!(scaler.tick_at(&low, t0 + secs(t)).is_none(), "tick at {t}s");
        }
        let d = scaler.tick_at(&low, t0 + secs(300)).unwrap();
        assert_eq!((d.previous, d.target), (4, 3));

        // One step per period.
        assert!(scaler.tick_at(&low, t0 + secs(330)).is_none());
        let d = scaler.tick_at(&low, t0 + secs(360)).unwrap();
        assert_eq!(d.target, 2);
    }

    #[test]
    fn transient_spike_restarts_stabilization() {
        let mut scaler = Autoscaler::new(cpu_policy(), 4);
        let t0 = Instant::now();
        assert!(scaler.tick_at(&cpu(0.2), t0).is_none());
        assert!(scaler.tick_at(&cpu(0.2), t0 + secs(200)).is_none());
        // Back on target for one tick.
        assert!(scaler.tick_at(&cpu(0.8), t0 + secs(250)).is_none());
        assert!(scaler.tick_at(&cpu(0.2), t0 + secs(300)).is_none());
        assert!(scaler.tick_at(&cpu(0.2), t0 + secs(500)).is_none());
        assert!(scaler.tick_at(&cpu(0.2), t0 + secs(600)).is_some());
    }

    #[test]
    fn scale_down_uses_highest_desired_in_window() {
        let policy = ScalingPolicy {
            scale_down_step: 3,
            ..cpu_policy()
        };
        let mut scaler = Autoscaler::new(policy, 6);
        let t0 = Instant::now();
        // 40% -> desired 3, then 20% -> desired 2.
        assert!(scaler.tick_at(&cpu(0.4), t0).is_none());
        assert!(scaler.tick_at(&cpu(0.2), t0 + secs(150)).is_none());
        let d = scaler.tick_at(&cpu(0.2), t0 + secs(300)).unwrap();
        assert_eq!(d.desired, 2);
        assert_eq!(d.target, 3);
    }

    #[test]
    fn never_below_min() {
        let policy = ScalingPolicy {
            min_replicas: 2,
            stabilization: Duration::ZERO,
            scale_down_period: Duration::ZERO,
            ..cpu_policy()
        };
        let mut scaler = Autoscaler::new(policy, 3);
        let t0 = Instant::now();
        assert_eq!(scaler.tick_at(&cpu(0.0), t0).unwrap().target, 2);
        assert!(scaler.tick_at(&cpu(0.0), t0 + secs(1)).is_none());
    }

    #[test]
    fn initial_capacity_is_clamped() {
        assert_eq!(Autoscaler::new(cpu_policy(), 0).current(), 1);
        assert_eq!(Autoscaler::new(cpu_policy(), 99).current(), 20);
    }

    #[test]
    fn status_tracks_last_decision() {
        let mut scaler = Autoscaler::new(cpu_policy(), 2);
        let status = scaler.subscribe();
        assert!(status.borrow().last_decision.is_none());

        scaler.tick_at(&cpu(1.6), Instant::now()).unwrap();
        let status = status.borrow();
        assert_eq!(status.current, 4);
        assert_eq!(status.last_decision.as_ref().unwrap().target, 4);
    }

    struct Fixed(MetricSnapshot);

    impl SnapshotSource for Fixed {
        fn snapshot(&self) -> anyhow::Result<MetricSnapshot> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    impl SnapshotSource for Broken {
        fn snapshot(&self) -> anyhow::Result<MetricSnapshot> {
            anyhow::bail!("metrics unavailable")
        }
    }

    #[tokio::test]
    async fn evaluate_invokes_callback() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&applied);
        let mut scaler = Autoscaler::new(cpu_policy(), 2).with_scale_fn(Box::new(move |d: &ScalingDecision| -> BoxFuture {
            sink.lock().unwrap().push(d.target);
            Box::pin(async { Ok(()) })
        }));

        let decision = scaler.evaluate(&Fixed(cpu(1.6))).await.unwrap();
        assert_eq!(decision.unwrap().target, 4);
        assert_eq!(*applied.lock().unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn evaluate_surfaces_source_errors() {
        let mut scaler = Autoscaler::new(cpu_policy(), 2);
        assert!(scaler.evaluate(&Broken).await.is_err());
        assert_eq!(scaler.current(), 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let mut scaler = Autoscaler::new(cpu_policy(), 2);
        let status = scaler.subscribe();
        let source: Arc<dyn SnapshotSource> = Arc::new(Fixed(cpu(1.6)));

        let handle = tokio::spawn(async move {
            scaler.run(source, Duration::from_millis(10), rx).await;
            scaler.current()
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let current = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(current > 2);
        assert_eq!(status.borrow().current, current);
    }
}
