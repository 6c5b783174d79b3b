//! inferline.toml configuration parser.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! Durations are written as strings (`"50ms"`, `"15s"`, `"5m"`) and checked
//! once by [`ServeConfig::validate`] at startup.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub model: ModelConfig,
    pub server: ServerConfig,
    pub batching: BatchingConfig,
    pub cache: CacheConfig,
    pub executor: ExecutorConfig,
    pub metrics: MetricsConfig,
    pub autoscaling: AutoscalingConfig,
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub version: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "echo".to_string(),
            version: "latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Requests per batch before it closes.
    pub max_batch_size: usize,
    /// Maximum age of the oldest request in an open batch.
    pub max_wait: String,
    /// Queued requests (open batch + dispatch queue) before admission fails.
    pub max_queue_depth: usize,
    /// Deadline applied to requests that do not carry their own.
    pub request_timeout: String,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_wait: "50ms".to_string(),
            max_queue_depth: 1024,
            request_timeout: "30s".to_string(),
        }
    }
}

impl BatchingConfig {
    pub fn max_wait(&self) -> Duration {
        parse_duration(&self.max_wait).unwrap_or(Duration::from_millis(50))
    }

    pub fn request_timeout(&self) -> Duration {
        parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }
}

/// How cache entry sizes are estimated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheWeigher {
    /// Every entry costs one unit; capacity is an entry count.
    #[default]
    Entries,
    /// Entries cost their serialized JSON length; capacity is in bytes.
    Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(alias = "cache_size")]
    pub capacity: u64,
    pub weigh_by: CacheWeigher,
    /// Entries older than this are treated as stale and evicted on access.
    pub ttl: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            weigh_by: CacheWeigher::Entries,
            ttl: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl.as_deref().and_then(parse_duration)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Memory available to model execution on this node.
    pub memory_budget_bytes: u64,
    /// Fraction of the budget the executor may use.
    pub max_memory: f64,
    /// Memory one slot needs to run a full batch.
    pub slot_memory_bytes: u64,
    /// Explicit slot count, overriding the memory-derived value.
    pub max_slots: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 8 * 1024 * 1024 * 1024,
            max_memory: 0.9,
            slot_memory_bytes: 1024 * 1024 * 1024,
            max_slots: None,
        }
    }
}

impl ExecutorConfig {
    /// Number of executor slots this configuration allows.
    pub fn slot_count(&self) -> usize {
        if let Some(n) = self.max_slots {
            return n;
        }
        if self.slot_memory_bytes == 0 {
            return 0;
        }
        let usable = self.memory_budget_bytes as f64 * self.max_memory;
        (usable / self.slot_memory_bytes as f64).floor() as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Rolling window for rates, quantiles, and ratios.
    pub window: String,
    /// How often resource gauges are sampled.
    pub sample_interval: String,
    /// Restarts of this serving process, as reported by the orchestrator.
    pub restart_count: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: "5m".to_string(),
            sample_interval: "5s".to_string(),
            restart_count: 0,
        }
    }
}

impl MetricsConfig {
    pub fn window(&self) -> Duration {
        parse_duration(&self.window).unwrap_or(Duration::from_secs(300))
    }

    pub fn sample_interval(&self) -> Duration {
        parse_duration(&self.sample_interval).unwrap_or(Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalingConfig {
    #[serde(alias = "minReplicas")]
    pub min_replicas: u32,
    #[serde(alias = "maxReplicas")]
    pub max_replicas: u32,
    /// Capacity assumed at startup; defaults to `min_replicas`.
    pub initial_replicas: Option<u32>,
    pub interval: String,
    #[serde(alias = "targetCPUUtilizationPercentage")]
    pub target_cpu_utilization_percentage: Option<f64>,
    #[serde(alias = "targetMemoryUtilizationPercentage")]
    pub target_memory_utilization_percentage: Option<f64>,
    #[serde(alias = "requestsPerPod")]
    pub requests_per_pod: Option<f64>,
    #[serde(alias = "gpuMemoryThreshold")]
    pub gpu_memory_threshold: Option<f64>,
    pub scale_up_step: u32,
    pub scale_down_step: u32,
    pub scale_down_stabilization: String,
    pub scale_down_period: String,
}

impl Default for AutoscalingConfig {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 10,
            initial_replicas: None,
            interval: "15s".to_string(),
            target_cpu_utilization_percentage: Some(80.0),
            target_memory_utilization_percentage: Some(80.0),
            requests_per_pod: Some(100.0),
            gpu_memory_threshold: Some(0.9),
            scale_up_step: 2,
            scale_down_step: 1,
            scale_down_stabilization: "300s".to_string(),
            scale_down_period: "60s".to_string(),
        }
    }
}

impl AutoscalingConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(15))
    }

    pub fn scale_down_stabilization(&self) -> Duration {
        parse_duration(&self.scale_down_stabilization).unwrap_or(Duration::from_secs(300))
    }

    pub fn scale_down_period(&self) -> Duration {
        parse_duration(&self.scale_down_period).unwrap_or(Duration::from_secs(60))
    }

    pub fn initial_replicas(&self) -> u32 {
        self.initial_replicas
            .unwrap_or(self.min_replicas)
            .clamp(self.min_replicas, self.max_replicas.max(self.min_replicas))
    }
}

/// Metric an alert rule is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    ErrorRate,
    LatencyP95Ms,
    GpuMemoryUtilization,
    CacheUtilization,
    RequestRate,
    RestartCount,
}

impl AlertMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMetric::ErrorRate => "error_rate",
            AlertMetric::LatencyP95Ms => "latency_p95_ms",
            AlertMetric::GpuMemoryUtilization => "gpu_memory_utilization",
            AlertMetric::CacheUtilization => "cache_utilization",
            AlertMetric::RequestRate => "request_rate",
            AlertMetric::RestartCount => "restart_count",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    #[default]
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Ge => value >= threshold,
            Comparison::Lt => value < threshold,
            Comparison::Le => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    pub name: String,
    pub metric: AlertMetric,
    #[serde(default)]
    pub op: Comparison,
    pub threshold: f64,
    /// How long the condition must hold before the rule fires.
    #[serde(rename = "for", default = "zero_duration")]
    pub for_duration: String,
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default)]
    pub summary: Option<String>,
}

fn zero_duration() -> String {
    "0s".to_string()
}

fn default_severity() -> String {
    "warning".to_string()
}

impl AlertRuleConfig {
    fn new(name: &str, metric: AlertMetric, threshold: f64, for_duration: &str, severity: &str) -> Self {
        Self {
            name: name.to_string(),
            metric,
            op: Comparison::Gt,
            threshold,
            for_duration: for_duration.to_string(),
            severity: severity.to_string(),
            summary: None,
        }
    }

    pub fn for_duration(&self) -> Duration {
        parse_duration(&self.for_duration).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub interval: String,
    pub rules: Vec<AlertRuleConfig>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            interval: "15s".to_string(),
            rules: default_alert_rules(),
        }
    }
}

impl AlertsConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(15))
    }
}

/// The stock alerting rules shipped with the serving chart.
pub fn default_alert_rules() -> Vec<AlertRuleConfig> {
    vec![
        AlertRuleConfig::new("HighErrorRate", AlertMetric::ErrorRate, 0.05, "5m", "critical"),
        AlertRuleConfig::new("HighLatency", AlertMetric::LatencyP95Ms, 2000.0, "5m", "warning"),
        AlertRuleConfig::new(
            "HighGpuMemory",
            AlertMetric::GpuMemoryUtilization,
            0.9,
            "5m",
            "warning",
        ),
        AlertRuleConfig::new("CacheExhausted", AlertMetric::CacheUtilization, 0.95, "10m", "warning"),
        AlertRuleConfig::new("HighRequestRate", AlertMetric::RequestRate, 1000.0, "5m", "info"),
        AlertRuleConfig::new("FrequentRestarts", AlertMetric::RestartCount, 3.0, "0s", "critical"),
    ]
}

impl ServeConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ServeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field invariants. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.batching;
        if b.max_batch_size == 0 {
            return Err(invalid("batching.max_batch_size must be at least 1"));
        }
        if b.max_queue_depth < b.max_batch_size {
            return Err(invalid(format!(
                "batching.max_queue_depth ({}) must be >= max_batch_size ({})",
                b.max_queue_depth, b.max_batch_size
            )));
        }
        check_duration("batching.max_wait", &b.max_wait)?;
        check_duration("batching.request_timeout", &b.request_timeout)?;

        if self.cache.capacity == 0 {
            return Err(invalid("cache.capacity must be at least 1"));
        }
        if let Some(ttl) = &self.cache.ttl {
            check_duration("cache.ttl", ttl)?;
        }

        let e = &self.executor;
        if !(e.max_memory > 0.0 && e.max_memory <= 1.0) {
            return Err(invalid(format!(
                "executor.max_memory must be in (0, 1], got {}",
                e.max_memory
            )));
        }

        check_duration("metrics.window", &self.metrics.window)?;
        check_duration("metrics.sample_interval", &self.metrics.sample_interval)?;
        if self.metrics.window().is_zero() {
            return Err(invalid("metrics.window must be positive"));
        }

        let a = &self.autoscaling;
        if a.max_replicas == 0 {
            return Err(invalid("autoscaling.max_replicas must be at least 1"));
        }
        if a.min_replicas > a.max_replicas {
            return Err(invalid(format!(
                "autoscaling.min_replicas ({}) exceeds max_replicas ({})",
                a.min_replicas, a.max_replicas
            )));
        }
        if a.scale_up_step == 0 || a.scale_down_step == 0 {
            return Err(invalid("autoscaling step caps must be at least 1"));
        }
        for (key, target) in [
            ("target_cpu_utilization_percentage", a.target_cpu_utilization_percentage),
            ("target_memory_utilization_percentage", a.target_memory_utilization_percentage),
            ("requests_per_pod", a.requests_per_pod),
            ("gpu_memory_threshold", a.gpu_memory_threshold),
        ] {
            if let Some(v) = target
                && v <= 0.0
            {
                return Err(invalid(format!("autoscaling.{key} must be positive, got {v}")));
            }
        }
        check_duration("autoscaling.interval", &a.interval)?;
        check_duration("autoscaling.scale_down_stabilization", &a.scale_down_stabilization)?;
        check_duration("autoscaling.scale_down_period", &a.scale_down_period)?;

        check_duration("alerts.interval", &self.alerts.interval)?;
        let mut names = HashSet::new();
        for rule in &self.alerts.rules {
            if !names.insert(rule.name.as_str()) {
                return Err(invalid(format!("duplicate alert rule name: {}", rule.name)));
            }
            check_duration(&format!("alerts.rules.{}.for", rule.name), &rule.for_duration)?;
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Longest duration any setting may take.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

fn check_duration(key: &str, value: &str) -> Result<(), ConfigError> {
    let duration = parse_duration(value)
        .ok_or_else(|| invalid(format!("{key}: malformed duration {value:?}")))?;
    if duration > MAX_DURATION {
        return Err(invalid(format!("{key}: {value:?} exceeds one year")));
    }
    Ok(())
}

/// Parse a duration string like "5s", "500ms", "1m", "2h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()?
            .checked_mul(60)
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .parse::<u64>()
            .ok()?
            .checked_mul(3600)
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = ServeConfig::from_toml_str("").unwrap();
        assert_eq!(config.batching.max_batch_size, 32);
        assert_eq!(config.batching.max_wait(), Duration::from_millis(50));
        assert_eq!(config.cache.capacity, 1024);
        assert_eq!(config.autoscaling.interval(), Duration::from_secs(15));
        assert_eq!(config.alerts.rules.len(), 6);
        // 8 GiB * 0.9 / 1 GiB
        assert_eq!(config.executor.slot_count(), 7);
    }

    #[test]
    fn helm_style_keys_are_accepted() {
        let toml_str = r#"
[autoscaling]
minReplicas = 2
maxReplicas = 20
targetCPUUtilizationPercentage = 70
targetMemoryUtilizationPercentage = 75
requestsPerPod = 50
gpuMemoryThreshold = 0.85
"#;
        let config = ServeConfig::from_toml_str(toml_str).unwrap();
        let a = &config.autoscaling;
        assert_eq!(a.min_replicas, 2);
        assert_eq!(a.max_replicas, 20);
        assert_eq!(a.target_cpu_utilization_percentage, Some(70.0));
        assert_eq!(a.target_memory_utilization_percentage, Some(75.0));
        assert_eq!(a.requests_per_pod, Some(50.0));
        assert_eq!(a.gpu_memory_threshold, Some(0.85));
        assert_eq!(a.initial_replicas(), 2);
    }

    #[test]
    fn parse_alert_rules() {
        let toml_str = r#"
[[alerts.rules]]
name = "HighErrorRate"
metric = "error_rate"
threshold = 0.1
for = "5m"
severity = "critical"

[[alerts.rules]]
name = "LowTraffic"
metric = "request_rate"
op = "lt"
threshold = 1.0
"#;
        let config = ServeConfig::from_toml_str(toml_str).unwrap();
        let rules = &config.alerts.rules;
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].for_duration(), Duration::from_secs(300));
        assert_eq!(rules[1].op, Comparison::Lt);
        assert_eq!(rules[1].for_duration(), Duration::ZERO);
        assert_eq!(rules[1].severity, "warning");
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = ServeConfig::from_toml_str("[batching]\nmax_batch_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_queue_smaller_than_batch() {
        let toml_str = "[batching]\nmax_batch_size = 64\nmax_queue_depth = 10\n";
        assert!(ServeConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn rejects_inverted_replica_bounds() {
        let toml_str = "[autoscaling]\nmin_replicas = 5\nmax_replicas = 2\n";
        assert!(ServeConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn rejects_malformed_duration() {
        let toml_str = "[batching]\nmax_wait = \"soon\"\n";
        let err = ServeConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("batching.max_wait"));
    }

    #[test]
    fn rejects_max_memory_out_of_range() {
        let toml_str = "[executor]\nmax_memory = 1.5\n";
        assert!(ServeConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn rejects_duplicate_rule_names() {
        let toml_str = r#"
[[alerts.rules]]
name = "A"
metric = "error_rate"
threshold = 0.1

[[alerts.rules]]
name = "A"
metric = "request_rate"
threshold = 10.0
"#;
        assert!(ServeConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn explicit_slot_count_overrides_memory() {
        let executor = ExecutorConfig {
            max_slots: Some(3),
            ..Default::default()
        };
        assert_eq!(executor.slot_count(), 3);
    }

    #[test]
    fn slot_count_zero_when_budget_too_small() {
        let executor = ExecutorConfig {
            memory_budget_bytes: 512,
            slot_memory_bytes: 1024,
            ..Default::default()
        };
        assert_eq!(executor.slot_count(), 0);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ServeConfig::default();
        let rendered = config.to_toml_string().unwrap();
        let parsed = ServeConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.alerts.rules, config.alerts.rules);
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("50ms"), Some(Duration::from_millis(50)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("invalid"), None);
    }

    #[test]
    fn parse_duration_overflow_is_malformed() {
        assert_eq!(parse_duration("307445734561825861m"), None);
        assert_eq!(parse_duration("5124095576030432h"), None);
        let err = ServeConfig::from_toml_str("[batching]\nmax_wait = \"307445734561825861m\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("batching.max_wait"));
    }

    #[test]
    fn rejects_durations_beyond_a_year() {
        let toml_str = "[batching]\nrequest_timeout = \"18446744073709551615s\"\n";
        let err = ServeConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("batching.request_timeout"));

        let toml_str = "[cache]\nttl = \"9000h\"\n";
        assert!(ServeConfig::from_toml_str(toml_str).is_err());

        let toml_str = "[batching]\nrequest_timeout = \"8760h\"\n";
        assert!(ServeConfig::from_toml_str(toml_str).is_ok());
    }

    #[test]
    fn comparison_operators() {
        assert!(Comparison::Gt.holds(2.0, 1.0));
        assert!(!Comparison::Gt.holds(1.0, 1.0));
        assert!(Comparison::Ge.holds(1.0, 1.0));
        assert!(Comparison::Lt.holds(0.5, 1.0));
        assert!(Comparison::Le.holds(1.0, 1.0));
    }
}
