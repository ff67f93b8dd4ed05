use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate resource sample. `None` marks a facility that could not be read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_memory_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_free_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_throughput_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_throughput_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_stable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tcp_connections: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

/// Outcome of a single health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub component: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl CheckResult {
    pub fn pass(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            passed: true,
            details: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn fail(component: impl Into<String>) -> Self {
        Self {
            passed: false,
            ..Self::pass(component)
        }
    }

    /// A probe whose OS facility is unavailable. Passes so one missing
    /// counter never blocks an otherwise healthy system.
    pub fn skipped(component: impl Into<String>, reason: &str) -> Self {
        Self::pass(component).with_detail(format!("skipped: {reason}"))
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Latency/jitter/loss classification of a probe burst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStability {
    pub samples: u32,
    pub replies: u32,
    pub packet_loss_percent: f64,
    pub jitter_ms: f64,
    pub average_latency_ms: f64,
    pub stable: bool,
}

/// Result of a full health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<CheckResult>,
    pub resources: ResourceMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stability: Option<NetworkStability>,
}

impl HealthReport {
    /// Logical AND of every individual check.
    pub fn overall_status(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn check(&self, component: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.component == component)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== System Health Report ===")?;
        writeln!(f, "Generated: {}", self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f)?;

        for check in &self.checks {
            let status = if check.passed { "OK" } else { "PROBLEM" };
            writeln!(f, "[{status}] {}", check.component)?;
            for detail in &check.details {
                writeln!(f, "  - {detail}")?;
            }
            for warning in &check.warnings {
                writeln!(f, "  ! {warning}")?;
            }
        }

        let r = &self.resources;
        writeln!(f)?;
        writeln!(f, "Resources:")?;
        writeln!(f, "  CPU: {}", fmt_opt(r.cpu_percent, "%"))?;
        writeln!(f, "  Available memory: {}", fmt_opt(r.available_memory_mb, " MB"))?;
        writeln!(f, "  Disk free: {}", fmt_opt(r.disk_free_percent, "%"))?;
        writeln!(f, "  Disk throughput: {}", fmt_opt(r.disk_throughput_mbps, " MB/s"))?;
        writeln!(f, "  Network throughput: {}", fmt_opt(r.network_throughput_mbps, " MB/s"))?;
        writeln!(f, "  Network latency: {}", fmt_opt(r.network_latency_ms, " ms"))?;
        if let Some(stable) = r.network_stable {
            writeln!(f, "  Network stable: {}", if stable { "yes" } else { "no" })?;
        }
        if let Some(conns) = r.active_tcp_connections {
            writeln!(f, "  Active TCP connections: {conns}")?;
        }
        if let Some(up) = r.uptime_secs {
            writeln!(f, "  Uptime: {}h {}m", up / 3600, (up % 3600) / 60)?;
        }

        writeln!(f)?;
        let overall = if self.overall_status() { "HEALTHY" } else { "ISSUES DETECTED" };
        write!(f, "Overall status: {overall}")
    }
}

fn fmt_opt(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{v:.1}{unit}"),
        None => "n/a".into(),
    }
}

/// Admission thresholds for starting a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// CPU usage must be strictly below this.
    #[serde(default = "default_max_cpu")]
    pub max_cpu_percent: f64,

    /// Available memory must be strictly above this.
    #[serde(default = "default_min_memory")]
    pub min_available_memory_mb: f64,

    #[serde(default = "default_min_disk_free")]
    pub min_disk_free_percent: f64,

    /// Network throughput must be strictly above this (0 disables).
    #[serde(default = "default_min_network")]
    pub min_network_throughput_mbps: f64,

    /// Connectivity latency above this only raises a warning.
    #[serde(default = "default_latency_warning")]
    pub latency_warning_ms: f64,

    #[serde(default = "default_max_loss")]
    pub max_packet_loss_percent: f64,

    #[serde(default = "default_max_jitter")]
    pub max_jitter_ms: f64,

    #[serde(default = "default_max_avg_latency")]
    pub max_average_latency_ms: f64,

    /// Connection count above this only raises a warning.
    #[serde(default = "default_max_tcp")]
    pub max_tcp_connections: u32,
}

fn default_max_cpu() -> f64 {
    80.0
}
fn default_min_memory() -> f64 {
    1024.0
}
fn default_min_disk_free() -> f64 {
    10.0
}
fn default_min_network() -> f64 {
    1.0
}
fn default_latency_warning() -> f64 {
    200.0
}
fn default_max_loss() -> f64 {
    5.0
}
fn default_max_jitter() -> f64 {
    30.0
}
fn default_max_avg_latency() -> f64 {
    100.0
}
fn default_max_tcp() -> u32 {
    100
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_cpu_percent: default_max_cpu(),
            min_available_memory_mb: default_min_memory(),
            min_disk_free_percent: default_min_disk_free(),
            min_network_throughput_mbps: default_min_network(),
            latency_warning_ms: default_latency_warning(),
            max_packet_loss_percent: default_max_loss(),
            max_jitter_ms: default_max_jitter(),
            max_average_latency_ms: default_max_avg_latency(),
            max_tcp_connections: default_max_tcp(),
        }
    }
}

impl HealthThresholds {
    /// Decides whether a transfer may start given `report`.
    ///
    /// Criteria whose metric is unavailable are skipped.
    pub fn admits(&self, report: &HealthReport) -> bool {
        if !report.overall_status() {
            return false;
        }
        let r = &report.resources;
        let network_ok = self.min_network_throughput_mbps <= 0.0
            || r
                .network_throughput_mbps
                .is_none_or(|n| n > self.min_network_throughput_mbps);

        r.cpu_percent.is_none_or(|c| c < self.max_cpu_percent)
            && r
                .available_memory_mb
                .is_none_or(|m| m > self.min_available_memory_mb)
            && network_ok
            && r.network_stable.unwrap_or(true)
    }

    /// Classifies a burst of latency samples. `None` entries are lost probes.
    pub fn classify_stability(&self, samples: &[Option<f64>]) -> NetworkStability {
        let replies: Vec<f64> = samples.iter().flatten().copied().collect();
        let total = samples.len() as u32;
        let ok = replies.len() as u32;

        if ok == 0 {
            return NetworkStability {
                samples: total,
                replies: 0,
                packet_loss_percent: 100.0,
                jitter_ms: 0.0,
                average_latency_ms: 0.0,
                stable: false,
            };
        }

        let loss = (total - ok) as f64 / total as f64 * 100.0;
        let average = replies.iter().sum::<f64>() / ok as f64;
        let jitter = if replies.len() < 2 {
            0.0
        } else {
            replies.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>()
                / (replies.len() - 1) as f64
        };

        NetworkStability {
            samples: total,
            replies: ok,
            packet_loss_percent: loss,
            jitter_ms: jitter,
            average_latency_ms: average,
            stable: loss < self.max_packet_loss_percent
                && jitter < self.max_jitter_ms
                && average < self.max_average_latency_ms,
        }
    }
}

/// Health probing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub thresholds: HealthThresholds,

    /// `host:port` reached by the TCP connect latency probe.
    #[serde(default = "default_probe_target")]
    pub probe_target: String,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_stability_samples")]
    pub stability_samples: u32,

    #[serde(default = "default_stability_interval_ms")]
    pub stability_interval_ms: u64,

    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Samples kept per metric by the continuous monitor.
    #[serde(default = "default_history_len")]
    pub history_len: usize,

    /// Filesystem whose free space is checked.
    #[serde(default = "default_disk_path")]
    pub disk_path: String,
}

fn default_probe_target() -> String {
    "8.8.8.8:53".into()
}
fn default_probe_timeout_ms() -> u64 {
    1_000
}
fn default_stability_samples() -> u32 {
    20
}
fn default_stability_interval_ms() -> u64 {
    100
}
fn default_monitor_interval_ms() -> u64 {
    1_000
}
fn default_history_len() -> usize {
    60
}
fn default_disk_path() -> String {
    ".".into()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            thresholds: HealthThresholds::default(),
            probe_target: default_probe_target(),
            probe_timeout_ms: default_probe_timeout_ms(),
            stability_samples: default_stability_samples(),
            stability_interval_ms: default_stability_interval_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            history_len: default_history_len(),
            disk_path: default_disk_path(),
        }
    }
}
