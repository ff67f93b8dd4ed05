use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of chunks fetched concurrently.
pub const DEFAULT_MAX_PARALLEL_CHUNKS: usize = 8;

/// Per-transfer tuning consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Nominal chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Upper bound on chunks in flight.
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,

    /// Aggregate read ceiling in bytes/second (0 = unlimited).
    #[serde(default)]
    pub max_bytes_per_second: u64,

    /// Attempts per chunk before the transfer is declared failed.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Base backoff between chunk attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Ceiling applied to the doubled backoff.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Per-read timeout while filling a chunk.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Reserved. No checksum is computed yet.
    #[serde(default = "default_true")]
    pub validate_checksum: bool,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_parallel_chunks() -> usize {
    DEFAULT_MAX_PARALLEL_CHUNKS
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_read_timeout_ms() -> u64 {
    300_000
}

fn default_true() -> bool {
    true
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_parallel_chunks: default_max_parallel_chunks(),
            max_bytes_per_second: 0,
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            validate_checksum: default_true(),
        }
    }
}

impl TransferConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Backoff to wait after the given failed attempt (1-based).
    ///
    /// Doubles from `retry_delay_ms` and is capped at `max_retry_delay_ms`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let ms = self
            .retry_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_retry_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Lifecycle of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Planning,
    FetchingChunks,
    Assembling,
    Completed,
    Failed,
}

impl TransferPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::FetchingChunks => "fetching_chunks",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a running transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Rolling average over the tracker window, in bytes/second.
    pub speed_bytes_per_sec: f64,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub active_workers: usize,
    /// Seconds remaining; absent while the speed is unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Returns completion percentage (0.0 - 100.0).
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
    }

    pub fn eta(&self) -> Option<Duration> {
        self.eta_secs.map(Duration::from_secs_f64)
    }

    pub fn speed_mbps(&self) -> f64 {
        self.speed_bytes_per_sec / (1024.0 * 1024.0)
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Closing summary handed to `on_complete` on every terminal path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadMetrics {
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub retry_count: u32,
    pub elapsed_ms: u64,
    pub average_speed_bytes_per_sec: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_latency_ms: Option<f64>,
    pub success: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Never populated; kept for forward compatibility.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl DownloadMetrics {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn average_speed_mbps(&self) -> f64 {
        self.average_speed_bytes_per_sec / (1024.0 * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(bytes: u64, total: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_transferred: bytes,
            total_bytes: total,
            speed_bytes_per_sec: 0.0,
            completed_chunks: 0,
            total_chunks: 0,
            active_workers: 0,
            eta_secs: None,
            elapsed_ms: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn transfer_config_defaults() {
        let cfg = TransferConfig::default();
        assert_eq!(cfg.chunk_size, 4 * 1024 * 1024);
        assert_eq!(cfg.max_parallel_chunks, 8);
        assert_eq!(cfg.max_bytes_per_second, 0);
        assert_eq!(cfg.retry_count, 3);
        assert_eq!(cfg.retry_delay_ms, 1_000);
        assert!(cfg.validate_checksum);
    }

    #[test]
    fn transfer_config_partial_json() {
        let cfg: TransferConfig = serde_json::from_str(r#"{"chunk_size":1024}"#).unwrap();
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.max_parallel_chunks, DEFAULT_MAX_PARALLEL_CHUNKS);
        assert_eq!(cfg.max_retry_delay_ms, 30_000);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let cfg = TransferConfig {
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 5_000,
            ..TransferConfig::default()
        };
        assert_eq!(cfg.backoff_for_attempt(1), Duration::from_secs(1));
        assert_eq!(cfg.backoff_for_attempt(2), Duration::from_secs(2));
        assert_eq!(cfg.backoff_for_attempt(3), Duration::from_secs(4));
        assert_eq!(cfg.backoff_for_attempt(4), Duration::from_secs(5));
        assert_eq!(cfg.backoff_for_attempt(200), Duration::from_secs(5));
    }

    #[test]
    fn phase_terminal_states() {
        assert!(TransferPhase::Completed.is_terminal());
        assert!(TransferPhase::Failed.is_terminal());
        assert!(!TransferPhase::FetchingChunks.is_terminal());
        assert_eq!(TransferPhase::FetchingChunks.to_string(), "fetching_chunks");
    }

    #[test]
    fn snapshot_percent() {
        assert!((snapshot(500, 1000).percent() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_percent_zero_total() {
        assert!((snapshot(0, 0).percent() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_omits_unknown_eta() {
        let json = serde_json::to_string(&snapshot(1, 2)).unwrap();
        assert!(!json.contains("etaSecs"));
        assert!(json.contains("bytesTransferred"));
    }

    #[test]
    fn metrics_field_names() {
        let now = Utc::now();
        let m = DownloadMetrics {
            total_bytes: 10,
            bytes_transferred: 10,
            completed_chunks: 1,
            total_chunks: 1,
            retry_count: 0,
            elapsed_ms: 1_500,
            average_speed_bytes_per_sec: 2.0 * 1024.0 * 1024.0,
            peak_memory_bytes: None,
            average_cpu_percent: Some(12.5),
            network_latency_ms: None,
            success: true,
            cancelled: false,
            error_message: None,
            started_at: now,
            finished_at: now,
            checksum: None,
        };
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("averageCpuPercent"));
        assert!(!json.contains("checksum"));
        assert!(!json.contains("peakMemoryBytes"));
        assert_eq!(m.elapsed(), Duration::from_millis(1_500));
        assert!((m.average_speed_mbps() - 2.0).abs() < 1e-9);

        let parsed: DownloadMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, m);
    }
}
