//! Resource probing capability.
//!
//! [`ResourceProbe`] is what the health gate, the continuous monitor and the
//! progress tracker query. [`SystemProbe`] reads the host; [`FixedProbe`]
//! returns canned values.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chunkfetch_protocol::ResourceMetrics;
use tracing::trace;

use crate::platform;

/// Boxed future returned by probe methods. `None` means unavailable.
pub type ProbeFuture<'a, T> = Pin<Box<dyn Future<Output = Option<T>> + Send + 'a>>;

/// Window used to prime delta-based counters on their first read.
const PRIME_WINDOW: Duration = Duration::from_millis(250);

/// Source of system resource readings.
///
/// Only the four gate inputs are required; the rest default to unavailable.
pub trait ResourceProbe: Send + Sync {
    fn cpu_percent(&self) -> ProbeFuture<'_, f64>;

    fn available_memory_mb(&self) -> ProbeFuture<'_, f64>;

    fn disk_free_percent(&self) -> ProbeFuture<'_, f64>;

    /// Round-trip to the probe target. `None` means the probe was lost.
    fn ping_latency_ms(&self) -> ProbeFuture<'_, f64>;

    fn disk_throughput_mbps(&self) -> ProbeFuture<'_, f64> {
        Box::pin(async { None })
    }

    fn network_throughput_mbps(&self) -> ProbeFuture<'_, f64> {
        Box::pin(async { None })
    }

    fn active_tcp_connections(&self) -> ProbeFuture<'_, u32> {
        Box::pin(async { None })
    }

    fn uptime_secs(&self) -> ProbeFuture<'_, u64> {
        Box::pin(async { None })
    }

    fn peak_memory_bytes(&self) -> ProbeFuture<'_, u64> {
        Box::pin(async { None })
    }
}

// ---------------------------------------------------------------------------
// SystemProbe
// ---------------------------------------------------------------------------

/// Reads the local host through the platform readers.
pub struct SystemProbe {
    disk_path: PathBuf,
    probe_target: String,
    probe_timeout: Duration,
    cpu: Mutex<Option<(u64, u64)>>,
    network: RateSampler,
    disk: RateSampler,
}

impl SystemProbe {
    pub fn new(
        disk_path: impl Into<PathBuf>,
        probe_target: impl Into<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            disk_path: disk_path.into(),
            probe_target: probe_target.into(),
            probe_timeout,
            cpu: Mutex::new(None),
            network: RateSampler::default(),
            disk: RateSampler::default(),
        }
    }

    async fn sample_cpu(&self) -> Option<f64> {
        let current = platform::read_cpu_times()?;
        let previous = self.cpu.lock().unwrap().replace(current);

        let (before, after) = match previous {
            Some(prev) if current.1 > prev.1 => (prev, current),
            _ => {
                tokio::time::sleep(PRIME_WINDOW).await;
                let later = platform::read_cpu_times()?;
                *self.cpu.lock().unwrap() = Some(later);
                (current, later)
            }
        };

        let d_total = after.1.saturating_sub(before.1);
        if d_total == 0 {
            return None;
        }
        let d_idle = after.0.saturating_sub(before.0);
        let pct = (1.0 - d_idle as f64 / d_total as f64) * 100.0;
        Some(pct.clamp(0.0, 100.0))
    }
}

impl ResourceProbe for SystemProbe {
    fn cpu_percent(&self) -> ProbeFuture<'_, f64> {
        Box::pin(self.sample_cpu())
    }

    fn available_memory_mb(&self) -> ProbeFuture<'_, f64> {
        Box::pin(async {
            platform::read_available_memory().map(|b| b as f64 / (1024.0 * 1024.0))
        })
    }

    fn disk_free_percent(&self) -> ProbeFuture<'_, f64> {
        Box::pin(async { platform::read_disk_free_percent(&self.disk_path) })
    }

    fn ping_latency_ms(&self) -> ProbeFuture<'_, f64> {
        Box::pin(tcp_latency_ms(&self.probe_target, self.probe_timeout))
    }

    fn disk_throughput_mbps(&self) -> ProbeFuture<'_, f64> {
        Box::pin(async {
            self.disk
                .per_second(platform::read_disk_bytes)
                .await
                .map(to_mbps)
        })
    }

    fn network_throughput_mbps(&self) -> ProbeFuture<'_, f64> {
        Box::pin(async {
            self.network
                .per_second(platform::read_network_bytes)
                .await
                .map(to_mbps)
        })
    }

    fn active_tcp_connections(&self) -> ProbeFuture<'_, u32> {
        Box::pin(async { platform::read_tcp_connections() })
    }

    fn uptime_secs(&self) -> ProbeFuture<'_, u64> {
        Box::pin(async { platform::read_uptime_secs() })
    }

    fn peak_memory_bytes(&self) -> ProbeFuture<'_, u64> {
        Box::pin(async { platform::read_peak_rss() })
    }
}

fn to_mbps(bytes_per_sec: f64) -> f64 {
    bytes_per_sec / (1024.0 * 1024.0)
}

/// Measures a TCP connect round-trip. Works without raw-socket privileges.
pub async fn tcp_latency_ms(target: &str, timeout: Duration) -> Option<f64> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => Some(started.elapsed().as_secs_f64() * 1000.0),
        Ok(Err(e)) => {
            trace!(addr = %target, error = %e, "latency probe failed");
            None
        }
        Err(_) => {
            trace!(addr = %target, "latency probe timed out");
            None
        }
    }
}

/// Turns a cumulative counter into a per-second rate between reads.
#[derive(Default)]
struct RateSampler {
    prev: Mutex<Option<(Instant, u64)>>,
}

impl RateSampler {
    async fn per_second(&self, read: fn() -> Option<u64>) -> Option<f64> {
        let now = Instant::now();
        let current = read()?;
        let previous = self.prev.lock().unwrap().replace((now, current));

        let ((t0, v0), (t1, v1)) = match previous {
            Some((then, before)) if now > then && current >= before => {
                ((then, before), (now, current))
            }
            _ => {
                tokio::time::sleep(PRIME_WINDOW).await;
                let later = read()?;
                let at = Instant::now();
                *self.prev.lock().unwrap() = Some((at, later));
                ((now, current), (at, later))
            }
        };

        let secs = t1.duration_since(t0).as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(v1.saturating_sub(v0) as f64 / secs)
    }
}

// ---------------------------------------------------------------------------
// FixedProbe
// ---------------------------------------------------------------------------

/// Probe that returns fixed readings.
///
/// Useful when the host should not be consulted, and in tests.
#[derive(Debug, Clone, Default)]
pub struct FixedProbe {
    pub metrics: ResourceMetrics,
    pub peak_memory_bytes: Option<u64>,
}

impl FixedProbe {
    pub fn new(metrics: ResourceMetrics) -> Self {
        Self {
            metrics,
            peak_memory_bytes: None,
        }
    }

    /// Readings that pass every default threshold.
    pub fn healthy() -> Self {
        Self::new(ResourceMetrics {
            cpu_percent: Some(10.0),
            available_memory_mb: Some(8192.0),
            disk_free_percent: Some(50.0),
            disk_throughput_mbps: Some(50.0),
            network_throughput_mbps: Some(10.0),
            network_latency_ms: Some(5.0),
            network_stable: None,
            active_tcp_connections: Some(4),
            uptime_secs: Some(3_600),
        })
    }
}

impl ResourceProbe for FixedProbe {
    fn cpu_percent(&self) -> ProbeFuture<'_, f64> {
        let v = self.metrics.cpu_percent;
        Box::pin(async move { v })
    }

    fn available_memory_mb(&self) -> ProbeFuture<'_, f64> {
        let v = self.metrics.available_memory_mb;
        Box::pin(async move { v })
    }

    fn disk_free_percent(&self) -> ProbeFuture<'_, f64> {
        let v = self.metrics.disk_free_percent;
        Box::pin(async move { v })
    }

    fn ping_latency_ms(&self) -> ProbeFuture<'_, f64> {
        let v = self.metrics.network_latency_ms;
        Box::pin(async move { v })
    }

    fn disk_throughput_mbps(&self) -> ProbeFuture<'_, f64> {
        let v = self.metrics.disk_throughput_mbps;
        Box::pin(async move { v })
    }

    fn network_throughput_mbps(&self) -> ProbeFuture<'_, f64> {
        let v = self.metrics.network_throughput_mbps;
        Box::pin(async move { v })
    }

    fn active_tcp_connections(&self) -> ProbeFuture<'_, u32> {
        let v = self.metrics.active_tcp_connections;
        Box::pin(async move { v })
    }

    fn uptime_secs(&self) -> ProbeFuture<'_, u64> {
        let v = self.metrics.uptime_secs;
        Box::pin(async move { v })
    }

    fn peak_memory_bytes(&self) -> ProbeFuture<'_, u64> {
        let v = self.peak_memory_bytes;
        Box::pin(async move { v })
    }
}
