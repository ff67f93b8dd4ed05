//! Continuous resource monitoring for the lifetime of a transfer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chunkfetch_protocol::ResourceMetrics;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::gate::HealthGate;

/// Callback invoked with each resource sample.
pub type MetricsSink = Box<dyn Fn(&ResourceMetrics) + Send + Sync + 'static>;

/// Bounded rolling history of one metric.
#[derive(Debug, Clone)]
pub struct MetricHistory {
    values: VecDeque<f64>,
    capacity: usize,
}

impl MetricHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn average(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::max)
    }
}

impl HealthGate {
    /// Samples the lightweight metrics watched during a transfer.
    pub async fn sample_resources(&self) -> ResourceMetrics {
        let p = self.probe().as_ref();
        let (cpu, memory, disk_tp, net_tp) = tokio::join!(
            p.cpu_percent(),
            p.available_memory_mb(),
            p.disk_throughput_mbps(),
            p.network_throughput_mbps(),
        );
        ResourceMetrics {
            cpu_percent: cpu,
            available_memory_mb: memory,
            disk_throughput_mbps: disk_tp,
            network_throughput_mbps: net_tp,
            ..ResourceMetrics::default()
        }
    }

    /// Spawns the monitor loop.
    ///
    /// Runs until `cancel` fires; the handle then resolves quietly.
    pub fn start_continuous_monitoring(
        self: &Arc<Self>,
        cancel: CancellationToken,
        sink: Option<MetricsSink>,
    ) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        let interval = Duration::from_millis(self.config().monitor_interval_ms.max(1));
        tokio::spawn(async move {
            monitor_loop(gate, interval, cancel, sink).await;
        })
    }
}

/// Rolling histories for the monitored metrics.
struct Histories {
    cpu: MetricHistory,
    memory: MetricHistory,
    disk: MetricHistory,
    network: MetricHistory,
}

impl Histories {
    fn new(capacity: usize) -> Self {
        Self {
            cpu: MetricHistory::new(capacity),
            memory: MetricHistory::new(capacity),
            disk: MetricHistory::new(capacity),
            network: MetricHistory::new(capacity),
        }
    }

    fn record(&mut self, sample: &ResourceMetrics) {
        record_metric(&mut self.cpu, "cpu", "%", sample.cpu_percent);
        record_metric(&mut self.memory, "memory", "MB", sample.available_memory_mb);
        record_metric(&mut self.disk, "disk_io", "MB/s", sample.disk_throughput_mbps);
        record_metric(&mut self.network, "network", "MB/s", sample.network_throughput_mbps);
    }
}

fn record_metric(history: &mut MetricHistory, metric: &str, unit: &str, value: Option<f64>) {
    let Some(value) = value else {
        return;
    };
    history.push(value);
    debug!(
        metric,
        unit,
        value,
        avg = history.average().unwrap_or(value),
        min = history.min().unwrap_or(value),
        max = history.max().unwrap_or(value),
        "resource sample"
    );
}

async fn monitor_loop(
    gate: Arc<HealthGate>,
    interval: Duration,
    cancel: CancellationToken,
    sink: Option<MetricsSink>,
) {
    let mut histories = Histories::new(gate.config().history_len);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the first immediate tick.
    ticker.tick().await;

    info!(interval_ms = interval.as_millis() as u64, "resource monitor started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let sample = tokio::select! {
                    _ = cancel.cancelled() => break,
                    sample = gate.sample_resources() => sample,
                };
                histories.record(&sample);
                if let Some(sink) = &sink {
                    sink(&sample);
                }
            }
        }
    }
    info!(samples = histories.cpu.len(), "resource monitor stopped");
}
