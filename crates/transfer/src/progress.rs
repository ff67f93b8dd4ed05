use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chunkfetch_protocol::{DownloadMetrics, ProgressSnapshot, ResourceMetrics, TransferPhase};
use chunkfetch_telemetry::ResourceProbe;
use tokio::time::Instant;

/// Default speed window.
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Samples closer together than this are merged into one slot.
const SLOT: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed over a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    window_size: Duration,
    started: Instant,
}

impl SpeedCalculator {
    /// Creates a new calculator. `window_size` defaults to 5 s.
    pub fn new(window_size: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                window_size: window_size.unwrap_or(DEFAULT_WINDOW),
                started: Instant::now(),
            }),
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();

        match s.samples.last_mut() {
            Some(last) if now.duration_since(last.timestamp) < SLOT => last.bytes += bytes,
            _ => s.samples.push(SpeedSample {
                bytes,
                timestamp: now,
            }),
        }
        s.prune(now);
    }

    /// Average bytes/second within the window.
    ///
    /// Before a full window has passed the average covers the time since
    /// creation or the last reset.
    pub fn bytes_per_second(&self) -> f64 {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        s.prune(now);

        let span = now.duration_since(s.started).min(s.window_size);
        if span.is_zero() {
            return 0.0;
        }
        let total: u64 = s.samples.iter().map(|sample| sample.bytes).sum();
        total as f64 / span.as_secs_f64()
    }

    /// Clears all recorded samples and restarts the window.
    pub fn reset(&self) {
        let mut s = self.inner.lock().unwrap();
        s.samples.clear();
        s.started = Instant::now();
    }
}

impl SpeedInner {
    fn prune(&mut self, now: Instant) {
        let window = self.window_size;
        self.samples
            .retain(|sample| now.duration_since(sample.timestamp) <= window);
    }
}

/// Time to move `remaining` bytes at `bytes_per_sec`. `None` while the speed
/// is unknown.
pub fn eta(remaining: u64, bytes_per_sec: f64) -> Option<Duration> {
    if bytes_per_sec <= 0.0 || !bytes_per_sec.is_finite() {
        return None;
    }
    Some(Duration::from_secs_f64(remaining as f64 / bytes_per_sec))
}

// ---------------------------------------------------------------------------
// ProgressTracker
// ---------------------------------------------------------------------------

/// How a transfer ended, for [`ProgressTracker::final_metrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    Cancelled,
    Failed(String),
}

/// Counters for one transfer, shared by every worker.
pub struct ProgressTracker {
    started: Instant,
    started_at: DateTime<Utc>,
    total_bytes: AtomicU64,
    total_chunks: AtomicU32,
    bytes: AtomicU64,
    chunks: AtomicU32,
    retries: AtomicU32,
    active: AtomicUsize,
    phase: Mutex<TransferPhase>,
    speed: SpeedCalculator,
    cpu: Mutex<CpuAverage>,
    probe: Option<Arc<dyn ResourceProbe>>,
}

#[derive(Default)]
struct CpuAverage {
    sum: f64,
    count: u32,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            total_bytes: AtomicU64::new(0),
            total_chunks: AtomicU32::new(0),
            bytes: AtomicU64::new(0),
            chunks: AtomicU32::new(0),
            retries: AtomicU32::new(0),
            active: AtomicUsize::new(0),
            phase: Mutex::new(TransferPhase::Planning),
            speed: SpeedCalculator::new(None),
            cpu: Mutex::new(CpuAverage::default()),
            probe: None,
        }
    }

    /// Tracker that asks `probe` for peak memory and latency at the end.
    pub fn with_probe(probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            probe: Some(probe),
            ..Self::new()
        }
    }

    /// Sets the totals once the transfer has been planned.
    pub fn begin(&self, total_bytes: u64, total_chunks: u32) {
        self.total_bytes.store(total_bytes, Ordering::Release);
        self.total_chunks.store(total_chunks, Ordering::Release);
    }

    pub fn set_phase(&self, phase: TransferPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    pub fn phase(&self) -> TransferPhase {
        *self.phase.lock().unwrap()
    }

    pub fn record_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::AcqRel);
        self.speed.add_sample(n);
    }

    /// Rolls back bytes counted by an attempt that was later abandoned.
    pub fn discard_bytes(&self, n: u64) {
        let _ = self
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
                Some(b.saturating_sub(n))
            });
    }

    pub fn record_chunk_completed(&self) {
        self.chunks.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks a worker active until the guard is dropped.
    pub fn worker(&self) -> ActiveWorker<'_> {
        self.active.fetch_add(1, Ordering::AcqRel);
        ActiveWorker { tracker: self }
    }

    /// Folds a monitor sample into the run's averages.
    pub fn record_resource_sample(&self, sample: &ResourceMetrics) {
        if let Some(cpu) = sample.cpu_percent {
            let mut avg = self.cpu.lock().unwrap();
            avg.sum += cpu;
            avg.count += 1;
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn completed_chunks(&self) -> u32 {
        self.chunks.load(Ordering::Acquire)
    }

    pub fn retry_count(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let bytes = self.bytes_transferred();
        let total = self.total_bytes.load(Ordering::Acquire);
        let speed = self.speed.bytes_per_second();
        ProgressSnapshot {
            bytes_transferred: bytes,
            total_bytes: total,
            speed_bytes_per_sec: speed,
            completed_chunks: self.completed_chunks(),
            total_chunks: self.total_chunks.load(Ordering::Acquire),
            active_workers: self.active_workers(),
            eta_secs: eta(total.saturating_sub(bytes), speed).map(|d| d.as_secs_f64()),
            elapsed_ms: self.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    fn average_cpu(&self) -> Option<f64> {
        let avg = self.cpu.lock().unwrap();
        (avg.count > 0).then(|| avg.sum / f64::from(avg.count))
    }

    /// Builds the closing metrics for `completion`.
    pub async fn final_metrics(&self, completion: Completion) -> DownloadMetrics {
        let (peak_memory, latency) = match &self.probe {
            Some(p) => tokio::join!(p.peak_memory_bytes(), p.ping_latency_ms()),
            None => (None, None),
        };

        let elapsed = self.elapsed();
        let bytes = self.bytes_transferred();
        let average_speed = if elapsed.is_zero() {
            0.0
        } else {
            bytes as f64 / elapsed.as_secs_f64()
        };

        let (success, cancelled, error_message) = match completion {
            Completion::Succeeded => (true, false, None),
            Completion::Cancelled => (false, true, None),
            Completion::Failed(msg) => (false, false, Some(msg)),
        };

        DownloadMetrics {
            total_bytes: self.total_bytes.load(Ordering::Acquire),
            bytes_transferred: bytes,
            completed_chunks: self.completed_chunks(),
            total_chunks: self.total_chunks.load(Ordering::Acquire),
            retry_count: self.retry_count(),
            elapsed_ms: elapsed.as_millis() as u64,
            average_speed_bytes_per_sec: average_speed,
            peak_memory_bytes: peak_memory,
            average_cpu_percent: self.average_cpu(),
            network_latency_ms: latency,
            success,
            cancelled,
            error_message,
            started_at: self.started_at,
            finished_at: Utc::now(),
            checksum: None,
        }
    }
}

/// Guard returned by [`ProgressTracker::worker`].
pub struct ActiveWorker<'a> {
    tracker: &'a ProgressTracker,
}

impl Drop for ActiveWorker<'_> {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkfetch_telemetry::FixedProbe;

    #[tokio::test(start_paused = true)]
    async fn speed_calculator_no_samples() {
        let calc = SpeedCalculator::new(None);
        assert_eq!(calc.bytes_per_second(), 0.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_calculator_averages_over_elapsed() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(10)));
        tokio::time::advance(Duration::from_secs(2)).await;
        calc.add_sample(1_000);
        calc.add_sample(1_000);
        assert_eq!(calc.bytes_per_second(), 1_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_calculator_drops_old_samples() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(5)));
        calc.add_sample(10_000);
        tokio::time::advance(Duration::from_secs(6)).await;
        calc.add_sample(5_000);
        assert_eq!(calc.bytes_per_second(), 1_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_calculator_reset() {
        let calc = SpeedCalculator::new(None);
        tokio::time::advance(Duration::from_secs(1)).await;
        calc.add_sample(100);
        calc.reset();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_calculator_concurrent_access() {
        use std::thread;

        let calc = Arc::new(SpeedCalculator::new(None));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let c = Arc::clone(&calc);
                thread::spawn(move || {
                    for _ in 0..100 {
                        c.add_sample(1);
                        let _ = c.bytes_per_second();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let _ = calc.bytes_per_second();
    }

    #[test]
    fn eta_needs_known_speed() {
        assert_eq!(eta(1_000, 0.0), None);
        assert_eq!(eta(1_000, f64::NAN), None);
        assert_eq!(eta(1_000, 500.0), Some(Duration::from_secs(2)));
        assert_eq!(eta(0, 500.0), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_snapshot_counts() {
        let tracker = ProgressTracker::new();
        tracker.begin(4_000, 4);
        tokio::time::advance(Duration::from_secs(1)).await;
        tracker.record_bytes(1_000);
        tracker.record_chunk_completed();

        let snap = tracker.snapshot();
        assert_eq!(snap.bytes_transferred, 1_000);
        assert_eq!(snap.total_bytes, 4_000);
        assert_eq!(snap.completed_chunks, 1);
        assert_eq!(snap.total_chunks, 4);
        assert_eq!(snap.percent(), 25.0);
        assert_eq!(snap.speed_bytes_per_sec, 1_000.0);
        assert_eq!(snap.eta_secs, Some(3.0));
        assert_eq!(snap.elapsed_ms, 1_000);
    }

    #[test]
    fn tracker_discard_rolls_back() {
        let tracker = ProgressTracker::new();
        tracker.record_bytes(500);
        tracker.discard_bytes(200);
        assert_eq!(tracker.bytes_transferred(), 300);
        tracker.discard_bytes(1_000);
        assert_eq!(tracker.bytes_transferred(), 0);
    }

    #[test]
    fn worker_guard_tracks_active() {
        let tracker = ProgressTracker::new();
        let a = tracker.worker();
        let b = tracker.worker();
        assert_eq!(tracker.snapshot().active_workers, 2);
        drop(a);
        assert_eq!(tracker.active_workers(), 1);
        drop(b);
        assert_eq!(tracker.active_workers(), 0);
    }

    #[test]
    fn phase_transitions() {
        let tracker = ProgressTracker::new();
        assert_eq!(tracker.phase(), TransferPhase::Planning);
        tracker.set_phase(TransferPhase::FetchingChunks);
        assert_eq!(tracker.phase(), TransferPhase::FetchingChunks);
    }

    #[tokio::test(start_paused = true)]
    async fn final_metrics_success() {
        let probe = FixedProbe {
            peak_memory_bytes: Some(64 * 1024 * 1024),
            ..FixedProbe::healthy()
        };
        let tracker = ProgressTracker::with_probe(Arc::new(probe));
        tracker.begin(2_000, 2);
        tracker.record_resource_sample(&ResourceMetrics {
            cpu_percent: Some(20.0),
            ..Default::default()
        });
        tracker.record_resource_sample(&ResourceMetrics {
            cpu_percent: Some(40.0),
            ..Default::default()
        });
        tracker.record_resource_sample(&ResourceMetrics::default());
        tokio::time::advance(Duration::from_secs(2)).await;
        tracker.record_bytes(2_000);
        tracker.record_chunk_completed();
        tracker.record_chunk_completed();
        tracker.record_retry();

        let m = tracker.final_metrics(Completion::Succeeded).await;
        assert!(m.success);
        assert!(!m.cancelled);
        assert_eq!(m.error_message, None);
        assert_eq!(m.completed_chunks, 2);
        assert_eq!(m.retry_count, 1);
        assert_eq!(m.average_speed_bytes_per_sec, 1_000.0);
        assert_eq!(m.average_cpu_percent, Some(30.0));
        assert_eq!(m.network_latency_ms, Some(5.0));
        assert_eq!(m.peak_memory_bytes, Some(64 * 1024 * 1024));
        assert_eq!(m.checksum, None);
    }

    #[tokio::test]
    async fn final_metrics_failure_and_cancel() {
        let tracker = ProgressTracker::new();
        let failed = tracker.final_metrics(Completion::Failed("boom".into())).await;
        assert!(!failed.success);
        assert!(!failed.cancelled);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert_eq!(failed.average_cpu_percent, None);
        assert_eq!(failed.peak_memory_bytes, None);

        let cancelled = tracker.final_metrics(Completion::Cancelled).await;
        assert!(cancelled.cancelled);
        assert!(!cancelled.success);
    }
}
