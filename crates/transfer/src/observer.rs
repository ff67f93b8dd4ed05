//! Progress and connection event sinks.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chunkfetch_protocol::{DownloadMetrics, ProgressSnapshot};
use tracing::{error, info, warn};

use crate::error::{RemoteError, TransferError};

/// Receives transfer events.
///
/// Callbacks run on worker tasks and must not block. Connection callbacks
/// default to no-ops.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);

    fn on_error(&self, error: &TransferError);

    /// Invoked exactly once per download, on every terminal path.
    fn on_complete(&self, metrics: &DownloadMetrics);

    fn on_searching_host(&self, _host: &str) {}

    fn on_connecting(&self, _host: &str, _attempt: u32) {}

    fn on_authenticating(&self, _host: &str) {}

    fn on_connected(&self, _host: &str) {}

    fn on_connection_error(&self, _host: &str, _attempt: u32, _error: &RemoteError) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}
    fn on_error(&self, _error: &TransferError) {}
    fn on_complete(&self, _metrics: &DownloadMetrics) {}
}

// ---------------------------------------------------------------------------
// CompositeObserver
// ---------------------------------------------------------------------------

/// Fans events out to several observers in registration order.
///
/// A sink that panics is logged and skipped; later sinks still receive the
/// event.
#[derive(Default, Clone)]
pub struct CompositeObserver {
    sinks: Vec<Arc<dyn ProgressObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Arc<dyn ProgressObserver>) {
        self.sinks.push(sink);
    }

    pub fn with(mut self, sink: Arc<dyn ProgressObserver>) -> Self {
        self.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn each(&self, event: &str, f: impl Fn(&dyn ProgressObserver)) {
        for (i, sink) in self.sinks.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| f(sink.as_ref()))).is_err() {
                warn!(sink = i, event, "progress observer panicked");
            }
        }
    }
}

impl ProgressObserver for CompositeObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.each("progress", |s| s.on_progress(snapshot));
    }

    fn on_error(&self, error: &TransferError) {
        self.each("error", |s| s.on_error(error));
    }

    fn on_complete(&self, metrics: &DownloadMetrics) {
        self.each("complete", |s| s.on_complete(metrics));
    }

    fn on_searching_host(&self, host: &str) {
        self.each("searching_host", |s| s.on_searching_host(host));
    }

    fn on_connecting(&self, host: &str, attempt: u32) {
        self.each("connecting", |s| s.on_connecting(host, attempt));
    }

    fn on_authenticating(&self, host: &str) {
        self.each("authenticating", |s| s.on_authenticating(host));
    }

    fn on_connected(&self, host: &str) {
        self.each("connected", |s| s.on_connected(host));
    }

    fn on_connection_error(&self, host: &str, attempt: u32, err: &RemoteError) {
        self.each("connection_error", |s| {
            s.on_connection_error(host, attempt, err)
        });
    }
}

// ---------------------------------------------------------------------------
// TracingObserver
// ---------------------------------------------------------------------------

/// Logs progress at every 10% step, plus errors and completion.
#[derive(Debug, Default)]
pub struct TracingObserver {
    last_step: AtomicU32,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressObserver for TracingObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let step = (snapshot.percent() / 10.0).floor().clamp(0.0, 10.0) as u32;
        if self.last_step.fetch_max(step, Ordering::AcqRel) < step {
            info!(
                percent = step * 10,
                bytes = snapshot.bytes_transferred,
                total = snapshot.total_bytes,
                chunks = snapshot.completed_chunks,
                total_chunks = snapshot.total_chunks,
                speed_mbps = snapshot.speed_mbps(),
                eta_secs = snapshot.eta_secs.map(|s| s.round() as u64),
                "download progress"
            );
        }
    }

    fn on_error(&self, err: &TransferError) {
        error!(error = %err, "download error");
    }

    fn on_complete(&self, m: &DownloadMetrics) {
        info!(
            success = m.success,
            cancelled = m.cancelled,
            bytes = m.bytes_transferred,
            chunks = m.completed_chunks,
            retries = m.retry_count,
            elapsed_ms = m.elapsed_ms,
            avg_mbps = m.average_speed_mbps(),
            "download finished"
        );
    }

    fn on_connecting(&self, host: &str, attempt: u32) {
        info!(host, attempt, "connecting");
    }

    fn on_connected(&self, host: &str) {
        info!(host, "connected");
    }

    fn on_connection_error(&self, host: &str, attempt: u32, err: &RemoteError) {
        warn!(host, attempt, error = %err, "connection attempt failed");
    }
}
