use std::path::PathBuf;
use std::sync::Arc;

use chunkfetch_protocol::{DownloadMetrics, TransferConfig};
use chunkfetch_telemetry::HealthGate;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::observer::ProgressObserver;
use crate::progress::ProgressTracker;

/// What to do with the pre-flight health verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthPolicy {
    /// Refuse to start on an unhealthy verdict.
    #[default]
    Enforce,
    /// Log the report and continue.
    WarnOnly,
    /// Do not run the pre-flight check.
    Skip,
}

/// One file to download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub config: TransferConfig,
}

impl DownloadRequest {
    pub fn new(remote_path: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            config: TransferConfig::default(),
        }
    }

    pub fn with_config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }
}

/// How a download that did not fail ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Completed(DownloadMetrics),
    Cancelled(DownloadMetrics),
}

impl DownloadOutcome {
    pub fn metrics(&self) -> &DownloadMetrics {
        match self {
            Self::Completed(m) | Self::Cancelled(m) => m,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Everything one orchestrator run needs. Built per call, never reused.
pub struct TransferContext {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub config: TransferConfig,
    pub cancel: CancellationToken,
    pub tracker: Arc<ProgressTracker>,
    pub observer: Arc<dyn ProgressObserver>,
    pub health: Option<Arc<HealthGate>>,
}

impl TransferContext {
    pub fn new(
        request: &DownloadRequest,
        observer: Arc<dyn ProgressObserver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            remote_path: request.remote_path.clone(),
            local_path: request.local_path.clone(),
            config: request.config.clone(),
            cancel,
            tracker: Arc::new(ProgressTracker::new()),
            observer,
            health: None,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_health(mut self, gate: Arc<HealthGate>) -> Self {
        self.health = Some(gate);
        self
    }
}
