//! Top-level download entry point.

use std::sync::Arc;

use chunkfetch_telemetry::HealthGate;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::connect::{ConnectPolicy, connect_with_retry};
use crate::error::{RemoteError, TransferError};
use crate::observer::ProgressObserver;
use crate::orchestrator::{TransferOrchestrator, TransferSummary};
use crate::pool::BufferPool;
use crate::progress::{Completion, ProgressTracker};
use crate::remote::RemoteSource;
use crate::types::{DownloadOutcome, DownloadRequest, HealthPolicy, TransferContext};
use crate::validation::{validate_config, validate_destination, validate_remote_path};

/// Validates, health-checks, connects and downloads.
///
/// The buffer pool is shared by every download run through the service.
pub struct DownloadService {
    source: Arc<dyn RemoteSource>,
    pool: BufferPool,
    health: Option<Arc<HealthGate>>,
    policy: HealthPolicy,
    connect_policy: ConnectPolicy,
}

impl DownloadService {
    pub fn new(source: Arc<dyn RemoteSource>) -> Self {
        Self {
            source,
            pool: BufferPool::new(),
            health: None,
            policy: HealthPolicy::default(),
            connect_policy: ConnectPolicy::default(),
        }
    }

    pub fn with_pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    /// Enables the pre-flight check and continuous monitoring.
    pub fn with_health(mut self, gate: Arc<HealthGate>) -> Self {
        self.health = Some(gate);
        self
    }

    pub fn with_health_policy(mut self, policy: HealthPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_connect_policy(mut self, policy: ConnectPolicy) -> Self {
        self.connect_policy = policy;
        self
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Downloads one file.
    ///
    /// `observer.on_complete` runs exactly once whatever the outcome. Failures
    /// are reported through `on_error` first; cancellation is not an error
    /// and resolves to [`DownloadOutcome::Cancelled`].
    pub async fn download(
        &self,
        request: DownloadRequest,
        observer: Arc<dyn ProgressObserver>,
        cancel: CancellationToken,
    ) -> Result<DownloadOutcome, TransferError> {
        let span = info_span!(
            "download",
            id = %Uuid::new_v4(),
            path = %request.remote_path,
        );
        self.download_inner(request, observer, cancel)
            .instrument(span)
            .await
    }

    async fn download_inner(
        &self,
        request: DownloadRequest,
        observer: Arc<dyn ProgressObserver>,
        cancel: CancellationToken,
    ) -> Result<DownloadOutcome, TransferError> {
        let tracker = Arc::new(match &self.health {
            Some(gate) => ProgressTracker::with_probe(Arc::clone(gate.probe())),
            None => ProgressTracker::new(),
        });

        match self.execute(&request, &observer, &cancel, &tracker).await {
            Ok(summary) => {
                let metrics = tracker.final_metrics(Completion::Succeeded).await;
                info!(
                    bytes = summary.bytes_written,
                    chunks = summary.chunk_count,
                    elapsed_ms = metrics.elapsed_ms,
                    "download completed"
                );
                observer.on_complete(&metrics);
                Ok(DownloadOutcome::Completed(metrics))
            }
            Err(TransferError::Cancelled) => {
                let metrics = tracker.final_metrics(Completion::Cancelled).await;
                info!(
                    completed = metrics.completed_chunks,
                    chunks = metrics.total_chunks,
                    "download cancelled"
                );
                observer.on_complete(&metrics);
                Ok(DownloadOutcome::Cancelled(metrics))
            }
            Err(err) => {
                warn!(error = %err, "download failed");
                observer.on_error(&err);
                let metrics = tracker
                    .final_metrics(Completion::Failed(err.to_string()))
                    .await;
                observer.on_complete(&metrics);
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        request: &DownloadRequest,
        observer: &Arc<dyn ProgressObserver>,
        cancel: &CancellationToken,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<TransferSummary, TransferError> {
        validate_config(&request.config)?;
        validate_remote_path(&request.remote_path)
            .map_err(|e| TransferError::InvalidPath(e.to_string()))?;
        validate_destination(&request.local_path)?;

        self.preflight(cancel).await?;
        connect_with_retry(
            self.source.as_ref(),
            &self.connect_policy,
            observer.as_ref(),
            cancel,
        )
        .await?;

        let result = self.transfer(request, observer, cancel, tracker).await;

        if let Err(e) = self.source.disconnect().await {
            debug!(error = %e, "disconnect failed");
        }
        result
    }

    async fn preflight(&self, cancel: &CancellationToken) -> Result<(), TransferError> {
        let Some(gate) = &self.health else {
            return Ok(());
        };
        if self.policy == HealthPolicy::Skip {
            debug!("health pre-flight skipped");
            return Ok(());
        }

        let verdict = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            v = gate.preflight() => v,
        };
        if verdict.healthy {
            return Ok(());
        }

        match self.policy {
            HealthPolicy::WarnOnly => {
                warn!(report = %verdict.report, "continuing despite unhealthy system");
                Ok(())
            }
            _ => Err(TransferError::SystemNotReady(Box::new(verdict.report))),
        }
    }

    async fn transfer(
        &self,
        request: &DownloadRequest,
        observer: &Arc<dyn ProgressObserver>,
        cancel: &CancellationToken,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<TransferSummary, TransferError> {
        let exists = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            r = self.source.exists(&request.remote_path) => r?,
        };
        if !exists {
            return Err(RemoteError::NotFound(request.remote_path.clone()).into());
        }

        let mut ctx = TransferContext::new(request, Arc::clone(observer), cancel.clone())
            .with_tracker(Arc::clone(tracker));
        if let Some(gate) = &self.health {
            ctx = ctx.with_health(Arc::clone(gate));
        }

        TransferOrchestrator::new(Arc::clone(&self.source), self.pool.clone())
            .run(&ctx)
            .await
    }
}
