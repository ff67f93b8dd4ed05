//! Wires the configured source, observers and health gate into a download.

use std::sync::Arc;

use anyhow::Context;
use chunkfetch_telemetry::HealthGate;
use chunkfetch_transfer::{
    CompositeObserver, DownloadOutcome, DownloadRequest, DownloadService, LocalSource,
    TracingObserver, TransferError,
};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::csv::CsvProgressObserver;

/// Runs one download as described by `config`.
pub async fn run(config: Config) -> anyhow::Result<()> {
    if config.source.remote_path.is_empty() {
        anyhow::bail!("source.remote_path is not set");
    }

    let cancel = CancellationToken::new();

    // -- Observers --
    let mut observer = CompositeObserver::new().with(Arc::new(TracingObserver::new()));
    if let Some(path) = &config.output.progress_csv {
        let csv = CsvProgressObserver::create(path)
            .with_context(|| format!("creating progress log {}", path.display()))?;
        tracing::info!(path = %path.display(), "writing progress log");
        observer.push(Arc::new(csv));
    }

    // -- Service --
    let source = Arc::new(LocalSource::new(config.source.root.clone()));
    let mut service = DownloadService::new(source).with_health_policy(config.health.policy);
    if config.health.enabled {
        service = service.with_health(Arc::new(HealthGate::system(config.health.probe.clone())));
    }

    let request = DownloadRequest::new(
        config.source.remote_path.clone(),
        config.output.destination.clone(),
    )
    .with_config(config.transfer.clone());

    // -- Shutdown --
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, cancelling download");
            signal_cancel.cancel();
        }
    });

    let result = service.download(request, Arc::new(observer), cancel).await;
    service.pool().close();

    match result {
        Ok(DownloadOutcome::Completed(m)) => {
            tracing::info!(
                destination = %config.output.destination.display(),
                bytes = m.bytes_transferred,
                avg_mbps = m.average_speed_mbps(),
                "download saved"
            );
            Ok(())
        }
        Ok(DownloadOutcome::Cancelled(m)) => {
            tracing::warn!(
                completed = m.completed_chunks,
                chunks = m.total_chunks,
                "download cancelled"
            );
            Ok(())
        }
        Err(TransferError::SystemNotReady(report)) => {
            eprintln!("{report}");
            anyhow::bail!(
                "system not ready for transfer (set health.policy = \"warn_only\" to continue anyway)"
            )
        }
        Err(e) => Err(e).context("download failed"),
    }
}
