//! Parallel chunk scheduling and in-order assembly.
//!
//! A run moves through `Planning → FetchingChunks → Assembling` and ends in
//! `Completed` or `Failed`. Chunks are admitted through a semaphore before
//! their task is spawned, each task retries its own chunk with capped
//! exponential backoff, and the first fatal chunk outcome cancels the rest of
//! the fetch phase.

use std::future::Future;
use std::io::SeekFrom;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chunkfetch_protocol::{ResourceMetrics, TransferConfig, TransferPhase};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::chunked::{CompletedChunkTable, FailureSet, RetryLedger, assemble};
use crate::error::{ChunkFault, TransferError};
use crate::limiter::ThroughputLimiter;
use crate::observer::ProgressObserver;
use crate::plan::{ChunkSpec, TransferPlan};
use crate::pool::{BufferPool, PooledBuffer};
use crate::progress::ProgressTracker;
use crate::remote::{RangeReader, RemoteSource};
use crate::types::TransferContext;
use crate::validation::validate_config;

/// Largest single read issued while filling a chunk.
const READ_BLOCK: usize = 64 * 1024;

/// Result of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub file_size: u64,
    pub chunk_count: u32,
    pub bytes_written: u64,
}

/// Downloads one remote file per [`run`](Self::run) call.
pub struct TransferOrchestrator {
    source: Arc<dyn RemoteSource>,
    pool: BufferPool,
}

/// State shared by every chunk task of one run.
#[derive(Default)]
struct FetchState {
    table: CompletedChunkTable,
    ledger: RetryLedger,
    failures: FailureSet,
    fatal: Mutex<Option<TransferError>>,
}

impl FetchState {
    fn record_fatal(&self, err: TransferError) {
        self.fatal.lock().unwrap().get_or_insert(err);
    }

    fn take_fatal(&self) -> Option<TransferError> {
        self.fatal.lock().unwrap().take()
    }
}

impl TransferOrchestrator {
    pub fn new(source: Arc<dyn RemoteSource>, pool: BufferPool) -> Self {
        Self { source, pool }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Downloads `ctx.remote_path` to `ctx.local_path`.
    ///
    /// The source must already be connected. When `ctx.health` is set the
    /// resource monitor runs alongside the transfer and feeds the tracker.
    pub async fn run(&self, ctx: &TransferContext) -> Result<TransferSummary, TransferError> {
        let monitor_cancel = ctx.cancel.child_token();
        let monitor = ctx.health.as_ref().map(|gate| {
            let tracker = Arc::clone(&ctx.tracker);
            gate.start_continuous_monitoring(
                monitor_cancel.clone(),
                Some(Box::new(move |sample: &ResourceMetrics| {
                    tracker.record_resource_sample(sample)
                })),
            )
        });

        let result = self.run_phases(ctx).await;

        monitor_cancel.cancel();
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                warn!(error = %e, "resource monitor task failed");
            }
        }

        let phase = if result.is_ok() {
            TransferPhase::Completed
        } else {
            TransferPhase::Failed
        };
        set_phase(&ctx.tracker, phase);
        result
    }

    async fn run_phases(&self, ctx: &TransferContext) -> Result<TransferSummary, TransferError> {
        set_phase(&ctx.tracker, TransferPhase::Planning);
        validate_config(&ctx.config)?;
        let file_size = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
            size = self.source.size(&ctx.remote_path) => size?,
        };
        let plan = TransferPlan::new(file_size, ctx.config.chunk_size)?;
        ctx.tracker.begin(file_size, plan.chunk_count());
        info!(
            path = %ctx.remote_path,
            file_size,
            chunk_size = plan.chunk_size(),
            chunks = plan.chunk_count(),
            workers = ctx.config.max_parallel_chunks,
            "transfer planned"
        );

        set_phase(&ctx.tracker, TransferPhase::FetchingChunks);
        let state = Arc::new(FetchState::default());
        if let Err(e) = self.fetch_all(ctx, &plan, &state).await {
            state.table.clear();
            return Err(e);
        }

        set_phase(&ctx.tracker, TransferPhase::Assembling);
        let written = match assemble(&state.table, plan.chunk_count(), &ctx.local_path, &ctx.cancel)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                state.table.clear();
                match tokio::fs::remove_file(&ctx.local_path).await {
                    Err(rm) if rm.kind() != std::io::ErrorKind::NotFound => {
                        warn!(path = %ctx.local_path.display(), error = %rm, "failed to remove partial file");
                    }
                    _ => {}
                }
                return Err(e);
            }
        };

        info!(
            path = %ctx.local_path.display(),
            bytes = written,
            retries = ctx.tracker.retry_count(),
            "transfer assembled"
        );
        Ok(TransferSummary {
            file_size,
            chunk_count: plan.chunk_count(),
            bytes_written: written,
        })
    }

    async fn fetch_all(
        &self,
        ctx: &TransferContext,
        plan: &TransferPlan,
        state: &Arc<FetchState>,
    ) -> Result<(), TransferError> {
        let semaphore = Arc::new(Semaphore::new(ctx.config.max_parallel_chunks));
        let limiter = Arc::new(ThroughputLimiter::new(ctx.config.max_bytes_per_second));
        let fetch_cancel = ctx.cancel.child_token();
        let mut tasks: JoinSet<(u32, Result<(), ChunkFault>)> = JoinSet::new();

        for spec in plan.chunks() {
            let permit = tokio::select! {
                biased;
                _ = fetch_cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let job = ChunkJob {
                spec,
                remote_path: ctx.remote_path.clone(),
                config: ctx.config.clone(),
                source: Arc::clone(&self.source),
                pool: self.pool.clone(),
                limiter: Arc::clone(&limiter),
                tracker: Arc::clone(&ctx.tracker),
                observer: Arc::clone(&ctx.observer),
                state: Arc::clone(state),
                cancel: fetch_cancel.clone(),
            };
            tasks.spawn(async move {
                let _permit = permit;
                // Stops the fetch phase if this task unwinds.
                let abort_on_panic = job.cancel.clone().drop_guard();
                let result = job.run().await;
                abort_on_panic.disarm();
                (job.spec.index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(()))) => trace!(chunk = index, "chunk task finished"),
                Ok((index, Err(ChunkFault::Pool(e)))) => {
                    warn!(chunk = index, error = %e, "buffer pool failure, aborting transfer");
                    state.record_fatal(e.into());
                    fetch_cancel.cancel();
                }
                Ok((index, Err(fault))) => {
                    debug!(chunk = index, error = %fault, "chunk task stopped");
                }
                Err(join_err) => {
                    warn!(error = %join_err, "chunk task panicked");
                    state.record_fatal(TransferError::Internal(format!(
                        "chunk task panicked: {join_err}"
                    )));
                    fetch_cancel.cancel();
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            info!(
                completed = ctx.tracker.completed_chunks(),
                chunks = plan.chunk_count(),
                "transfer cancelled"
            );
            return Err(TransferError::Cancelled);
        }
        if let Some(err) = state.take_fatal() {
            return Err(err);
        }
        if !state.failures.is_empty() {
            return Err(TransferError::TransferFailed {
                failed: state.failures.to_vec(),
                attempts: state.ledger.snapshot(),
            });
        }
        Ok(())
    }
}

fn set_phase(tracker: &ProgressTracker, phase: TransferPhase) {
    tracker.set_phase(phase);
    info!(%phase, "transfer phase");
}

// ---------------------------------------------------------------------------
// ChunkJob
// ---------------------------------------------------------------------------

/// One chunk's retry loop.
struct ChunkJob {
    spec: ChunkSpec,
    remote_path: String,
    config: TransferConfig,
    source: Arc<dyn RemoteSource>,
    pool: BufferPool,
    limiter: Arc<ThroughputLimiter>,
    tracker: Arc<ProgressTracker>,
    observer: Arc<dyn ProgressObserver>,
    state: Arc<FetchState>,
    cancel: CancellationToken,
}

impl ChunkJob {
    async fn run(&self) -> Result<(), ChunkFault> {
        let index = self.spec.index;
        let _worker = self.tracker.worker();

        loop {
            if self.cancel.is_cancelled() {
                return Err(ChunkFault::Cancelled);
            }

            let fault = match self.attempt().await {
                Ok(buffer) => {
                    trace!(chunk = index, len = buffer.len(), "chunk fetched");
                    self.state.table.insert(index, buffer);
                    self.tracker.record_chunk_completed();
                    self.observer.on_progress(&self.tracker.snapshot());
                    return Ok(());
                }
                Err(ChunkFault::Pool(e)) => {
                    self.cancel.cancel();
                    return Err(ChunkFault::Pool(e));
                }
                Err(fault) if fault.is_fatal() => return Err(fault),
                Err(fault) => fault,
            };

            let failures = self.state.ledger.record_failure(index);
            if failures >= self.config.retry_count {
                warn!(chunk = index, attempts = failures, error = %fault, "chunk exhausted its retries");
                self.state.failures.add(index);
                self.cancel.cancel();
                return Err(fault);
            }

            let delay = self.config.backoff_for_attempt(failures);
            warn!(
                chunk = index,
                attempt = failures,
                retry_in_ms = delay.as_millis() as u64,
                error = %fault,
                "chunk attempt failed, retrying"
            );
            self.tracker.record_retry();
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ChunkFault::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Fetches the chunk once into a fresh buffer.
    ///
    /// On failure the buffer goes back to the pool and the bytes counted by
    /// this attempt are rolled back.
    async fn attempt(&self) -> Result<PooledBuffer, ChunkFault> {
        // Chunk sizes are checked to fit in memory before planning.
        let mut buffer = self.pool.rent(self.spec.len as usize)?;
        let mut filled = 0usize;

        match self.fill(&mut buffer, &mut filled).await {
            Ok(()) => {
                buffer.truncate(filled);
                Ok(buffer)
            }
            Err(fault) => {
                self.tracker.discard_bytes(filled as u64);
                Err(fault)
            }
        }
    }

    async fn fill(&self, buffer: &mut PooledBuffer, filled: &mut usize) -> Result<(), ChunkFault> {
        let timeout = self.config.read_timeout();

        let mut reader = self
            .guarded(timeout, async {
                self.source
                    .open_read(&self.remote_path)
                    .await
                    .map_err(ChunkFault::from)
            })
            .await?;
        self.guarded(timeout, async {
            reader
                .seek(SeekFrom::Start(self.spec.offset))
                .await
                .map(|_| ())
                .map_err(ChunkFault::from)
        })
        .await?;

        while *filled < buffer.len() {
            let want = (buffer.len() - *filled).min(READ_BLOCK);
            let grant = self.limiter.acquire(want, &self.cancel).await?;
            let dst = &mut buffer[*filled..*filled + grant.len()];
            let n = match self.guarded(timeout, read_some(&mut reader, dst)).await {
                Ok(n) => n,
                Err(fault) => {
                    self.limiter.settle(grant, 0);
                    return Err(fault);
                }
            };
            self.limiter.settle(grant, n);

            if n == 0 {
                if *filled == 0 {
                    return Err(ChunkFault::ZeroRead);
                }
                debug!(
                    chunk = self.spec.index,
                    expected = buffer.len(),
                    got = *filled,
                    "short read at end of data"
                );
                break;
            }
            *filled += n;
            self.tracker.record_bytes(n as u64);
        }
        Ok(())
    }

    /// Runs `op` under the read timeout, giving up early on cancellation.
    async fn guarded<T>(
        &self,
        timeout: Duration,
        op: impl Future<Output = Result<T, ChunkFault>>,
    ) -> Result<T, ChunkFault> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ChunkFault::Cancelled),
            r = tokio::time::timeout(timeout, op) => {
                r.unwrap_or_else(|_| Err(ChunkFault::Timeout(timeout)))
            }
        }
    }
}

async fn read_some(reader: &mut Box<dyn RangeReader>, dst: &mut [u8]) -> Result<usize, ChunkFault> {
    Ok(reader.read(dst).await?)
}
