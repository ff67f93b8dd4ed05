//! Chunked parallel download of large remote files.
//!
//! A file is split into fixed-size chunks that are fetched concurrently
//! under a bounded worker budget, throttled to an aggregate byte rate,
//! retried independently and reassembled in order. Buffers come from a
//! shared pool and every suspension point observes cancellation.

mod chunked;
mod connect;
mod error;
mod limiter;
mod observer;
mod orchestrator;
mod plan;
mod pool;
mod progress;
mod remote;
mod service;
mod types;
mod validation;

pub use chunkfetch_protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PARALLEL_CHUNKS};
pub use connect::{ConnectPolicy, connect_with_retry};
pub use error::{PoolError, RemoteError, TransferError};
pub use limiter::{Cancelled, Grant, ThroughputLimiter};
pub use observer::{CompositeObserver, NoopObserver, ProgressObserver, TracingObserver};
pub use orchestrator::{TransferOrchestrator, TransferSummary};
pub use plan::{ChunkSpec, TransferPlan};
pub use pool::{BufferPool, PoolSettings, PooledBuffer};
pub use progress::{ActiveWorker, Completion, ProgressTracker, SpeedCalculator, eta};
pub use remote::{LocalSource, MemorySource, RangeReader, RemoteFuture, RemoteSource};
pub use service::DownloadService;
pub use types::{DownloadOutcome, DownloadRequest, HealthPolicy, TransferContext};
pub use validation::{validate_config, validate_destination, validate_remote_path};
