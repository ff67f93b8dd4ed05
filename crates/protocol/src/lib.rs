//! Shared data model for chunkfetch.
//!
//! Configuration values consumed by the transfer core, progress and metrics
//! snapshots handed to observers, and the health report produced by the
//! pre-flight gate.

pub mod telemetry;
pub mod types;

// Re-export primary types for convenience.
pub use telemetry::{
    CheckResult, HealthConfig, HealthReport, HealthThresholds, NetworkStability, ResourceMetrics,
};
pub use types::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PARALLEL_CHUNKS, DownloadMetrics, ProgressSnapshot,
    TransferConfig, TransferPhase,
};
