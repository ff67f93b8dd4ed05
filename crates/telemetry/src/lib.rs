//! System health gating for chunkfetch transfers.
//!
//! Reads resource metrics (CPU, memory, disk, network) from platform-specific
//! sources, decides whether a transfer should start, and keeps sampling while
//! it runs.

mod gate;
mod monitor;
mod probe;

#[cfg(target_os = "linux")]
#[path = "sysfs_linux.rs"]
mod platform;

#[cfg(not(target_os = "linux"))]
#[path = "sysfs_other.rs"]
mod platform;

pub use gate::{
    CPU, DISK, FIREWALL, HealthGate, HealthVerdict, MEMORY, NETWORK, SYSTEM_CONFIGURATION,
};
pub use monitor::{MetricHistory, MetricsSink};
pub use probe::{FixedProbe, ProbeFuture, ResourceProbe, SystemProbe, tcp_latency_ms};
