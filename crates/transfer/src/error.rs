//! Transfer error types.

use std::collections::BTreeMap;
use std::time::Duration;

use chunkfetch_protocol::HealthReport;

use crate::limiter::Cancelled;

/// Errors produced by a download.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("system not ready for transfer")]
    SystemNotReady(Box<HealthReport>),

    #[error("connection failed after {attempts} attempts: {source}")]
    ConnectionFault {
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("transfer failed: chunks {failed:?} exhausted their retries")]
    TransferFailed {
        failed: Vec<u32>,
        /// Failed attempts per chunk index.
        attempts: BTreeMap<u32, u32>,
    },

    #[error("assembly invariant violated: chunk {index} missing from completed table")]
    AssemblyInvariantViolation { index: u32 },

    #[error("buffer pool exhausted: {0}")]
    ResourceExhausted(PoolError),

    #[error("buffer pool closed")]
    ResourceClosed,

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PoolError> for TransferError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Closed => Self::ResourceClosed,
            other => Self::ResourceExhausted(other),
        }
    }
}

impl From<Cancelled> for TransferError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Errors reported by a [`RemoteSource`](crate::RemoteSource).
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid remote path: {0}")]
    InvalidPath(String),

    #[error("not connected")]
    NotConnected,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Buffer pool failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,

    #[error("requested {requested} bytes with {in_use} of {limit} in use")]
    Exhausted {
        requested: usize,
        in_use: usize,
        limit: usize,
    },
}

/// Failure of one chunk attempt. Never escapes the orchestrator.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ChunkFault {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote returned no data")]
    ZeroRead,

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("cancelled")]
    Cancelled,
}

impl From<Cancelled> for ChunkFault {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl ChunkFault {
    /// Faults that abort the transfer instead of being retried.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_map_to_resource_variants() {
        assert!(matches!(
            TransferError::from(PoolError::Closed),
            TransferError::ResourceClosed
        ));
        let exhausted = PoolError::Exhausted {
            requested: 10,
            in_use: 95,
            limit: 100,
        };
        assert!(matches!(
            TransferError::from(exhausted),
            TransferError::ResourceExhausted(_)
        ));
    }

    #[test]
    fn transfer_failed_names_chunks() {
        let err = TransferError::TransferFailed {
            failed: vec![2, 7],
            attempts: BTreeMap::from([(2, 3), (7, 3)]),
        };
        assert_eq!(
            err.to_string(),
            "transfer failed: chunks [2, 7] exhausted their retries"
        );
    }

    #[test]
    fn connection_fault_keeps_source() {
        let err = TransferError::ConnectionFault {
            attempts: 3,
            source: RemoteError::Auth("bad key".into()),
        };
        assert!(err.to_string().contains("after 3 attempts"));
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "authentication failed: bad key");
    }

    #[test]
    fn fatal_faults() {
        assert!(ChunkFault::Pool(PoolError::Closed).is_fatal());
        assert!(ChunkFault::Cancelled.is_fatal());
        assert!(!ChunkFault::ZeroRead.is_fatal());
        assert!(!ChunkFault::Timeout(Duration::from_secs(1)).is_fatal());
    }
}
