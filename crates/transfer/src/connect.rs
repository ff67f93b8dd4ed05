//! Establishing the remote session with bounded retries.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, TransferError};
use crate::observer::ProgressObserver;
use crate::remote::RemoteSource;

/// Retry schedule for [`connect_with_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub attempts: u32,
    /// Timeout of the first attempt.
    pub first_timeout: Duration,
    /// Timeout of every later attempt.
    pub retry_timeout: Duration,
    /// Wait after attempt `n` is `base_delay * n`.
    pub base_delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            first_timeout: Duration::from_secs(120),
            retry_timeout: Duration::from_secs(30),
            base_delay: Duration::from_secs(5),
        }
    }
}

impl ConnectPolicy {
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            self.first_timeout
        } else {
            self.retry_timeout
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Connects `source`, retrying per `policy` and reporting each step to
/// `observer`.
pub async fn connect_with_retry(
    source: &dyn RemoteSource,
    policy: &ConnectPolicy,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let host = source.describe();
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    observer.on_searching_host(&host);

    for attempt in 1..=attempts {
        let timeout = policy.timeout_for(attempt);
        observer.on_connecting(&host, attempt);
        // Authentication happens inside `connect` for every transport.
        observer.on_authenticating(&host);
        debug!(host = %host, attempt, timeout_secs = timeout.as_secs(), "connecting to source");

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            r = tokio::time::timeout(timeout, source.connect()) => r,
        };

        let err = match result {
            Ok(Ok(())) => {
                observer.on_connected(&host);
                info!(host = %host, attempt, "source connected");
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => RemoteError::Timeout(timeout),
        };

        warn!(host = %host, attempt, error = %err, "connect attempt failed");
        observer.on_connection_error(&host, attempt, &err);
        last_error = Some(err);

        if attempt < attempts {
            let delay = policy.delay_for_attempt(attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    Err(TransferError::ConnectionFault {
        attempts,
        source: last_error.unwrap_or(RemoteError::NotConnected),
    })
}
