//! Aggregate read throttling.
//!
//! Bytes are admitted against a budget that resets every second. Callers
//! that find the budget spent poll until the window rolls over, so every
//! caller eventually proceeds. Unused bytes are refunded only to the window
//! they were granted in. Enforcement is best-effort and scheduling slack
//! allows small drift.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::progress::SpeedCalculator;

const WINDOW: Duration = Duration::from_secs(1);
const POLL_DELAY: Duration = Duration::from_millis(100);
const HISTORY: Duration = Duration::from_secs(5);

/// Returned when cancellation wins while waiting for budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled while waiting for throughput budget")]
pub struct Cancelled;

/// Bytes a caller may read, tied to the window that admitted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    len: usize,
    window: Instant,
}

impl Grant {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Caps bytes/second across all concurrent callers.
pub struct ThroughputLimiter {
    max_bytes_per_second: u64,
    window: Mutex<Window>,
    history: SpeedCalculator,
}

struct Window {
    started: Instant,
    admitted: u64,
}

impl Window {
    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.started) >= WINDOW {
            self.started = now;
            self.admitted = 0;
        }
    }
}

impl ThroughputLimiter {
    /// Creates a limiter. A ceiling of 0 disables throttling.
    pub fn new(max_bytes_per_second: u64) -> Self {
        Self {
            max_bytes_per_second,
            window: Mutex::new(Window {
                started: Instant::now(),
                admitted: 0,
            }),
            history: SpeedCalculator::new(Some(HISTORY)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_bytes_per_second == 0
    }

    pub fn max_bytes_per_second(&self) -> u64 {
        self.max_bytes_per_second
    }

    /// Largest grant handed to one caller, a tenth of the ceiling.
    fn slice(&self) -> u64 {
        (self.max_bytes_per_second / 10).max(1)
    }

    /// Waits until up to `requested` bytes may be read and returns the grant.
    ///
    /// The grant may be smaller than requested. Report the bytes actually
    /// consumed with [`settle`](Self::settle).
    pub async fn acquire(
        &self,
        requested: usize,
        cancel: &CancellationToken,
    ) -> Result<Grant, Cancelled> {
        if requested == 0 || self.is_unlimited() {
            return Ok(Grant {
                len: requested,
                window: Instant::now(),
            });
        }

        loop {
            {
                let mut w = self.window.lock().unwrap();
                w.roll(Instant::now());
                let remaining = self.max_bytes_per_second.saturating_sub(w.admitted);
                if remaining > 0 {
                    let grant = (requested as u64).min(remaining).min(self.slice());
                    w.admitted += grant;
                    return Ok(Grant {
                        len: grant as usize,
                        window: w.started,
                    });
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(POLL_DELAY) => {}
            }
        }
    }

    /// Records `used` bytes of `grant` and refunds the rest.
    ///
    /// Nothing is refunded once the window that admitted the grant has
    /// rolled over.
    pub fn settle(&self, grant: Grant, used: usize) {
        if !self.is_unlimited() && used < grant.len {
            let mut w = self.window.lock().unwrap();
            w.roll(Instant::now());
            if w.started == grant.window {
                w.admitted = w.admitted.saturating_sub((grant.len - used) as u64);
            }
        }
        if used > 0 {
            self.history.add_sample(used as u64);
        }
    }

    /// Runs `op` with a throttled allowance and settles its result.
    pub async fn throttle<F, Fut, E>(
        &self,
        requested: usize,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<usize, E>
    where
        F: FnOnce(usize) -> Fut,
        Fut: Future<Output = Result<usize, E>>,
        E: From<Cancelled>,
    {
        let grant = self.acquire(requested, cancel).await?;
        match op(grant.len).await {
            Ok(used) => {
                self.settle(grant, used);
                Ok(used)
            }
            Err(e) => {
                self.settle(grant, 0);
                Err(e)
            }
        }
    }

    /// Rolling admitted bytes/second over the last five seconds.
    pub fn current_speed(&self) -> f64 {
        self.history.bytes_per_second()
    }

    /// Bytes admitted in the current window.
    pub fn admitted_in_window(&self) -> u64 {
        let mut w = self.window.lock().unwrap();
        w.roll(Instant::now());
        w.admitted
    }
}
