//! Reusable chunk buffers.
//!
//! Buffers are handed out as [`PooledBuffer`] values that return their
//! storage to the pool when dropped, so a block can only go back once and
//! cannot be read after it has been returned.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::error::PoolError;

/// Backing blocks are allocated in multiples of this size.
const SIZE_CLASS: usize = 4 * 1024;

/// Pool tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Blocks larger than this are overwritten before reuse.
    pub scrub_threshold: usize,
    /// Byte written over scrubbed blocks.
    pub scrub_byte: u8,
    /// Idle blocks kept per size class; extra blocks are freed.
    pub max_buffers_per_bucket: usize,
    /// Optional ceiling on bytes rented at once.
    pub max_total_bytes: Option<usize>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            scrub_threshold: 1024 * 1024,
            scrub_byte: 0,
            max_buffers_per_bucket: 50,
            max_total_bytes: None,
        }
    }
}

/// Thread-safe pool of transfer buffers. Cloning shares the pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    settings: PoolSettings,
    buckets: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    total: AtomicUsize,
    closed: AtomicBool,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_settings(PoolSettings::default())
    }

    pub fn with_settings(settings: PoolSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                settings,
                buckets: Mutex::new(HashMap::new()),
                total: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Rents a buffer whose usable length is exactly `size`.
    pub fn rent(&self, size: usize) -> Result<PooledBuffer, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let limit = self.inner.settings.max_total_bytes;
        self.inner
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                let next = in_use.checked_add(size)?;
                match limit {
                    Some(l) if next > l => None,
                    _ => Some(next),
                }
            })
            .map_err(|in_use| PoolError::Exhausted {
                requested: size,
                in_use,
                limit: limit.unwrap_or(usize::MAX),
            })?;

        let class = size_class(size);
        let reused = self
            .inner
            .buckets
            .lock()
            .unwrap()
            .get_mut(&class)
            .and_then(Vec::pop);
        let storage = match reused {
            Some(block) => block,
            None => {
                trace!(class, "allocating pool block");
                vec![0u8; class]
            }
        };

        Ok(PooledBuffer {
            storage,
            len: size,
            rented: size,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Returns a buffer to the pool. Equivalent to dropping it.
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    /// Sum of the sizes of all currently rented buffers.
    pub fn total_allocated_bytes(&self) -> usize {
        self.inner.total.load(Ordering::Acquire)
    }

    /// Idle blocks waiting for reuse.
    pub fn idle_buffers(&self) -> usize {
        self.inner
            .buckets
            .lock()
            .unwrap()
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Closes the pool: later rents fail and returned blocks are freed.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.buckets.lock().unwrap().clear();
            debug!(
                in_use = self.total_allocated_bytes(),
                "buffer pool closed"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl PoolInner {
    fn give_back(&self, mut storage: Vec<u8>, rented: usize) {
        self.total.fetch_sub(rented, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        if storage.len() > self.settings.scrub_threshold {
            storage.fill(self.settings.scrub_byte);
        }

        let class = storage.len();
        if let Ok(mut buckets) = self.buckets.lock() {
            let bucket = buckets.entry(class).or_default();
            if bucket.len() < self.settings.max_buffers_per_bucket {
                bucket.push(storage);
            }
        }
    }
}

fn size_class(size: usize) -> usize {
    size.div_ceil(SIZE_CLASS).max(1) * SIZE_CLASS
}

/// A rented block. Dereferences to its usable bytes.
pub struct PooledBuffer {
    storage: Vec<u8>,
    len: usize,
    rented: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing block.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Shortens the usable length. Accounting keeps the rented size.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.storage[..self.len]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let storage = std::mem::take(&mut self.storage);
        self.pool.give_back(storage, self.rented);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
