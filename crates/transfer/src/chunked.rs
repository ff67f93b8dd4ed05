use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransferError;
use crate::pool::PooledBuffer;

// ---------------------------------------------------------------------------
// Shared per-transfer tables
// ---------------------------------------------------------------------------

/// Chunks that have been fully fetched, keyed by index.
#[derive(Default)]
pub(crate) struct CompletedChunkTable {
    chunks: Mutex<HashMap<u32, PooledBuffer>>,
}

impl CompletedChunkTable {
    /// Stores a finished chunk. Each index is inserted at most once.
    pub(crate) fn insert(&self, index: u32, data: PooledBuffer) {
        let previous = self.chunks.lock().unwrap().insert(index, data);
        debug_assert!(previous.is_none(), "chunk {index} completed twice");
    }

    pub(crate) fn take(&self, index: u32) -> Option<PooledBuffer> {
        self.chunks.lock().unwrap().remove(&index)
    }

    pub(crate) fn len(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    /// Releases every held buffer.
    pub(crate) fn clear(&self) {
        self.chunks.lock().unwrap().clear();
    }
}

/// Failed attempts per chunk.
#[derive(Default)]
pub(crate) struct RetryLedger {
    attempts: Mutex<BTreeMap<u32, u32>>,
}

impl RetryLedger {
    /// Records a failed attempt and returns the chunk's failure count.
    pub(crate) fn record_failure(&self, index: u32) -> u32 {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(index).or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<u32, u32> {
        self.attempts.lock().unwrap().clone()
    }
}

/// Chunks that exhausted their attempts.
#[derive(Default)]
pub(crate) struct FailureSet {
    failed: Mutex<BTreeSet<u32>>,
}

impl FailureSet {
    pub(crate) fn add(&self, index: u32) {
        self.failed.lock().unwrap().insert(index);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.failed.lock().unwrap().is_empty()
    }

    pub(crate) fn to_vec(&self) -> Vec<u32> {
        self.failed.lock().unwrap().iter().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Writes chunks `0..chunk_count` to `destination` in index order.
///
/// Creates intermediate directories as needed. Each buffer goes back to the
/// pool as soon as it has been written. Returns the number of bytes written.
pub(crate) async fn assemble(
    table: &CompletedChunkTable,
    chunk_count: u32,
    destination: &Path,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file = tokio::fs::File::create(destination).await?;
    let mut writer = BufWriter::new(file);
    let mut written = 0u64;

    for index in 0..chunk_count {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let chunk = table
            .take(index)
            .ok_or(TransferError::AssemblyInvariantViolation { index })?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
        drop(chunk);
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    debug!(path = %destination.display(), bytes = written, chunks = chunk_count, "file assembled");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use tempfile::TempDir;

    fn filled(pool: &BufferPool, data: &[u8]) -> PooledBuffer {
        let mut buf = pool.rent(data.len()).unwrap();
        buf.copy_from_slice(data);
        buf
    }

    #[tokio::test]
    async fn assembles_in_index_order() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::new();
        let table = CompletedChunkTable::default();
        // Inserted out of order on purpose.
        table.insert(2, filled(&pool, b"EE"));
        table.insert(0, filled(&pool, b"AABB"));
        table.insert(1, filled(&pool, b"CCDD"));

        let dest = dir.path().join("sub/dir/out.bin");
        let n = assemble(&table, 3, &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(n, 10);
        assert_eq!(std::fs::read(&dest).unwrap(), b"AABBCCDDEE");
        assert_eq!(table.len(), 0);
        assert_eq!(pool.total_allocated_bytes(), 0);
    }

    #[tokio::test]
    async fn missing_chunk_is_an_invariant_violation() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::new();
        let table = CompletedChunkTable::default();
        table.insert(0, filled(&pool, b"AA"));
        table.insert(2, filled(&pool, b"CC"));

        let err = assemble(&table, 3, &dir.path().join("out.bin"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::AssemblyInvariantViolation { index: 1 }
        ));
    }

    #[tokio::test]
    async fn zero_chunks_creates_empty_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("empty.bin");
        let n = assemble(
            &CompletedChunkTable::default(),
            0,
            &dest,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(n, 0);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn cancelled_assembly_stops() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::new();
        let table = CompletedChunkTable::default();
        table.insert(0, filled(&pool, b"AA"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = assemble(&table, 1, &dir.path().join("out.bin"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }

    #[test]
    fn retry_ledger_counts_per_chunk() {
        let ledger = RetryLedger::default();
        assert_eq!(ledger.record_failure(4), 1);
        assert_eq!(ledger.record_failure(4), 2);
        assert_eq!(ledger.record_failure(1), 1);
        assert_eq!(ledger.snapshot(), BTreeMap::from([(1, 1), (4, 2)]));
    }

    #[test]
    fn failure_set_is_sorted() {
        let failed = FailureSet::default();
        assert!(failed.is_empty());
        failed.add(9);
        failed.add(2);
        failed.add(9);
        assert_eq!(failed.to_vec(), vec![2, 9]);
    }
}
