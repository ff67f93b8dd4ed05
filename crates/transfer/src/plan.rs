//! Splitting a remote file into chunks.

use crate::error::TransferError;

/// One contiguous byte range of the remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: u32,
    pub offset: u64,
    pub len: u64,
}

impl ChunkSpec {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Partition of `[0, file_size)` into `chunk_size` ranges. Only the last
/// chunk may be shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    file_size: u64,
    chunk_size: u64,
    chunk_count: u32,
}

impl TransferPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidConfig(
                "chunk size must be greater than 0".into(),
            ));
        }
        let chunk_count = u32::try_from(file_size.div_ceil(chunk_size)).map_err(|_| {
            TransferError::InvalidConfig(format!(
                "{file_size} bytes in {chunk_size}-byte chunks exceeds the chunk index range"
            ))
        })?;
        Ok(Self {
            file_size,
            chunk_size,
            chunk_count,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn chunk(&self, index: u32) -> Option<ChunkSpec> {
        if index >= self.chunk_count {
            return None;
        }
        let offset = u64::from(index) * self.chunk_size;
        Some(ChunkSpec {
            index,
            offset,
            len: self.chunk_size.min(self.file_size - offset),
        })
    }

    pub fn chunks(&self) -> impl Iterator<Item = ChunkSpec> + '_ {
        (0..self.chunk_count).filter_map(|i| self.chunk(i))
    }
}
