//! Remote file collaborator.
//!
//! `RemoteSource` is implemented on top of a concrete transport (SFTP,
//! HTTPS range requests, ...). Using a trait keeps the transfer logic
//! decoupled from the transport and testable with in-memory sources.

use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncSeek};
use tracing::debug;

use crate::error::RemoteError;
use crate::validation::validate_remote_path;

/// Readable, seekable view of one remote file.
pub trait RangeReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> RangeReader for T {}

/// Boxed future returned by [`RemoteSource`] methods.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Abstract remote file store.
pub trait RemoteSource: Send + Sync {
    /// Establishes the session. Called again after a failed attempt.
    fn connect(&self) -> RemoteFuture<'_, ()>;

    fn disconnect(&self) -> RemoteFuture<'_, ()>;

    fn exists<'a>(&'a self, path: &'a str) -> RemoteFuture<'a, bool>;

    /// Size of the remote file in bytes.
    fn size<'a>(&'a self, path: &'a str) -> RemoteFuture<'a, u64>;

    /// Opens an independent reader. Each chunk attempt opens its own.
    fn open_read<'a>(&'a self, path: &'a str) -> RemoteFuture<'a, Box<dyn RangeReader>>;

    /// Host or location shown in connection events.
    fn describe(&self) -> String;
}

fn map_io(path: &str, e: std::io::Error) -> RemoteError {
    if e.kind() == std::io::ErrorKind::NotFound {
        RemoteError::NotFound(path.to_string())
    } else {
        RemoteError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// LocalSource
// ---------------------------------------------------------------------------

/// Serves files from a local directory through the remote contract.
pub struct LocalSource {
    root: PathBuf,
    connected: AtomicBool,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, RemoteError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(RemoteError::NotConnected);
        }
        Ok(self.root.join(validate_remote_path(path)?))
    }
}

impl RemoteSource for LocalSource {
    fn connect(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            let meta = tokio::fs::metadata(&self.root)
                .await
                .map_err(|e| map_io(&self.root.display().to_string(), e))?;
            if !meta.is_dir() {
                return Err(RemoteError::InvalidPath(format!(
                    "source root is not a directory: {}",
                    self.root.display()
                )));
            }
            self.connected.store(true, Ordering::Release);
            debug!(root = %self.root.display(), "local source connected");
            Ok(())
        })
    }

    fn disconnect(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.connected.store(false, Ordering::Release);
            Ok(())
        })
    }

    fn exists<'a>(&'a self, path: &'a str) -> RemoteFuture<'a, bool> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            match tokio::fs::metadata(&full).await {
                Ok(meta) => Ok(meta.is_file()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(RemoteError::Io(e)),
            }
        })
    }

    fn size<'a>(&'a self, path: &'a str) -> RemoteFuture<'a, u64> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            let meta = tokio::fs::metadata(&full)
                .await
                .map_err(|e| map_io(path, e))?;
            if !meta.is_file() {
                return Err(RemoteError::InvalidPath(format!("not a file: {path}")));
            }
            Ok(meta.len())
        })
    }

    fn open_read<'a>(&'a self, path: &'a str) -> RemoteFuture<'a, Box<dyn RangeReader>> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            let file = tokio::fs::File::open(&full)
                .await
                .map_err(|e| map_io(path, e))?;
            Ok(Box::new(file) as Box<dyn RangeReader>)
        })
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// In-memory remote store.
#[derive(Default)]
pub struct MemorySource {
    files: Mutex<HashMap<String, Arc<[u8]>>>,
    connected: AtomicBool,
    connects: AtomicU32,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file.
    pub fn insert(&self, path: &str, data: impl Into<Arc<[u8]>>) {
        let key = path.trim_start_matches('/').to_string();
        self.files.lock().unwrap().insert(key, data.into());
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Number of successful `connect` calls.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::Acquire)
    }

    fn lookup(&self, path: &str) -> Result<Option<Arc<[u8]>>, RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::NotConnected);
        }
        let key = validate_remote_path(path)?;
        Ok(self.files.lock().unwrap().get(key).cloned())
    }
}

impl RemoteSource for MemorySource {
    fn connect(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.connected.store(true, Ordering::Release);
            self.connects.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
    }

    fn disconnect(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.connected.store(false, Ordering::Release);
            Ok(())
        })
    }

    fn exists<'a>(&'a self, path: &'a str) -> RemoteFuture<'a, bool> {
        Box::pin(async move { Ok(self.lookup(path)?.is_some()) })
    }

    fn size<'a>(&'a self, path: &'a str) -> RemoteFuture<'a, u64> {
        Box::pin(async move {
            self.lookup(path)?
                .map(|data| data.len() as u64)
                .ok_or_else(|| RemoteError::NotFound(path.to_string()))
        })
    }

    fn open_read<'a>(&'a self, path: &'a str) -> RemoteFuture<'a, Box<dyn RangeReader>> {
        Box::pin(async move {
            let data = self
                .lookup(path)?
                .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
            Ok(Box::new(Cursor::new(data)) as Box<dyn RangeReader>)
        })
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    async fn read_range(source: &dyn RemoteSource, path: &str, offset: u64, len: usize) -> Vec<u8> {
        let mut reader = source.open_read(path).await.unwrap();
        reader.seek(SeekFrom::Start(offset)).await.unwrap();
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn memory_source_requires_connect() {
        let source = MemorySource::new();
        source.insert("a.bin", b"hello".to_vec());
        assert!(matches!(
            source.size("a.bin").await,
            Err(RemoteError::NotConnected)
        ));

        source.connect().await.unwrap();
        assert_eq!(source.connect_count(), 1);
        assert_eq!(source.size("/a.bin").await.unwrap(), 5);
        assert!(source.exists("a.bin").await.unwrap());
        assert!(!source.exists("b.bin").await.unwrap());
        assert!(matches!(
            source.size("b.bin").await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn memory_source_seek_and_read() {
        let source = MemorySource::new();
        source.insert("data.bin", b"0123456789".to_vec());
        source.connect().await.unwrap();
        assert_eq!(read_range(&source, "data.bin", 6, 4).await, b"6789");
    }

    #[tokio::test]
    async fn local_source_serves_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file.bin"), b"AABBCCDDEE").unwrap();

        let source = LocalSource::new(dir.path());
        source.connect().await.unwrap();
        assert!(source.exists("sub/file.bin").await.unwrap());
        assert!(!source.exists("sub/missing.bin").await.unwrap());
        assert!(!source.exists("sub").await.unwrap());
        assert_eq!(source.size("/sub/file.bin").await.unwrap(), 10);
        assert_eq!(read_range(&source, "sub/file.bin", 4, 4).await, b"CCDD");
        assert!(source.describe().starts_with("file://"));
    }

    #[tokio::test]
    async fn local_source_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let source = LocalSource::new(dir.path());
        source.connect().await.unwrap();
        assert!(matches!(
            source.size("../etc/passwd").await,
            Err(RemoteError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn local_source_missing_root_fails_connect() {
        let dir = TempDir::new().unwrap();
        let source = LocalSource::new(dir.path().join("nope"));
        assert!(matches!(
            source.connect().await,
            Err(RemoteError::NotFound(_))
        ));
        source.disconnect().await.unwrap();
        assert!(matches!(
            source.open_read("x").await,
            Err(RemoteError::NotConnected)
        ));
    }
}
