use std::path::{Component, Path};

use chunkfetch_protocol::TransferConfig;
use tokio::sync::Semaphore;

use crate::error::{RemoteError, TransferError};

/// Normalizes a remote path and checks that it stays inside the source root.
///
/// A leading `/` is accepted and stripped, since remote paths are always
/// relative to the source. Rejects:
/// - Empty paths
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_remote_path(remote_path: &str) -> Result<&str, RemoteError> {
    let trimmed = remote_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(RemoteError::InvalidPath("empty path".into()));
    }

    for component in Path::new(trimmed).components() {
        match component {
            Component::ParentDir => {
                return Err(RemoteError::InvalidPath(format!(
                    "parent directory traversal not allowed: {remote_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(RemoteError::InvalidPath(format!(
                    "path prefix not allowed: {remote_path}"
                )));
            }
            Component::RootDir | Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(trimmed)
}

/// Rejects settings the orchestrator cannot run with.
pub fn validate_config(config: &TransferConfig) -> Result<(), TransferError> {
    if config.chunk_size == 0 {
        return Err(TransferError::InvalidConfig(
            "chunk_size must be greater than 0".into(),
        ));
    }
    if config.max_parallel_chunks == 0 {
        return Err(TransferError::InvalidConfig(
            "max_parallel_chunks must be greater than 0".into(),
        ));
    }
    if config.max_parallel_chunks > Semaphore::MAX_PERMITS {
        return Err(TransferError::InvalidConfig(format!(
            "max_parallel_chunks {} exceeds the limit of {}",
            config.max_parallel_chunks,
            Semaphore::MAX_PERMITS
        )));
    }
    if config.retry_count == 0 {
        return Err(TransferError::InvalidConfig(
            "retry_count must be greater than 0".into(),
        ));
    }
    if usize::try_from(config.chunk_size).is_err() {
        return Err(TransferError::InvalidConfig(format!(
            "chunk_size {} does not fit in memory",
            config.chunk_size
        )));
    }
    Ok(())
}

/// Checks that `destination` can be created as a regular file.
pub fn validate_destination(destination: &Path) -> Result<(), TransferError> {
    if destination.as_os_str().is_empty() {
        return Err(TransferError::InvalidPath("empty destination".into()));
    }
    if destination.is_dir() {
        return Err(TransferError::InvalidPath(format!(
            "destination is a directory: {}",
            destination.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_path() {
        assert!(validate_remote_path("").is_err());
        assert!(validate_remote_path("/").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_remote_path("../../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_nested_parent_dir_traversal() {
        assert!(validate_remote_path("sub/../../../escape").is_err());
    }

    #[test]
    fn rejects_single_parent_dir() {
        assert!(validate_remote_path("..").is_err());
        assert!(validate_remote_path("/../file.bin").is_err());
    }

    #[test]
    fn strips_leading_slash() {
        assert_eq!(validate_remote_path("/data/big.bin").unwrap(), "data/big.bin");
        assert_eq!(validate_remote_path("//data/big.bin").unwrap(), "data/big.bin");
    }

    #[test]
    fn accepts_subdirectory_path() {
        assert_eq!(validate_remote_path("sub/dir/file.txt").unwrap(), "sub/dir/file.txt");
    }

    #[test]
    fn accepts_current_dir_prefix() {
        assert!(validate_remote_path("./image.iso").is_ok());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&TransferConfig::default()).is_ok());
    }

    #[test]
    fn rejects_zero_limits() {
        for cfg in [
            TransferConfig {
                chunk_size: 0,
                ..TransferConfig::default()
            },
            TransferConfig {
                max_parallel_chunks: 0,
                ..TransferConfig::default()
            },
            TransferConfig {
                retry_count: 0,
                ..TransferConfig::default()
            },
        ] {
            assert!(matches!(
                validate_config(&cfg),
                Err(TransferError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn rejects_parallelism_beyond_permit_limit() {
        let cfg = TransferConfig {
            max_parallel_chunks: usize::MAX,
            ..TransferConfig::default()
        };
        assert!(matches!(
            validate_config(&cfg),
            Err(TransferError::InvalidConfig(_))
        ));

        let cfg = TransferConfig {
            max_parallel_chunks: Semaphore::MAX_PERMITS,
            ..TransferConfig::default()
        };
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn unlimited_throughput_is_valid() {
        let cfg = TransferConfig {
            max_bytes_per_second: 0,
            ..TransferConfig::default()
        };
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn destination_checks() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(validate_destination(Path::new("")).is_err());
        assert!(validate_destination(dir.path()).is_err());
        assert!(validate_destination(&dir.path().join("out.bin")).is_ok());
        assert!(validate_destination(&dir.path().join("new/dir/out.bin")).is_ok());
    }
}
