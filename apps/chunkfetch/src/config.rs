//! CLI configuration.
//!
//! Stored as TOML with `[source]`, `[transfer]`, `[health]` and `[output]`
//! tables. Every field has a default, so a partial file is valid.

use std::path::{Path, PathBuf};

use chunkfetch_protocol::{HealthConfig, TransferConfig};
use chunkfetch_transfer::HealthPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub health: HealthSection,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Where the file comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory that remote paths are resolved against.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default)]
    pub remote_path: String,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            remote_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSection {
    /// Run the pre-flight check and monitor resources during the transfer.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub policy: HealthPolicy,

    #[serde(flatten)]
    pub probe: HealthConfig,
}

fn default_true() -> bool {
    true
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            policy: HealthPolicy::default(),
            probe: HealthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_destination")]
    pub destination: PathBuf,

    /// CSV progress log, e.g. `download_progress.csv`. Disabled when unset.
    #[serde(default)]
    pub progress_csv: Option<PathBuf>,
}

fn default_destination() -> PathBuf {
    PathBuf::from("download.bin")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            progress_csv: None,
        }
    }
}

impl Config {
    /// Loads configuration from `path`, writing the defaults there if the
    /// file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}
