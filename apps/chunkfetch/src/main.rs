//! chunkfetch command line entry point.

mod app;
mod config;
mod csv;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "chunkfetch.toml";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting chunkfetch");

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = config::Config::load(&path)?;
    tracing::info!(
        path = %path.display(),
        remote = %config.source.remote_path,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))
}
