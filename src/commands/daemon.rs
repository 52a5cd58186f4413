use std::path::PathBuf;

use anyhow::Result;

use crate::config;

pub fn run(
    http_addr: Option<String>,
    log_level: Option<String>,
    config_path: Option<String>,
) -> Result<()> {
    let saved_path = match config_path {
        Some(path) => PathBuf::from(path),
        None => config::ConfigPaths::default_paths()?.saved,
    };
    let mut daemon_config = config::load_daemon_config(&saved_path)?;

    // CLI flags override config values
    if let Some(addr) = http_addr {
        daemon_config.http_addr = addr;
    }
    if let Some(level) = log_level {
        daemon_config.log_level = level;
    }

    // Build tokio runtime explicitly (no #[tokio::main] on fn main)
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(crate::server::run(daemon_config))
}
