use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use tracing::*;
use trapgate_common::TrapgateConfig;

/// A missing file falls back to the built-in defaults; environment
/// variables prefixed `TRAPGATE_` override either.
pub fn load_config(path: &Path) -> Result<TrapgateConfig> {
    let config: TrapgateConfig = Config::builder()
        .add_source(File::from(path).required(false))
        .add_source(Environment::with_prefix("TRAPGATE"))
        .build()
        .context("building configuration")?
        .try_deserialize()
        .context("parsing configuration")?;

    info!(
        "Using config: {} (listen: {}, shell backend: {}:{})",
        path.display(),
        config.ssh.listen,
        config.shell_target.host,
        config.shell_target.port,
    );
    Ok(config)
}
