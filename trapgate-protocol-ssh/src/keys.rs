use anyhow::{Context, Result};
use russh::keys::{load_secret_key, PrivateKey};
use trapgate_common::TrapgateConfig;

pub fn load_host_key(config: &TrapgateConfig) -> Result<PrivateKey> {
    load_secret_key(&config.ssh.host_key, None)
        .with_context(|| format!("loading host key from {}", config.ssh.host_key))
}
