use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use trapgate_common::TargetSSHOptions;

const BANNER_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads the first line of the backend's SSH banner over a plain TCP
/// connection. The proxy presents this string as its own version.
pub async fn probe_server_banner(options: &TargetSSHOptions) -> Result<String> {
    let address = format!("{}:{}", options.host, options.port);
    let banner = tokio::time::timeout(BANNER_PROBE_TIMEOUT, async {
        let stream = TcpStream::connect(&address)
            .await
            .context("connecting to backend")?;
        let mut line = String::new();
        BufReader::new(stream)
            .read_line(&mut line)
            .await
            .context("reading banner line")?;
        Ok::<_, anyhow::Error>(line)
    })
    .await
    .context("timed out waiting for the backend banner")??;

    let banner = banner.trim_end_matches(['\r', '\n']).to_owned();
    if banner.is_empty() {
        anyhow::bail!("backend sent an empty banner");
    }
    Ok(banner)
}
