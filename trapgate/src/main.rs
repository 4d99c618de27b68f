mod config;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::*;
use trapgate_common::Services;
use trapgate_protocol_ssh::SSHProtocolServer;

#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub struct Cli {
    /// Configuration file
    #[clap(long, short, default_value = "config.yaml")]
    config: PathBuf,

    /// Increase logging verbosity
    #[clap(long, short = 'd', action = clap::ArgAction::Count)]
    debug: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli);

    let config = config::load_config(&cli.config)?;
    let services = Services::new(config);

    SSHProtocolServer::new(&services).run().await?;
    info!("Exiting");
    Ok(())
}
