mod banner;
mod client;
mod common;
mod keys;
mod server;
mod sock;

use std::fmt::Debug;

use anyhow::Result;
pub use client::*;
pub use common::*;
pub use server::run_server;
use trapgate_common::Services;

#[derive(Clone)]
pub struct SSHProtocolServer {
    services: Services,
}

impl SSHProtocolServer {
    pub fn new(services: &Services) -> Self {
        SSHProtocolServer {
            services: services.clone(),
        }
    }

    pub async fn run(self) -> Result<()> {
        run_server(self.services).await
    }
}

impl Debug for SSHProtocolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSHProtocolServer")
    }
}
