use russh::keys::PublicKey;

use super::error::ConnectionError;

/// Backends are ephemeral honeypot peers; any host key is accepted.
pub struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = ConnectionError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
