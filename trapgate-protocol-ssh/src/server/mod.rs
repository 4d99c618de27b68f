mod line_editor;
mod russh_handler;
mod session;

use std::borrow::Cow;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
pub use line_editor::{CompletionSource, LineEditor, TerminalIo};
use russh::keys::{Algorithm, HashAlg};
use russh::{cipher, kex, mac, MethodKind, MethodSet, Preferred, SshId};
pub use russh_handler::ServerHandler;
pub use session::ServerSession;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc::unbounded_channel;
use tracing::*;
use trapgate_common::Services;

use crate::banner::probe_server_banner;
use crate::keys::load_host_key;
use crate::sock::set_tcp_cork;
use crate::SshBackend;

const LISTEN_BACKLOG: u32 = 100;

pub async fn run_server(services: Services) -> Result<()> {
    let shell_backend = Arc::new(SshBackend::new(services.config.shell_target.clone()));
    let recorder_backend = Arc::new(SshBackend::new(services.config.recorder_target.clone()));

    let mut russh_config = russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        methods: MethodSet::from(&[MethodKind::Password][..]),
        keys: vec![load_host_key(&services.config)?],
        event_buffer_size: 100,
        nodelay: true,
        preferred: Preferred {
            key: Cow::Borrowed(&[
                Algorithm::Rsa {
                    hash: Some(HashAlg::Sha512),
                },
                Algorithm::Rsa {
                    hash: Some(HashAlg::Sha256),
                },
                Algorithm::Rsa { hash: None },
            ]),
            cipher: Cow::Borrowed(&[
                cipher::AES_128_CTR,
                cipher::AES_192_CTR,
                cipher::AES_256_CTR,
            ]),
            mac: Cow::Borrowed(&[mac::HMAC_SHA256, mac::HMAC_SHA512, mac::HMAC_SHA1]),
            kex: Cow::Borrowed(&[
                kex::ECDH_SHA2_NISTP256,
                kex::ECDH_SHA2_NISTP384,
                kex::ECDH_SHA2_NISTP521,
                kex::DH_G14_SHA256,
                kex::DH_G16_SHA512,
                kex::DH_G14_SHA1,
            ]),
            ..<_>::default()
        },
        ..<_>::default()
    };

    // The proxy masquerades as the shell backend, banner included.
    match probe_server_banner(&services.config.shell_target).await {
        Ok(banner) => {
            info!(%banner, "Presenting the backend banner");
            russh_config.server_id = SshId::Standard(banner.into());
        }
        Err(error) => {
            warn!(%error, "Could not probe the backend banner, keeping the default");
        }
    }

    let russh_config = Arc::new(russh_config);

    let address: SocketAddr = services
        .config
        .ssh
        .listen
        .parse()
        .context("parsing the listen address")?;
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(address)?;
    let listener: TcpListener = socket.listen(LISTEN_BACKLOG)?;
    info!(%address, "Listening");

    loop {
        let (stream, remote_address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                error!(%error, "Error accepting connection");
                continue;
            }
        };
        info!(%remote_address, "Connection");

        let socket_fd = stream.as_raw_fd();
        // Corked until the handshake completes.
        if let Err(error) = set_tcp_cork(socket_fd, true) {
            debug!(%error, "Failed to cork the client socket");
        }

        let (event_tx, event_rx) = unbounded_channel();
        let handler = ServerHandler { event_tx };

        let session = ServerSession::new(
            remote_address,
            address,
            services.clone(),
            shell_backend.clone(),
            recorder_backend.clone(),
            socket_fd,
        );

        tokio::spawn(async move {
            if let Err(error) = session.run(event_rx).await {
                error!(%error, "Session failed");
            }
        });

        tokio::spawn(_run_stream(russh_config.clone(), stream, handler));
    }
}

async fn _run_stream<R>(
    config: Arc<russh::server::Config>,
    socket: R,
    handler: ServerHandler,
) -> Result<()>
where
    R: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static,
{
    let ret = async move {
        let session = russh::server::run_stream(config, socket, handler).await?;
        session.await?;
        Ok(())
    }
    .await;

    if let Err(ref error) = ret {
        error!(%error, "Session failed");
    }

    ret
}
