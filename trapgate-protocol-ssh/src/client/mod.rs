mod error;
mod handler;
mod parser;

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

pub use error::ConnectionError;
use handler::ClientHandler;
pub use parser::CommandResult;
use parser::{contains_prompt, parse_transcript};
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::*;
use trapgate_common::{strip_ansi, TargetSSHOptions};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const TAB_CAPTURE_TIMEOUT: Duration = Duration::from_secs(1);
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Password-auth SSH client for one backend. Every operation opens its
/// own short-lived session and releases it on all exit paths; nothing is
/// shared between operations.
pub struct SshBackend {
    options: TargetSSHOptions,
    held_shell: Mutex<Option<BackendShell>>,
}

impl SshBackend {
    pub fn new(options: TargetSSHOptions) -> Self {
        SshBackend {
            options,
            held_shell: Mutex::new(None),
        }
    }

    /// Connects and attempts a shell purely so the backend sees the
    /// credentials. Connect and auth failures propagate; a missing shell
    /// does not.
    pub async fn record_login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), ConnectionError> {
        let session = self.connect(username, password).await?;
        match Self::open_shell_channel(&session).await {
            Ok(channel) => {
                BackendShell { session, channel }.close().await;
            }
            Err(error) => {
                debug!(%error, "Shell not available while recording the login");
                let _ = session
                    .disconnect(Disconnect::ByApplication, "", "")
                    .await;
            }
        }
        Ok(())
    }

    /// Runs one command in a fresh interactive shell, restoring `dir_cmd`
    /// first when it is non-empty, and scrapes output and cwd from the
    /// transcript.
    pub async fn execute_command(
        &self,
        command: &str,
        username: &str,
        password: &str,
        dir_cmd: &str,
    ) -> Result<CommandResult, ConnectionError> {
        let mut shell = self.open_shell(username, password).await?;
        let result = Self::run_command(&mut shell, command, dir_cmd).await;
        shell.close().await;
        result
    }

    /// Replays the command with a trailing TAB and captures whatever the
    /// backend suggests. Returns the probed command and the raw
    /// (ANSI-inclusive) capture.
    pub async fn execute_with_tab(
        &self,
        cwd: &str,
        command: String,
        username: &str,
        password: &str,
    ) -> Result<(String, String), ConnectionError> {
        let mut shell = self.open_shell(username, password).await?;
        let result = Self::run_tab_probe(&mut shell, cwd, &command).await;
        shell.close().await;
        result.map(|output| (command, output))
    }

    /// Drains bytes pending on a held shell until the deadline. With the
    /// per-operation session model the slot is empty between operations,
    /// so this returns quickly.
    pub async fn flush_buffer(&self, timeout: Duration) {
        let mut held = self.held_shell.lock().await;
        if let Some(shell) = held.as_mut() {
            shell.drain(Instant::now() + timeout).await;
        }
    }

    async fn connect(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Handle<ClientHandler>, ConnectionError> {
        let address_str = format!("{}:{}", self.options.host, self.options.port);
        let address = address_str
            .to_socket_addrs()
            .map_err(ConnectionError::Io)
            .and_then(|mut x| x.next().ok_or(ConnectionError::Resolve))?;

        let config = Arc::new(russh::client::Config::default());
        let mut session = tokio::time::timeout(
            CONNECT_TIMEOUT,
            russh::client::connect(config, address, ClientHandler),
        )
        .await
        .map_err(|_| ConnectionError::Timeout)??;

        let auth_result = tokio::time::timeout(
            CONNECT_TIMEOUT,
            session.authenticate_password(username, password),
        )
        .await
        .map_err(|_| ConnectionError::Timeout)??;
        if !auth_result.success() {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "")
                .await;
            return Err(ConnectionError::Authentication);
        }

        Ok(session)
    }

    async fn open_shell_channel(
        session: &Handle<ClientHandler>,
    ) -> Result<Channel<Msg>, ConnectionError> {
        let channel = session.channel_open_session().await?;
        channel
            .request_pty(true, "xterm256-color", 80, 25, 0, 0, &[(Pty::TTY_OP_END, 0)])
            .await?;
        channel.request_shell(true).await?;
        Ok(channel)
    }

    /// Tolerates partial acquisition: a failed channel open still
    /// disconnects the session.
    async fn open_shell(
        &self,
        username: &str,
        password: &str,
    ) -> Result<BackendShell, ConnectionError> {
        let session = self.connect(username, password).await?;
        match Self::open_shell_channel(&session).await {
            Ok(channel) => Ok(BackendShell { session, channel }),
            Err(error) => {
                let _ = session
                    .disconnect(Disconnect::ByApplication, "", "")
                    .await;
                Err(error)
            }
        }
    }

    async fn run_command(
        shell: &mut BackendShell,
        command: &str,
        dir_cmd: &str,
    ) -> Result<CommandResult, ConnectionError> {
        shell.wait_for_prompt().await?;
        if !dir_cmd.is_empty() {
            shell.send(&format!("{dir_cmd}\n")).await?;
            shell.wait_for_prompt().await?;
        }
        shell.send(&format!("{command}\n")).await?;
        let (output, prompt_chunk) = shell.recv_until_prompt().await?;
        Ok(parse_transcript(&output, &prompt_chunk, command))
    }

    async fn run_tab_probe(
        shell: &mut BackendShell,
        cwd: &str,
        command: &str,
    ) -> Result<String, ConnectionError> {
        shell.wait_for_prompt().await?;
        shell.send(&format!("cd {cwd}\n")).await?;
        shell.wait_for_prompt().await?;

        let raw_command = command.replace('\t', "");
        shell.send(&format!("{raw_command}\t")).await?;

        // Capture until the deadline, or until the suggestion extends
        // past the echoed command.
        let deadline = Instant::now() + TAB_CAPTURE_TIMEOUT;
        let mut output: Vec<u8> = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match shell.recv_chunk_within(remaining).await? {
                Some(chunk) => {
                    output.extend_from_slice(&chunk);
                    let cleaned = strip_ansi(&String::from_utf8_lossy(&output));
                    if let Some(index) = cleaned.rfind(&raw_command) {
                        if cleaned.len() > index + raw_command.len() {
                            break;
                        }
                    }
                }
                None => break,
            }
        }

        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

impl std::fmt::Debug for SshBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SshBackend({}:{})", self.options.host, self.options.port)
    }
}

/// One session + shell channel pair, never reused across operations.
/// `close` releases channel first, then the transport and client in one
/// disconnect, and is safe on every exit path.
struct BackendShell {
    session: Handle<ClientHandler>,
    channel: Channel<Msg>,
}

impl BackendShell {
    async fn send(&mut self, data: &str) -> Result<(), ConnectionError> {
        self.channel.data(data.as_bytes()).await?;
        Ok(())
    }

    /// Next data chunk, `None` on EOF or channel close.
    async fn recv_chunk_within(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, ConnectionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let message = tokio::time::timeout_at(deadline, self.channel.wait())
                .await
                .map_err(|_| ConnectionError::Timeout)?;
            match message {
                Some(ChannelMsg::Data { data }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::ExtendedData { data, .. }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(None),
                Some(_) => continue,
            }
        }
    }

    async fn recv_chunk(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        self.recv_chunk_within(READ_TIMEOUT).await
    }

    /// Reads chunks until one carries a prompt marker. EOF ends the wait
    /// without error.
    async fn wait_for_prompt(&mut self) -> Result<(), ConnectionError> {
        while let Some(chunk) = self.recv_chunk().await? {
            if contains_prompt(&chunk) {
                break;
            }
        }
        Ok(())
    }

    /// Accumulates chunks until the prompt returns; the chunk the marker
    /// was seen in is returned separately for cwd scraping.
    async fn recv_until_prompt(&mut self) -> Result<(Vec<u8>, Vec<u8>), ConnectionError> {
        let mut output = Vec::new();
        let mut prompt_chunk = Vec::new();
        while let Some(chunk) = self.recv_chunk().await? {
            output.extend_from_slice(&chunk);
            if contains_prompt(&chunk) {
                prompt_chunk = chunk;
                break;
            }
        }
        Ok((output, prompt_chunk))
    }

    async fn drain(&mut self, deadline: Instant) {
        while Instant::now() < deadline {
            match tokio::time::timeout(FLUSH_POLL_INTERVAL, self.channel.wait()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => continue,
            }
        }
    }

    async fn close(self) {
        drop(self.channel);
        let _ = self
            .session
            .disconnect(Disconnect::ByApplication, "", "")
            .await;
    }
}
