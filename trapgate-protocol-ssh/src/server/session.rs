use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Handle};
use russh::ChannelId;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::*;
use trapgate_common::{format_prompt, motd_lines, strip_ansi, Services};
use uuid::Uuid;

use super::line_editor::{CompletionSource, LineEditor, TerminalIo};
use super::russh_handler::ServerHandlerEvent;
use crate::common::ServerChannelId;
use crate::sock::set_tcp_cork;
use crate::SshBackend;

const CHANNEL_ACCEPT_TIMEOUT: Duration = Duration::from_secs(20);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const SESSION_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
const MOTD_LINE_DELAY: Duration = Duration::from_millis(5);
const HOSTNAME_LIMIT: usize = 9;

const BACKEND_LOST_NOTICE: &[u8] = b"Connection to backend lost. Session terminated.\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelMode {
    Pending,
    Shell,
    Exec,
}

pub struct ServerSession {
    id: Uuid,
    remote_address: SocketAddr,
    listen_address: SocketAddr,
    services: Services,
    shell_backend: Arc<SshBackend>,
    recorder_backend: Arc<SshBackend>,
    socket_fd: RawFd,
    session_handle: Option<Handle>,
    channel: Option<ServerChannelId>,
    input_tx: Option<UnboundedSender<Bytes>>,
    username: Option<String>,
    password: Option<String>,
    mode: ChannelMode,
    deadline: Option<Instant>,
    started_at: std::time::Instant,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} - {}]", self.id, self.remote_address)
    }
}

impl ServerSession {
    pub fn new(
        remote_address: SocketAddr,
        listen_address: SocketAddr,
        services: Services,
        shell_backend: Arc<SshBackend>,
        recorder_backend: Arc<SshBackend>,
        socket_fd: RawFd,
    ) -> Self {
        ServerSession {
            id: Uuid::new_v4(),
            remote_address,
            listen_address,
            services,
            shell_backend,
            recorder_backend,
            socket_fd,
            session_handle: None,
            channel: None,
            input_tx: None,
            username: None,
            password: None,
            mode: ChannelMode::Pending,
            deadline: None,
            started_at: std::time::Instant::now(),
        }
    }

    pub async fn run(
        mut self,
        mut event_rx: UnboundedReceiver<ServerHandlerEvent>,
    ) -> Result<()> {
        loop {
            let event = match self.deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, event_rx.recv()).await {
                        Ok(event) => event,
                        Err(_) => {
                            info!(session=%self.id, "No channel activity before the deadline, closing");
                            self.close_channel().await;
                            break;
                        }
                    }
                }
                None => event_rx.recv().await,
            };
            let Some(event) = event else { break };
            if self.handle_event(event).await {
                break;
            }
        }
        debug!(session=%self.id, "No more events");
        Ok(())
    }

    /// Returns `true` once the session is finished.
    async fn handle_event(&mut self, event: ServerHandlerEvent) -> bool {
        match event {
            ServerHandlerEvent::AuthPassword(username, password, reply) => {
                let auth = self.handle_auth(&username, &password).await;
                if matches!(auth, Auth::Accept) && self.username.is_none() {
                    // Published once; read-only for the rest of the session.
                    self.username = Some(username);
                    self.password = Some(password);
                }
                let _ = reply.send(auth);
            }
            ServerHandlerEvent::Authenticated(handle) => {
                self.session_handle = Some(handle.0);
                if let Err(error) = set_tcp_cork(self.socket_fd, false) {
                    debug!(session=%self.id, %error, "Failed to uncork the client socket");
                }
                self.deadline = Some(Instant::now() + CHANNEL_ACCEPT_TIMEOUT);
            }
            ServerHandlerEvent::ChannelOpenSession(channel, reply) => {
                let accepted = self.channel.is_none();
                if accepted {
                    self.channel = Some(channel);
                    self.deadline = Some(Instant::now() + REQUEST_TIMEOUT);
                    debug!(session=%self.id, %channel, "Opened channel");
                }
                let _ = reply.send(accepted);
            }
            ServerHandlerEvent::PtyRequest(_, _, reply) => {
                let _ = reply.send(());
            }
            ServerHandlerEvent::ShellRequest(channel, reply) => {
                let started = self.start_shell(channel);
                let _ = reply.send(started);
            }
            ServerHandlerEvent::ExecRequest(channel, data, reply) => {
                let started = self.start_exec(channel, data);
                let _ = reply.send(started);
            }
            ServerHandlerEvent::Data(_, data, reply) => {
                if let Some(input_tx) = &self.input_tx {
                    let _ = input_tx.send(data);
                }
                let _ = reply.send(());
            }
            ServerHandlerEvent::ChannelEof(_, reply) => {
                self.input_tx = None;
                let _ = reply.send(());
            }
            ServerHandlerEvent::ChannelClose(channel, reply) => {
                debug!(session=%self.id, %channel, "Closed channel");
                self.input_tx = None;
                let _ = reply.send(());
            }
            ServerHandlerEvent::Disconnect => {
                self.input_tx = None;
                return true;
            }
        }
        false
    }

    async fn handle_auth(&mut self, username: &str, password: &str) -> Auth {
        let outcome = self.services.policy.evaluate(username, password);

        // Best-effort: the recorder backend only needs to see the
        // credentials, its availability never blocks the client.
        if let Err(error) = self.recorder_backend.record_login(username, password).await {
            warn!(session=%self.id, %error, "Failed to record the login attempt");
        }

        self.services.events.login_attempt(
            self.remote_address,
            &self.listen_address.ip().to_string(),
            self.listen_address.port(),
            username,
            password,
            outcome.granted,
        );

        if outcome.granted {
            info!(session=%self.id, %username, "Authenticated");
            Auth::Accept
        } else {
            warn!(session=%self.id, %username, "Authentication failed");
            Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }
        }
    }

    fn session_context(&self) -> Option<SessionContext> {
        Some(SessionContext {
            id: self.id,
            remote_address: self.remote_address,
            services: self.services.clone(),
            backend: self.shell_backend.clone(),
            username: self.username.clone()?,
            password: self.password.clone()?,
            started_at: self.started_at,
        })
    }

    fn start_shell(&mut self, channel: ServerChannelId) -> bool {
        if self.channel != Some(channel) || self.mode != ChannelMode::Pending {
            return false;
        }
        let Some(handle) = self.session_handle.clone() else {
            return false;
        };
        let Some(context) = self.session_context() else {
            return false;
        };

        self.mode = ChannelMode::Shell;
        self.deadline = None;

        let (input_tx, input_rx) = unbounded_channel();
        self.input_tx = Some(input_tx);
        let io = ChannelIo::new(handle, channel.0, input_rx);

        info!(session=%self.id, "Starting shell");
        tokio::spawn(run_shell_session(io, context));
        true
    }

    fn start_exec(&mut self, channel: ServerChannelId, data: Bytes) -> bool {
        if self.channel != Some(channel) || self.mode != ChannelMode::Pending {
            return false;
        }
        let Some(handle) = self.session_handle.clone() else {
            return false;
        };
        let Some(context) = self.session_context() else {
            return false;
        };

        self.mode = ChannelMode::Exec;
        self.deadline = None;

        let (_input_tx, input_rx) = unbounded_channel();
        let io = ChannelIo::new(handle, channel.0, input_rx);

        tokio::spawn(run_exec(io, context, data));
        true
    }

    async fn close_channel(&mut self) {
        if let (Some(handle), Some(channel)) = (&self.session_handle, self.channel) {
            let _ = handle.close(channel.0).await;
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        info!(session=%self.id, "Closed connection");
        debug!(session=%self.id, "Dropped");
    }
}

/// Everything a detached channel worker needs from the session.
struct SessionContext {
    id: Uuid,
    remote_address: SocketAddr,
    services: Services,
    backend: Arc<SshBackend>,
    username: String,
    password: String,
    started_at: std::time::Instant,
}

/// Terminal transport over a server channel: bytes in via the handler
/// event pipe, bytes out via the session handle.
pub struct ChannelIo {
    handle: Handle,
    channel: ChannelId,
    input_rx: UnboundedReceiver<Bytes>,
    pending: VecDeque<u8>,
}

impl ChannelIo {
    fn new(handle: Handle, channel: ChannelId, input_rx: UnboundedReceiver<Bytes>) -> Self {
        ChannelIo {
            handle,
            channel,
            input_rx,
            pending: VecDeque::new(),
        }
    }

    async fn exit_status(&mut self, status: u32) {
        let _ = self.handle.exit_status_request(self.channel, status).await;
    }

    async fn eof(&mut self) {
        let _ = self.handle.eof(self.channel).await;
    }

    async fn close(&mut self) {
        let _ = self.handle.close(self.channel).await;
    }
}

#[async_trait]
impl TerminalIo for ChannelIo {
    async fn recv_byte(&mut self) -> Result<Option<u8>> {
        loop {
            if let Some(byte) = self.pending.pop_front() {
                return Ok(Some(byte));
            }
            match self.input_rx.recv().await {
                Some(data) => self.pending.extend(data.iter()),
                None => return Ok(None),
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.handle
            .data(self.channel, bytes::Bytes::copy_from_slice(data))
            .await
            .map_err(|_| anyhow::anyhow!("channel write failed"))
    }
}

/// Completion probes ride a fresh backend session authenticated with the
/// client's own credentials.
struct BackendCompletion {
    backend: Arc<SshBackend>,
    username: String,
    password: String,
}

#[async_trait]
impl CompletionSource for BackendCompletion {
    async fn complete(&mut self, cwd: &str, command: String) -> Result<(String, String)> {
        let cwd = if cwd.is_empty() { "~" } else { cwd };
        Ok(self
            .backend
            .execute_with_tab(cwd, command, &self.username, &self.password)
            .await?)
    }
}

fn truncated_to_bytes(value: &str, limit: usize) -> &str {
    if value.len() <= limit {
        return value;
    }
    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

fn build_dir_cmd(cwd: &str) -> String {
    if cwd.is_empty() || cwd == "~" {
        String::new()
    } else {
        format!("cd {cwd}")
    }
}

async fn send_motd(io: &mut ChannelIo, services: &Services, hostname: &str) -> Result<()> {
    io.send(b"\r\n").await?;
    for line in motd_lines(Path::new(&services.config.motd_file), hostname) {
        io.send(format!("{}\r\n", line.trim_end()).as_bytes()).await?;
        tokio::time::sleep(MOTD_LINE_DELAY).await;
    }
    Ok(())
}

async fn run_shell_session(mut io: ChannelIo, context: SessionContext) {
    let hostname = std::env::var("HOST_NAME").unwrap_or_default();
    let hostname = truncated_to_bytes(&hostname, HOSTNAME_LIMIT).to_owned();

    context.backend.flush_buffer(SESSION_FLUSH_TIMEOUT).await;

    if let Err(error) = send_motd(&mut io, &context.services, &hostname).await {
        debug!(session=%context.id, %error, "Failed to send the banner");
    }

    let completer = BackendCompletion {
        backend: context.backend.clone(),
        username: context.username.clone(),
        password: context.password.clone(),
    };
    let prompt = format_prompt(&context.username, &hostname, "~");
    let mut editor = LineEditor::new(io, completer, prompt, "~".to_owned());

    if let Err(error) = shell_repl(&mut editor, &context, &hostname).await {
        warn!(session=%context.id, %error, "Shell session ended with an error");
    }

    // Teardown runs on every exit path.
    let duration = context.started_at.elapsed();
    context.services.events.session_close(
        context.remote_address,
        &context.username,
        duration,
        "Session closed",
    );
    if let Err(error) = editor.cleanup().await {
        debug!(session=%context.id, %error, "Failed to reset the client terminal");
    }
    let mut io = editor.into_io();
    io.close().await;
    info!(session=%context.id, "Shell session closed");
}

async fn shell_repl(
    editor: &mut LineEditor<ChannelIo, BackendCompletion>,
    context: &SessionContext,
    hostname: &str,
) -> Result<()> {
    let mut cwd = "~".to_owned();

    loop {
        let Some(command) = editor.read().await? else {
            info!(session=%context.id, "Client closed the connection");
            break;
        };
        if command.is_empty() {
            continue;
        }

        context.services.events.command_input(
            context.remote_address,
            &context.username,
            &command,
            &cwd,
        );

        if matches!(
            command.to_lowercase().as_str(),
            "exit" | "quit" | "exit;" | "quit;"
        ) {
            break;
        }

        let dir_cmd = build_dir_cmd(&cwd);
        let result = match context
            .backend
            .execute_command(&command, &context.username, &context.password, &dir_cmd)
            .await
        {
            Ok(result) => result,
            Err(error) => {
                warn!(session=%context.id, %error, "Lost the shell backend mid-session");
                editor.send(BACKEND_LOST_NOTICE).await?;
                break;
            }
        };

        cwd = result.cwd;
        editor.update_cwd(cwd.clone());
        editor.update_prompt(format_prompt(&context.username, hostname, &cwd));
        editor.send(strip_ansi(&result.output).as_bytes()).await?;
    }
    Ok(())
}

async fn run_exec(mut io: ChannelIo, context: SessionContext, command: Bytes) {
    let command = String::from_utf8_lossy(&command).into_owned();
    info!(session=%context.id, command=%command, "Exec request");

    context
        .services
        .events
        .command_input(context.remote_address, &context.username, &command, "~");

    let status = match context
        .backend
        .execute_command(&command, &context.username, &context.password, "")
        .await
    {
        Ok(result) => {
            if let Err(error) = io.send(strip_ansi(&result.output).as_bytes()).await {
                debug!(session=%context.id, %error, "Failed to write exec output");
            }
            0
        }
        Err(error) => {
            warn!(session=%context.id, %error, "Exec against the backend failed");
            let _ = io.send(BACKEND_LOST_NOTICE).await;
            1
        }
    };

    io.exit_status(status).await;
    io.eof().await;
    io.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_dir_cmd() {
        assert_eq!(build_dir_cmd("~"), "");
        assert_eq!(build_dir_cmd(""), "");
        assert_eq!(build_dir_cmd("/var/log"), "cd /var/log");
    }

    #[test]
    fn test_hostname_truncation() {
        assert_eq!(truncated_to_bytes("short", 9), "short");
        assert_eq!(truncated_to_bytes("exactly-nine!", 9), "exactly-n");
        // Never splits a multibyte character.
        assert_eq!(truncated_to_bytes("héllohost", 5), "héll");
    }
}
