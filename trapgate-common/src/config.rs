use serde::{Deserialize, Serialize};

fn _default_listen() -> String {
    "0.0.0.0:22".to_owned()
}

fn _default_host_key() -> String {
    "/certs/ssh_host_rsa_key".to_owned()
}

fn _default_credentials_file() -> String {
    "./config/user.txt".to_owned()
}

fn _default_motd_file() -> String {
    "/config/motd.txt".to_owned()
}

fn _default_event_log() -> String {
    "/var/log/paramiko/paramiko.log".to_owned()
}

fn _default_ssh_port() -> u16 {
    22
}

fn _default_shell_target() -> TargetSSHOptions {
    TargetSSHOptions {
        host: "cowrie".to_owned(),
        port: 2222,
    }
}

fn _default_recorder_target() -> TargetSSHOptions {
    TargetSSHOptions {
        host: "heralding".to_owned(),
        port: 22,
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TargetSSHOptions {
    pub host: String,

    #[serde(default = "_default_ssh_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SSHProxyConfig {
    #[serde(default = "_default_listen")]
    pub listen: String,

    #[serde(default = "_default_host_key")]
    pub host_key: String,
}

impl Default for SSHProxyConfig {
    fn default() -> Self {
        SSHProxyConfig {
            listen: _default_listen(),
            host_key: _default_host_key(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TrapgateConfig {
    #[serde(default)]
    pub ssh: SSHProxyConfig,

    /// Backend that provides the interactive shell semantics.
    #[serde(default = "_default_shell_target")]
    pub shell_target: TargetSSHOptions,

    /// Side-channel endpoint that records login attempts.
    #[serde(default = "_default_recorder_target")]
    pub recorder_target: TargetSSHOptions,

    #[serde(default = "_default_credentials_file")]
    pub credentials_file: String,

    #[serde(default = "_default_motd_file")]
    pub motd_file: String,

    #[serde(default = "_default_event_log")]
    pub event_log: String,
}

impl Default for TrapgateConfig {
    fn default() -> Self {
        TrapgateConfig {
            ssh: SSHProxyConfig::default(),
            shell_target: _default_shell_target(),
            recorder_target: _default_recorder_target(),
            credentials_file: _default_credentials_file(),
            motd_file: _default_motd_file(),
            event_log: _default_event_log(),
        }
    }
}
