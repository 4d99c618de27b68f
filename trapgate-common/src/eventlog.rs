use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::*;

const EVENT_SOURCE: &str = "trapgate";
const PROTOCOL: &str = "ssh";

#[derive(Debug, Serialize)]
struct LoginAttemptEvent<'a> {
    timestamp: String,
    #[serde(rename = "type")]
    kind: &'a str,
    eventid: &'a str,
    src_ip: String,
    src_port: u16,
    dest_ip: &'a str,
    dest_port: u16,
    username: &'a str,
    password: &'a str,
    protocol: &'a str,
    success: bool,
}

#[derive(Debug, Serialize)]
struct CommandInputEvent<'a> {
    timestamp: String,
    #[serde(rename = "type")]
    kind: &'a str,
    eventid: &'a str,
    src_ip: String,
    src_port: u16,
    username: &'a str,
    command: &'a str,
    cwd: &'a str,
    protocol: &'a str,
}

#[derive(Debug, Serialize)]
struct SessionCloseEvent<'a> {
    timestamp: String,
    #[serde(rename = "type")]
    kind: &'a str,
    eventid: &'a str,
    src_ip: String,
    src_port: u16,
    username: &'a str,
    duration: String,
    message: &'a str,
    protocol: &'a str,
}

/// Append-only JSON-lines sink. Each record goes out as a single write so
/// interleaved workers cannot tear individual lines.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        EventLog {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn login_attempt(
        &self,
        src: SocketAddr,
        dest_ip: &str,
        dest_port: u16,
        username: &str,
        password: &str,
        success: bool,
    ) {
        self.append(&LoginAttemptEvent {
            timestamp: now_utc(),
            kind: EVENT_SOURCE,
            eventid: "trapgate.login.attempt",
            src_ip: src.ip().to_string(),
            src_port: src.port(),
            dest_ip,
            dest_port,
            username,
            password,
            protocol: PROTOCOL,
            success,
        });
    }

    pub fn command_input(&self, src: SocketAddr, username: &str, command: &str, cwd: &str) {
        self.append(&CommandInputEvent {
            timestamp: now_utc(),
            kind: EVENT_SOURCE,
            eventid: "trapgate.command.input",
            src_ip: src.ip().to_string(),
            src_port: src.port(),
            username,
            command,
            cwd,
            protocol: PROTOCOL,
        });
    }

    pub fn session_close(&self, src: SocketAddr, username: &str, duration: Duration, message: &str) {
        self.append(&SessionCloseEvent {
            timestamp: now_utc(),
            kind: EVENT_SOURCE,
            eventid: "trapgate.session.close",
            src_ip: src.ip().to_string(),
            src_port: src.port(),
            username,
            duration: format!("{:.2}s", duration.as_secs_f64()),
            message,
            protocol: PROTOCOL,
        });
    }

    fn append<T: Serialize>(&self, event: &T) {
        let mut line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(error) => {
                warn!(%error, "Failed to serialize event");
                return;
            }
        };
        line.push('\n');

        #[allow(clippy::unwrap_used)]
        let _guard = self.write_lock.lock().unwrap();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(error) = result {
            warn!(%error, path=%self.path.display(), "Failed to append event record");
        }
    }
}

fn now_utc() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_records(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_login_attempt_record_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let log = EventLog::new(&path);

        log.login_attempt(
            "10.0.0.5:40022".parse().unwrap(),
            "0.0.0.0",
            22,
            "root",
            "hunter2",
            false,
        );

        let records = read_records(&path);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record["eventid"], "trapgate.login.attempt");
        assert_eq!(record["src_ip"], "10.0.0.5");
        assert_eq!(record["src_port"], 40022);
        assert_eq!(record["username"], "root");
        assert_eq!(record["password"], "hunter2");
        assert_eq!(record["protocol"], "ssh");
        assert_eq!(record["success"], false);
        assert!(record["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let log = EventLog::new(&path);

        let src = "192.0.2.1:1234".parse().unwrap();
        log.command_input(src, "admin", "ls -la", "/tmp");
        log.session_close(src, "admin", Duration::from_millis(1500), "Session closed");

        let records = read_records(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["eventid"], "trapgate.command.input");
        assert_eq!(records[0]["cwd"], "/tmp");
        assert_eq!(records[1]["eventid"], "trapgate.session.close");
        assert_eq!(records[1]["duration"], "1.50s");
    }

    #[test]
    fn test_unwritable_path_is_swallowed() {
        let log = EventLog::new("/nonexistent-dir/events.log");
        log.command_input("192.0.2.1:1".parse().unwrap(), "u", "c", "~");
    }
}
