use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, trace, warn};
use vmgate_protocol::qmp::{QmpCommand, QmpEvent, QmpGreeting, QmpMessage};

/// Default timeout for individual QMP commands. If QEMU does not respond
/// within this duration the command is considered failed.
pub const DEFAULT_QMP_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum delay between connection retry attempts in `connect_with_retry`.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Async events kept for inspection; older ones are dropped.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// Nothing answered on the socket. The machine may not be running yet.
    #[error("machine not reachable at {path}: {reason}")]
    Unreachable { path: PathBuf, reason: String },

    #[error("monitor handshake failed: {0}")]
    Handshake(String),

    /// The far end answered with an error object.
    #[error("monitor command '{command}' failed: {desc} ({class})")]
    Protocol {
        command: String,
        class: String,
        desc: String,
    },

    #[error("monitor transport error: {0}")]
    Transport(String),

    #[error("monitor command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// An earlier transport failure or timeout broke this session.
    #[error("monitor session was invalidated by an earlier failure; reconnect")]
    Invalidated,

    #[error("invalid snapshot tag '{0}': use 1-128 of [A-Za-z0-9._-]")]
    InvalidTag(String),
}

impl MonitorError {
    /// True when the machine itself could not be talked to, as opposed to
    /// the machine refusing a command.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            MonitorError::Unreachable { .. }
                | MonitorError::Transport(_)
                | MonitorError::Timeout { .. }
                | MonitorError::Invalidated
        )
    }
}

/// Validate a tag name used in HMP commands (savevm, loadvm, delvm).
///
/// HMP commands are parsed as free-form text, so special characters could
/// inject additional commands. Tags are restricted to safe characters.
pub fn validate_hmp_tag(tag: &str) -> Result<(), MonitorError> {
    let ok = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(MonitorError::InvalidTag(tag.to_string()))
    }
}

/// Status of the QEMU VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStatus {
    Running,
    Paused,
    Shutdown,
    /// Any other status reported by QMP.
    Other(String),
}

/// QMP (QEMU Machine Protocol) client for one running machine.
///
/// Commands are strictly request/response; async events that arrive in
/// between are buffered. A transport error or timeout marks the session
/// broken and every later call fails with [`MonitorError::Invalidated`].
pub struct QmpClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    socket_path: PathBuf,
    /// Timeout applied to each individual QMP command (write + read loop).
    command_timeout: Duration,
    events: VecDeque<QmpEvent>,
    broken: bool,
}

impl QmpClient {
    /// Connect to a QMP socket and perform the capability negotiation handshake.
    ///
    /// This will:
    /// 1. Connect to the Unix socket
    /// 2. Read the QMP greeting
    /// 3. Send `qmp_capabilities` to enter command mode
    pub async fn connect(socket_path: &Path) -> Result<Self, MonitorError> {
        Self::connect_with_timeout(socket_path, DEFAULT_QMP_COMMAND_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        socket_path: &Path,
        command_timeout: Duration,
    ) -> Result<Self, MonitorError> {
        let unreachable = |reason: String| MonitorError::Unreachable {
            path: socket_path.to_path_buf(),
            reason,
        };

        let stream = tokio::time::timeout(command_timeout, UnixStream::connect(socket_path))
            .await
            .map_err(|_| unreachable("connect timed out".into()))?
            .map_err(|e| unreachable(e.to_string()))?;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            socket_path: socket_path.to_path_buf(),
            command_timeout,
            events: VecDeque::new(),
            broken: false,
        };

        // Read the QMP greeting
        let greeting_line = tokio::time::timeout(command_timeout, client.read_line())
            .await
            .map_err(|_| unreachable("no greeting".into()))??;
        let greeting: QmpGreeting = serde_json::from_str(&greeting_line).map_err(|e| {
            MonitorError::Handshake(format!("bad greeting '{}': {}", greeting_line, e))
        })?;
        debug!(
            socket = %socket_path.display(),
            version = %greeting.qmp.version,
            "QMP greeting received"
        );

        // Negotiate capabilities (we accept defaults)
        client
            .execute("qmp_capabilities", None)
            .await
            .map_err(|e| match e {
                MonitorError::Protocol { desc, .. } => MonitorError::Handshake(desc),
                other => other,
            })?;
        debug!(socket = %socket_path.display(), "QMP capabilities negotiated");

        Ok(client)
    }

    /// Connect to a QMP socket with retries, waiting for QEMU to create it.
    ///
    /// Uses exponential backoff starting at `retry_delay`, doubling each
    /// attempt, and capping at 2 seconds. Only "not reachable" failures are
    /// retried; a peer that speaks the wrong protocol fails at once.
    pub async fn connect_with_retry(
        socket_path: &Path,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Self, MonitorError> {
        let mut last_error = None;

        for attempt in 1..=max_retries {
            match Self::connect(socket_path).await {
                Ok(client) => return Ok(client),
                Err(e) if e.is_unreachable() => {
                    // attempt is 1-indexed, backoff_delay expects 0-indexed
                    let delay = backoff_delay(retry_delay, attempt - 1);
                    trace!(
                        attempt,
                        max_retries,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "QMP connect attempt failed, retrying"
                    );
                    last_error = Some(e);
                    if attempt < max_retries {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| MonitorError::Unreachable {
            path: socket_path.to_path_buf(),
            reason: "no connection attempts were made".into(),
        }))
    }

    /// Query the VM status.
    pub async fn query_status(&mut self) -> Result<VmStatus, MonitorError> {
        let result = self.execute("query-status", None).await?;
        let status_str = result["status"].as_str().ok_or_else(|| {
            MonitorError::Transport("query-status response missing 'status' field".into())
        })?;

        Ok(match status_str {
            "running" => VmStatus::Running,
            "paused" => VmStatus::Paused,
            "shutdown" => VmStatus::Shutdown,
            other => VmStatus::Other(other.to_string()),
        })
    }

    /// Stop (pause) the VM.
    pub async fn stop(&mut self) -> Result<(), MonitorError> {
        self.execute("stop", None).await?;
        Ok(())
    }

    /// Continue (resume) a paused VM.
    pub async fn cont(&mut self) -> Result<(), MonitorError> {
        self.execute("cont", None).await?;
        Ok(())
    }

    /// Initiate a clean shutdown via ACPI power button.
    pub async fn system_powerdown(&mut self) -> Result<(), MonitorError> {
        self.execute("system_powerdown", None).await?;
        Ok(())
    }

    /// Save disk and memory state under `tag`.
    pub async fn savevm(&mut self, tag: &str) -> Result<(), MonitorError> {
        validate_hmp_tag(tag)?;
        self.hmp_expect_silent(&format!("savevm {}", tag)).await
    }

    /// Restore VM state from a named tag.
    pub async fn loadvm(&mut self, tag: &str) -> Result<(), MonitorError> {
        validate_hmp_tag(tag)?;
        self.hmp_expect_silent(&format!("loadvm {}", tag)).await
    }

    /// Delete a saved VM state by tag name.
    pub async fn delvm(&mut self, tag: &str) -> Result<(), MonitorError> {
        validate_hmp_tag(tag)?;
        self.hmp_expect_silent(&format!("delvm {}", tag)).await
    }

    /// Raw `info snapshots` table.
    pub async fn info_snapshots(&mut self) -> Result<String, MonitorError> {
        self.hmp("info snapshots").await
    }

    /// Run a human-monitor command and return its text output.
    pub async fn hmp(&mut self, command_line: &str) -> Result<String, MonitorError> {
        let ret = self
            .execute(
                "human-monitor-command",
                Some(serde_json::json!({ "command-line": command_line })),
            )
            .await?;
        Ok(ret.as_str().unwrap_or_default().to_string())
    }

    /// HMP commands report failure as text, not as an error object.
    async fn hmp_expect_silent(&mut self, command_line: &str) -> Result<(), MonitorError> {
        let output = self.hmp(command_line).await?;
        let output = output.trim();
        if output.is_empty() {
            Ok(())
        } else {
            Err(MonitorError::Protocol {
                command: command_line.to_string(),
                class: "HmpError".into(),
                desc: output.to_string(),
            })
        }
    }

    /// Execute a QMP command and return the result value.
    ///
    /// The write + read loop is bounded by the command timeout. Async events
    /// seen before the reply are buffered.
    pub async fn execute(
        &mut self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, MonitorError> {
        if self.broken {
            return Err(MonitorError::Invalidated);
        }
        let timeout = self.command_timeout;
        let result = match tokio::time::timeout(timeout, self.execute_inner(command, arguments)).await
        {
            Ok(result) => result,
            Err(_) => Err(MonitorError::Timeout {
                command: command.to_string(),
                timeout,
            }),
        };
        if let Err(e) = &result {
            if matches!(e, MonitorError::Transport(_) | MonitorError::Timeout { .. }) {
                warn!(socket = %self.socket_path.display(), error = %e, "monitor session invalidated");
                self.broken = true;
            }
        }
        result
    }

    async fn execute_inner(
        &mut self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, MonitorError> {
        let json = QmpCommand::new(command, arguments)
            .to_line()
            .map_err(|e| MonitorError::Transport(format!("failed to serialize QMP command: {}", e)))?;

        trace!(command, json = %json.trim(), "sending QMP command");

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| MonitorError::Transport(format!("failed to write to QMP socket: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| MonitorError::Transport(format!("failed to flush QMP socket: {}", e)))?;

        // Read responses, buffering async events until we get a return or error
        loop {
            let line = self.read_line().await?;
            trace!(response = %line, "QMP response line");

            let message: QmpMessage = serde_json::from_str(&line).map_err(|e| {
                MonitorError::Transport(format!("unparseable QMP line '{}': {}", line, e))
            })?;

            match message {
                QmpMessage::Return { ret } => {
                    debug!(command, "QMP command succeeded");
                    return Ok(ret);
                }
                QmpMessage::Error { error } => {
                    return Err(MonitorError::Protocol {
                        command: command.to_string(),
                        class: error.class,
                        desc: error.desc,
                    });
                }
                QmpMessage::Event(event) => {
                    debug!(event = %event.event, "QMP async event received");
                    self.push_event(event);
                }
            }
        }
    }

    fn push_event(&mut self, event: QmpEvent) {
        if self.events.len() == EVENT_BUFFER {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Events drained so far, oldest first. Clears the buffer.
    pub fn take_events(&mut self) -> Vec<QmpEvent> {
        self.events.drain(..).collect()
    }

    /// Read a single line from the QMP socket.
    async fn read_line(&mut self) -> Result<String, MonitorError> {
        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| MonitorError::Transport(format!("failed to read from QMP socket: {}", e)))?;

        if bytes_read == 0 {
            return Err(MonitorError::Transport(format!(
                "QMP socket closed unexpectedly: {}",
                self.socket_path.display()
            )));
        }

        Ok(line.trim().to_string())
    }

    /// False once a transport failure or timeout broke the session.
    pub fn is_valid(&self) -> bool {
        !self.broken
    }
}

/// Compute the exponential backoff delay for a given attempt.
///
/// `attempt` is 0-indexed. The delay starts at `base` and doubles each
/// attempt, capping at `MAX_BACKOFF`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt);
    let delay = base.saturating_mul(multiplier);
    delay.min(MAX_BACKOFF)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::sync::Arc;

    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    /// What the fake monitor does with one command.
    pub enum Reply {
        /// Send these lines (events, then the reply).
        Lines(Vec<String>),
        Return(Value),
        Error(&'static str, String),
        /// Never answer.
        Hang,
        /// Drop the connection.
        Close,
    }

    /// Serve a QEMU-like monitor on `path`: greeting, capability
    /// negotiation, then `handler` for every other command. Accepts any
    /// number of sequential or parallel clients.
    pub fn spawn_fake_qmp<F>(path: &Path, handler: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    let greeting = json!({"QMP": {"version": {"qemu": {"major": 8, "minor": 2, "micro": 0}}, "capabilities": []}});
                    if write.write_all(format!("{}\n", greeting).as_bytes()).await.is_err() {
                        return;
                    }
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: Value = match serde_json::from_str(&line) {
                            Ok(v) => v,
                            Err(_) => return,
                        };
                        let execute = request["execute"].as_str().unwrap_or("").to_string();
                        let reply = if execute == "qmp_capabilities" {
                            Reply::Return(json!({}))
                        } else {
                            handler(&execute, &request["arguments"])
                        };
                        let out = match reply {
                            Reply::Lines(lines) => lines,
                            Reply::Return(v) => vec![json!({ "return": v }).to_string()],
                            Reply::Error(class, desc) => {
                                vec![json!({"error": {"class": class, "desc": desc}}).to_string()]
                            }
                            Reply::Hang => {
                                std::future::pending::<()>().await;
                                return;
                            }
                            Reply::Close => return,
                        };
                        for l in out {
                            if write.write_all(format!("{}\n", l).as_bytes()).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        })
    }

    /// HMP text of a human-monitor-command request, if that is what it is.
    pub fn hmp_line<'a>(execute: &str, args: &'a Value) -> Option<&'a str> {
        if execute == "human-monitor-command" {
            args["command-line"].as_str()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::{spawn_fake_qmp, Reply};
    use super::*;

    fn socket(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("qmp.sock")
    }

    #[test]
    fn test_default_qmp_command_timeout() {
        assert_eq!(DEFAULT_QMP_COMMAND_TIMEOUT, Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 5), MAX_BACKOFF);
        assert_eq!(backoff_delay(base, 40), MAX_BACKOFF);
        assert_eq!(backoff_delay(Duration::from_secs(5), 0), MAX_BACKOFF);
    }

    #[test]
    fn test_validate_hmp_tag() {
        assert!(validate_hmp_tag("before-upgrade_1.0").is_ok());
        assert!(matches!(validate_hmp_tag(""), Err(MonitorError::InvalidTag(_))));
        assert!(validate_hmp_tag("snap; quit").is_err());
        assert!(validate_hmp_tag("a\nquit").is_err());
        assert!(validate_hmp_tag(&"a".repeat(128)).is_ok());
        assert!(validate_hmp_tag(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_unreachable_classification() {
        assert!(MonitorError::Invalidated.is_unreachable());
        assert!(MonitorError::Transport("eof".into()).is_unreachable());
        assert!(!MonitorError::Protocol {
            command: "stop".into(),
            class: "GenericError".into(),
            desc: "no".into()
        }
        .is_unreachable());
        assert!(!MonitorError::InvalidTag("x y".into()).is_unreachable());
    }

    #[tokio::test]
    async fn connect_to_missing_socket_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        match QmpClient::connect(&socket(&dir)).await {
            Err(MonitorError::Unreachable { path, .. }) => assert_eq!(path, socket(&dir)),
            other => panic!("expected Unreachable, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn connect_with_retry_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = QmpClient::connect_with_retry(&socket(&dir), 3, Duration::from_millis(10))
            .await
            .err()
            .unwrap();
        assert!(err.is_unreachable());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn connect_with_retry_waits_for_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket(&dir);
        let server_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            spawn_fake_qmp(&server_path, |_, _| Reply::Return(json!({})));
        });
        let client = QmpClient::connect_with_retry(&path, 20, Duration::from_millis(25))
            .await
            .unwrap();
        assert!(client.is_valid());
    }

    #[tokio::test]
    async fn status_and_events_between_replies() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket(&dir);
        spawn_fake_qmp(
            &path,
            |execute, _| match execute {
                "query-status" => Reply::Lines(vec![
                    json!({"event": "RESUME", "timestamp": {"seconds": 1, "microseconds": 0}}).to_string(),
                    json!({"event": "RTC_CHANGE", "data": {"offset": 0}}).to_string(),
                    json!({"return": {"status": "running", "running": true}}).to_string(),
                ]),
                _ => Reply::Return(json!({})),
            },
        );

        let mut client = QmpClient::connect(&path).await.unwrap();
        assert_eq!(client.query_status().await.unwrap(), VmStatus::Running);
        let events: Vec<String> = client.take_events().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["RESUME", "RTC_CHANGE"]);
        assert!(client.take_events().is_empty());
    }

    #[tokio::test]
    async fn error_reply_is_protocol_error_and_session_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket(&dir);
        spawn_fake_qmp(
            &path,
            |execute, _| match execute {
                "bogus" => Reply::Error("CommandNotFound", "The command bogus has not been found".into()),
                _ => Reply::Return(json!({})),
            },
        );

        let mut client = QmpClient::connect(&path).await.unwrap();
        match client.execute("bogus", None).await {
            Err(MonitorError::Protocol { class, .. }) => assert_eq!(class, "CommandNotFound"),
            other => panic!("expected Protocol, got {:?}", other),
        }
        assert!(client.is_valid());
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn closed_socket_invalidates_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket(&dir);
        spawn_fake_qmp(&path, |_, _| Reply::Close);

        let mut client = QmpClient::connect(&path).await.unwrap();
        assert!(matches!(
            client.system_powerdown().await,
            Err(MonitorError::Transport(_))
        ));
        assert!(!client.is_valid());
        assert!(matches!(client.cont().await, Err(MonitorError::Invalidated)));
    }

    #[tokio::test]
    async fn silent_peer_times_out_and_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket(&dir);
        spawn_fake_qmp(&path, |_, _| Reply::Hang);

        let mut client = QmpClient::connect_with_timeout(&path, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(
            client.query_status().await,
            Err(MonitorError::Timeout { .. })
        ));
        assert!(matches!(client.stop().await, Err(MonitorError::Invalidated)));
    }

    #[tokio::test]
    async fn hmp_output_means_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket(&dir);
        spawn_fake_qmp(
            &path,
            |execute, args| match testing::hmp_line(execute, args) {
                Some("savevm good") => Reply::Return(json!("")),
                Some("loadvm missing") => {
                    Reply::Return(json!("Error: Snapshot 'missing' does not exist\r\n"))
                }
                _ => Reply::Return(json!("")),
            },
        );

        let mut client = QmpClient::connect(&path).await.unwrap();
        client.savevm("good").await.unwrap();
        match client.loadvm("missing").await {
            Err(MonitorError::Protocol { class, desc, .. }) => {
                assert_eq!(class, "HmpError");
                assert!(desc.contains("does not exist"));
            }
            other => panic!("expected Protocol, got {:?}", other),
        }
        // A refused HMP command does not break the session
        assert!(client.is_valid());
    }

    #[tokio::test]
    async fn invalid_tag_never_reaches_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket(&dir);
        spawn_fake_qmp(&path, |_, _| Reply::Close);

        let mut client = QmpClient::connect(&path).await.unwrap();
        assert!(matches!(
            client.savevm("x; quit").await,
            Err(MonitorError::InvalidTag(_))
        ));
        assert!(client.is_valid());
    }

    #[tokio::test]
    async fn wrong_protocol_is_handshake_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket(&dir);
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        assert!(matches!(
            QmpClient::connect(&path).await,
            Err(MonitorError::Handshake(_))
        ));
    }
}
