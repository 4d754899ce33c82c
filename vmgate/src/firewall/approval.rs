use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use super::{ConnectionRecord, Destination, Verdict};

/// What the human is asked about.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub machine: String,
    pub destination: Destination,
    pub hostname: Option<String>,
    /// Guest process that opened the connection, when the guest reported it.
    pub process_name: Option<String>,
    pub process_pid: Option<u32>,
    /// Service guessed from the port, e.g. "HTTPS".
    pub service: Option<&'static str>,
    /// Recent decisions on this machine, newest last.
    pub recent: Vec<ConnectionRecord>,
    /// How long the engine will wait for an answer.
    pub timeout: Duration,
}

/// Asks someone whether an unknown destination may be reached.
///
/// The engine bounds every call by the request timeout and drops the future
/// when it expires; implementations should not add their own.
#[async_trait::async_trait]
pub trait ApprovalGateway: Send + Sync {
    async fn approve(&self, request: &ApprovalRequest) -> Result<Verdict>;
}

/// Always answers the same. Used when no approval command is configured.
#[derive(Debug, Clone, Copy)]
pub struct StaticGateway(pub Verdict);

#[async_trait::async_trait]
impl ApprovalGateway for StaticGateway {
    async fn approve(&self, request: &ApprovalRequest) -> Result<Verdict> {
        debug!(
            machine = %request.machine,
            dest = %request.destination,
            verdict = %self.0,
            "no approval command configured"
        );
        Ok(self.0)
    }
}

/// Runs an external program per request.
///
/// The program gets the request in `VMGATE_*` environment variables and
/// must print `allow` or `deny` as the first line of stdout. Anything else,
/// including a non-zero exit, is a gateway error. The child is killed if the
/// request is abandoned.
#[derive(Debug, Clone)]
pub struct CommandGateway {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandGateway {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait::async_trait]
impl ApprovalGateway for CommandGateway {
    async fn approve(&self, request: &ApprovalRequest) -> Result<Verdict> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .env("VMGATE_VM_NAME", &request.machine)
            .env("VMGATE_DEST_IP", request.destination.ip.to_string())
            .env("VMGATE_DEST_PORT", request.destination.port.to_string())
            .env("VMGATE_DEST", request.destination.to_string())
            .env("VMGATE_HOSTNAME", request.hostname.as_deref().unwrap_or(""))
            .env("VMGATE_SERVICE", request.service.unwrap_or(""))
            .env("VMGATE_PROCESS_NAME", request.process_name.as_deref().unwrap_or(""))
            .env(
                "VMGATE_PROCESS_PID",
                request.process_pid.map(|p| p.to_string()).unwrap_or_default(),
            )
            .env("VMGATE_TIMEOUT_SECS", request.timeout.as_secs().to_string())
            .env("VMGATE_RECENT", render_recent(&request.recent))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .with_context(|| format!("running approval command {}", self.program.display()))?;
        if !output.status.success() {
            bail!("approval command exited with {}", output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let answer = stdout.lines().next().unwrap_or("").trim().to_ascii_lowercase();
        let verdict: Verdict = answer
            .parse()
            .with_context(|| format!("approval command answered '{}'", answer))?;
        info!(
            machine = %request.machine,
            dest = %request.destination,
            hostname = request.hostname.as_deref().unwrap_or("-"),
            %verdict,
            "approval answered"
        );
        Ok(verdict)
    }
}

/// JSON array of the records, oldest first.
fn render_recent(records: &[ConnectionRecord]) -> String {
    serde_json::to_string(records).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            machine: "dev".into(),
            destination: "1.1.1.1:443".parse().unwrap(),
            hostname: Some("one.one.one.one".into()),
            process_name: Some("curl".into()),
            process_pid: Some(4242),
            service: Some("HTTPS"),
            recent: Vec::new(),
            timeout: Duration::from_secs(300),
        }
    }

    fn shell(body: &str) -> CommandGateway {
        CommandGateway::new("/bin/sh").with_args(vec!["-c".into(), body.into()])
    }

    #[tokio::test]
    async fn static_gateway_answers_fixed_verdict() {
        assert_eq!(
            StaticGateway(Verdict::Deny).approve(&request()).await.unwrap(),
            Verdict::Deny
        );
    }

    #[tokio::test]
    async fn command_gateway_reads_allow_from_stdout() {
        let gw = shell("echo ALLOW");
        assert_eq!(gw.approve(&request()).await.unwrap(), Verdict::Allow);
    }

    #[tokio::test]
    async fn command_gateway_sees_request_environment() {
        let gw = shell(
            r#"if [ "$VMGATE_DEST" = "1.1.1.1:443" ] && [ "$VMGATE_SERVICE" = "HTTPS" ] && [ "$VMGATE_HOSTNAME" = "one.one.one.one" ]; then echo allow; else echo deny; fi"#,
        );
        assert_eq!(gw.approve(&request()).await.unwrap(), Verdict::Allow);
    }

    #[tokio::test]
    async fn command_gateway_sees_process_and_recent_history() {
        let mut req = request();
        req.recent.push(ConnectionRecord {
            at: chrono::Utc::now(),
            destination: "9.9.9.9:53".parse().unwrap(),
            hostname: Some("dns.quad9.net".into()),
            process_name: None,
            verdict: Verdict::Deny,
        });
        let gw = shell(
            r#"case "$VMGATE_PROCESS_NAME/$VMGATE_PROCESS_PID $VMGATE_RECENT" in 'curl/4242 ['*'"destination":"9.9.9.9:53"'*) echo allow;; *) echo deny;; esac"#,
        );
        assert_eq!(gw.approve(&req).await.unwrap(), Verdict::Allow);
    }

    #[test]
    fn recent_history_is_a_json_array() {
        assert_eq!(render_recent(&[]), "[]");
        let records = vec![ConnectionRecord {
            at: chrono::Utc::now(),
            destination: "1.1.1.1:443".parse().unwrap(),
            hostname: None,
            process_name: Some("apt".into()),
            verdict: Verdict::Allow,
        }];
        let parsed: serde_json::Value = serde_json::from_str(&render_recent(&records)).unwrap();
        assert_eq!(parsed[0]["destination"], "1.1.1.1:443");
        assert_eq!(parsed[0]["process_name"], "apt");
    }

    #[tokio::test]
    async fn command_gateway_errors_on_garbage_or_failure() {
        assert!(shell("echo perhaps").approve(&request()).await.is_err());
        assert!(shell("echo allow; exit 3").approve(&request()).await.is_err());

        let dir = tempfile::tempdir().unwrap();
        let gw = CommandGateway::new(dir.path().join("missing"));
        assert!(gw.approve(&request()).await.is_err());
    }
}
