//! Reaching a guest through its forwarded SSH port.

use std::ffi::OsStr;
use std::process::Stdio;

use crate::machine::MachineDocument;

/// Host side of every SSH forward.
pub const SSH_HOST: &str = "127.0.0.1";

/// Guests are recreated from images all the time; their host keys are not
/// worth remembering.
pub const SSH_OPTIONS: [&str; 8] = [
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "ConnectTimeout=10",
    "-o", "LogLevel=ERROR",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    pub fn for_machine(doc: &MachineDocument) -> Self {
        Self::new(SSH_HOST, doc.ssh_port, doc.ssh_user.clone())
    }

    /// `ssh` arguments up to and including the destination.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = SSH_OPTIONS.iter().map(|s| s.to_string()).collect();
        args.push("-p".into());
        args.push(self.port.to_string());
        args.push(format!("{}@{}", self.user, self.host));
        args
    }

    /// Non-interactive remote command: no password prompts, no stdin, the
    /// child dies with the future.
    pub fn batch_command(
        &self,
        program: impl AsRef<OsStr>,
        leading_args: &[String],
    ) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(leading_args)
            .args(["-o", "BatchMode=yes"])
            .args(self.args())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}
