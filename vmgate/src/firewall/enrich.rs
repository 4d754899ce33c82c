//! Asking the guest who is behind a connection.
//!
//! Guests carry an enrichment command (by default
//! `/usr/local/bin/vmgate-enrich <ip> <port>`) that looks the destination up
//! in the guest's DNS log and socket table and prints `key=value` lines:
//!
//! ```text
//! domain=pypi.org
//! process_name=pip
//! process_pid=1312
//! ```
//!
//! Every field is optional. Domains learned this way are cached per machine,
//! so a later connection to the same address still gets a name when the
//! guest's DNS log has rotated or the command fails.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::Destination;
use crate::ssh::SshTarget;

/// Default bound on one enrichment round trip.
pub const ENRICH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enrichment {
    pub domain: Option<String>,
    pub process_name: Option<String>,
    pub process_pid: Option<u32>,
}

impl Enrichment {
    /// Parse the guest's report. Unknown keys and malformed lines are skipped.
    pub fn parse(report: &str) -> Self {
        let mut out = Self::default();
        for line in report.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "domain" => out.domain = Some(value.trim_end_matches('.').to_string()),
                "process_name" => out.process_name = Some(value.to_string()),
                "process_pid" => out.process_pid = value.parse().ok(),
                _ => {}
            }
        }
        out
    }
}

/// Source of per-connection detail beyond the address itself. Best effort:
/// failures yield an empty [`Enrichment`].
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, dest: &Destination) -> Enrichment;
}

/// Runs the enrichment command inside the guest over SSH.
pub struct GuestEnricher {
    machine: String,
    target: SshTarget,
    remote_command: String,
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    domains: StdMutex<HashMap<IpAddr, String>>,
}

impl GuestEnricher {
    pub fn new(
        machine: impl Into<String>,
        target: SshTarget,
        remote_command: impl Into<String>,
    ) -> Self {
        Self {
            machine: machine.into(),
            target,
            remote_command: remote_command.into(),
            program: PathBuf::from("ssh"),
            args: Vec::new(),
            timeout: ENRICH_TIMEOUT,
            domains: StdMutex::new(HashMap::new()),
        }
    }

    /// Use another client binary (and leading arguments) instead of `ssh`.
    pub fn with_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn cached_domain(&self, ip: &IpAddr) -> Option<String> {
        self.domains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ip)
            .cloned()
    }

    async fn ask_guest(&self, dest: &Destination) -> Option<Enrichment> {
        let run = self
            .target
            .batch_command(&self.program, &self.args)
            .arg(&self.remote_command)
            .arg(dest.ip.to_string())
            .arg(dest.port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output();
        match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) if output.status.success() => {
                Some(Enrichment::parse(&String::from_utf8_lossy(&output.stdout)))
            }
            Ok(Ok(output)) => {
                debug!(machine = %self.machine, %dest, status = %output.status, "enrichment command failed");
                None
            }
            Ok(Err(e)) => {
                debug!(machine = %self.machine, %dest, error = %e, "enrichment command did not run");
                None
            }
            Err(_) => {
                debug!(machine = %self.machine, %dest, "enrichment timed out");
                None
            }
        }
    }
}

#[async_trait]
impl Enricher for GuestEnricher {
    async fn enrich(&self, dest: &Destination) -> Enrichment {
        let mut found = self.ask_guest(dest).await.unwrap_or_default();
        match found.domain.clone() {
            Some(domain) => {
                self.domains
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(dest.ip, domain);
            }
            None => found.domain = self.cached_domain(&dest.ip),
        }
        found
    }
}
