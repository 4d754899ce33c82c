//! Host-side hook scripts run at fixed lifecycle points.
//!
//! Scripts are `*.sh` files in `<home>/scripts/<point>/` and
//! `<machine>/scripts/<point>/`. A per-machine script replaces a global one
//! with the same file name; the merged list runs in file-name order.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::machine::{Layout, MachineDocument, MachinePaths};
use crate::ssh::SshTarget;
use crate::vm::qemu::{GUEST_PROXY_HOST, GUEST_PROXY_PORT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookPoint {
    /// After the machine directory and disk exist. The guest is not running.
    Create,
    /// First successful boot only.
    InitialBoot,
    /// Every boot.
    Boot,
}

impl HookPoint {
    pub const ALL: [HookPoint; 3] = [HookPoint::Create, HookPoint::InitialBoot, HookPoint::Boot];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::Create => "create",
            HookPoint::InitialBoot => "initial-boot",
            HookPoint::Boot => "boot",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookPoint::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown hook point '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSource {
    Global,
    Machine,
}

impl fmt::Display for HookSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookSource::Global => "global",
            HookSource::Machine => "machine",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookScript {
    pub source: HookSource,
    pub path: PathBuf,
}

impl HookScript {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn scripts_in(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut scripts = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "sh") {
            scripts.push(path);
        }
    }
    Ok(scripts)
}

/// Scripts for `point`, merged and ordered.
pub fn collect(layout: &Layout, machine: &MachinePaths, point: HookPoint) -> Result<Vec<HookScript>> {
    let mut merged: BTreeMap<String, HookScript> = BTreeMap::new();
    let sources = [
        (HookSource::Global, layout.global_scripts_dir(point.as_str())),
        (HookSource::Machine, machine.scripts_dir(point.as_str())),
    ];
    for (source, dir) in sources {
        for path in scripts_in(&dir)? {
            let script = HookScript { source, path };
            merged.insert(script.file_name(), script);
        }
    }
    Ok(merged.into_values().collect())
}

/// What a script learns about the machine it runs for.
#[derive(Debug, Clone)]
pub struct HookEnv {
    pub machine: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
}

impl HookEnv {
    pub fn new(machine: &str, doc: &MachineDocument) -> Self {
        let target = SshTarget::for_machine(doc);
        Self {
            machine: machine.to_string(),
            ssh_host: target.host,
            ssh_port: target.port,
            ssh_user: target.user,
        }
    }

    pub fn ssh_target(&self) -> SshTarget {
        SshTarget::new(self.ssh_host.clone(), self.ssh_port, self.ssh_user.clone())
    }

    fn vars(&self) -> [(&'static str, String); 6] {
        [
            ("VMGATE_VM_NAME", self.machine.clone()),
            ("VMGATE_SSH_HOST", self.ssh_host.clone()),
            ("VMGATE_SSH_PORT", self.ssh_port.to_string()),
            ("VMGATE_SSH_USER", self.ssh_user.clone()),
            ("VMGATE_PROXY_HOST", GUEST_PROXY_HOST.to_string()),
            ("VMGATE_PROXY_PORT", GUEST_PROXY_PORT.to_string()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub script: String,
    pub source: HookSource,
    pub success: bool,
    pub detail: String,
}

/// Runs scripts one at a time with a per-script timeout.
#[derive(Debug, Clone)]
pub struct HookRunner {
    timeout: Duration,
    /// Run scripts through this program instead of executing them directly.
    interpreter: Option<PathBuf>,
}

impl HookRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interpreter: None,
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    /// Run every script. A failing script is logged and reported; the
    /// rest still run.
    pub async fn run(&self, point: HookPoint, scripts: &[HookScript], env: &HookEnv) -> Vec<HookOutcome> {
        let mut outcomes = Vec::with_capacity(scripts.len());
        for script in scripts {
            let name = script.file_name();
            info!(machine = %env.machine, hook = %point, script = %name, source = %script.source, "running hook");
            let (success, detail) = match self.run_one(script, env).await {
                Ok(()) => (true, String::new()),
                Err(e) => {
                    let detail = format!("{:#}", e);
                    warn!(machine = %env.machine, hook = %point, script = %name, error = %detail, "hook failed");
                    (false, detail)
                }
            };
            outcomes.push(HookOutcome {
                script: name,
                source: script.source,
                success,
                detail,
            });
        }
        outcomes
    }

    async fn run_one(&self, script: &HookScript, env: &HookEnv) -> Result<()> {
        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = tokio::process::Command::new(interpreter);
                cmd.arg(&script.path);
                cmd
            }
            None => tokio::process::Command::new(&script.path),
        };
        if let Some(dir) = script.path.parent() {
            cmd.current_dir(dir);
        }
        cmd.envs(env.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("starting {}", script.path.display()))?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.context("waiting for hook")?,
            Err(_) => bail!("timed out after {:?}", self.timeout),
        };

        for stream in [&output.stdout, &output.stderr] {
            for line in String::from_utf8_lossy(stream).lines() {
                info!(machine = %env.machine, script = %script.file_name(), "| {}", line);
            }
        }

        if !output.status.success() {
            bail!("exited with {}", output.status);
        }
        Ok(())
    }
}

/// Checks the guest can actually be logged into, not just that the
/// forwarded port accepts connections.
#[async_trait]
pub trait GuestProbe: Send + Sync {
    async fn reachable(&self, env: &HookEnv) -> bool;
}

/// `ssh -p <port> <user>@127.0.0.1 true`.
#[derive(Debug, Clone)]
pub struct SshProbe {
    program: PathBuf,
}

impl SshProbe {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("ssh"),
        }
    }
}

impl Default for SshProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GuestProbe for SshProbe {
    async fn reachable(&self, env: &HookEnv) -> bool {
        let attempt = env
            .ssh_target()
            .batch_command(&self.program, &[])
            .arg("true")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match tokio::time::timeout(Duration::from_secs(15), attempt).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }
}

/// Poll `probe` until it succeeds or `timeout` passes.
pub async fn wait_for_guest(
    probe: &dyn GuestProbe,
    env: &HookEnv,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe.reachable(env).await {
            return true;
        }
        if tokio::time::Instant::now() + interval > deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Summary of one boot's hooks.
#[derive(Debug, Default)]
pub struct BootReport {
    pub initial: Vec<HookOutcome>,
    pub boot: Vec<HookOutcome>,
    /// `first_boot_completed` was set by this run.
    pub first_boot_recorded: bool,
}

impl BootReport {
    pub fn failures(&self) -> impl Iterator<Item = &HookOutcome> {
        self.initial.iter().chain(&self.boot).filter(|o| !o.success)
    }
}

/// Everything the lifecycle controller needs to run hooks.
#[derive(Clone)]
pub struct Hooks {
    layout: Layout,
    runner: HookRunner,
    probe: Arc<dyn GuestProbe>,
    reachability_timeout: Duration,
    probe_interval: Duration,
}

impl Hooks {
    pub fn new(
        layout: Layout,
        runner: HookRunner,
        probe: Arc<dyn GuestProbe>,
        reachability_timeout: Duration,
    ) -> Self {
        Self {
            layout,
            runner,
            probe,
            reachability_timeout,
            probe_interval: Duration::from_secs(2),
        }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn scripts(&self, machine: &MachinePaths, point: HookPoint) -> Result<Vec<HookScript>> {
        collect(&self.layout, machine, point)
    }

    /// Run the `create` hooks. Nothing is running yet, so there is no
    /// reachability check.
    pub async fn run_create(&self, machine: &MachinePaths) -> Result<Vec<HookOutcome>> {
        let doc = machine.load()?;
        let scripts = self.scripts(machine, HookPoint::Create)?;
        let env = HookEnv::new(machine.name(), &doc);
        Ok(self.runner.run(HookPoint::Create, &scripts, &env).await)
    }

    /// `initial-boot` (until it has fully succeeded once) then `boot`.
    ///
    /// Fails only when there are scripts to run and the guest never
    /// becomes reachable. Failing scripts are reported, not raised.
    #[instrument(skip(self, machine), fields(machine = %machine.name()))]
    pub async fn run_boot(&self, machine: &MachinePaths) -> Result<BootReport> {
        let doc = machine.load()?;
        let env = HookEnv::new(machine.name(), &doc);
        let mut report = BootReport::default();

        let initial = if doc.first_boot_completed {
            Vec::new()
        } else {
            self.scripts(machine, HookPoint::InitialBoot)?
        };
        let boot = self.scripts(machine, HookPoint::Boot)?;

        if initial.is_empty() && boot.is_empty() {
            debug!("no boot hooks");
            if !doc.first_boot_completed {
                machine.update(|d| d.first_boot_completed = true)?;
                report.first_boot_recorded = true;
            }
            return Ok(report);
        }

        info!(ssh_port = env.ssh_port, "waiting for guest SSH");
        if !wait_for_guest(self.probe.as_ref(), &env, self.reachability_timeout, self.probe_interval).await {
            bail!(
                "guest of '{}' not reachable over SSH on port {} within {:?}",
                env.machine,
                env.ssh_port,
                self.reachability_timeout
            );
        }

        if !doc.first_boot_completed {
            report.initial = self.runner.run(HookPoint::InitialBoot, &initial, &env).await;
            if report.initial.iter().all(|o| o.success) {
                machine.update(|d| d.first_boot_completed = true)?;
                report.first_boot_recorded = true;
            }
        }
        report.boot = self.runner.run(HookPoint::Boot, &boot, &env).await;

        let failed = report.failures().count();
        if failed > 0 {
            warn!(failed, "boot hooks had failures");
        }
        Ok(report)
    }
}
