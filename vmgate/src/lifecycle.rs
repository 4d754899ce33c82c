//! Start and stop one machine together with its proxy and monitor session.
//!
//! `stopped → starting → running → stopping → stopped`. A failed start tears
//! down whatever it brought up and returns to `stopped`. Transitions and
//! snapshot operations take the machine's `lock` file with `flock`, so two
//! processes never drive one machine at once. Contention is waited out for
//! [`LOCK_WAIT`] before giving up with [`LifecycleError::Busy`]. A live pid
//! in the `pid` file means the machine is running somewhere.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Child;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::firewall::{
    ApprovalGateway, DecisionPool, DefaultAllowList, FirewallEngine, GuestEnricher, Mode,
    RuleStore,
};
use crate::hooks::{BootReport, Hooks};
use crate::machine::MachinePaths;
use crate::proxy::{Dialer, ProxyHandle, ProxyServer};
use crate::resolver::Resolver;
use crate::ssh::SshTarget;
use crate::vm::qemu::{self, LaunchSpec};
use crate::vm::qmp::{MonitorError, QmpClient, VmStatus};

/// How long a lifecycle operation waits for another one to release the
/// machine lock.
pub const LOCK_WAIT: Duration = Duration::from_millis(250);
const LOCK_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        })
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("machine '{machine}' is busy with another operation")]
    Busy { machine: String },

    #[error("machine '{machine}' is already running (pid {pid})")]
    AlreadyRunning { machine: String, pid: u32 },

    #[error("machine '{machine}' is not running")]
    NotRunning { machine: String },

    #[error("failed to start machine '{machine}': {source:#}")]
    Launch {
        machine: String,
        source: anyhow::Error,
    },

    #[error("machine '{machine}' unreachable: {source}")]
    Monitor {
        machine: String,
        #[source]
        source: MonitorError,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Exclusive advisory lock on `<machine>/lock`, released on drop.
#[derive(Debug)]
pub struct MachineLock {
    _file: File,
}

impl MachineLock {
    /// Take the lock, polling for up to [`LOCK_WAIT`] while another
    /// operation holds it.
    pub async fn acquire(paths: &MachinePaths) -> Result<Self, LifecycleError> {
        let deadline = tokio::time::Instant::now() + LOCK_WAIT;
        loop {
            match Self::try_acquire(paths) {
                Err(LifecycleError::Busy { .. }) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(LOCK_POLL).await;
                }
                other => return other,
            }
        }
    }

    fn try_acquire(paths: &MachinePaths) -> Result<Self, LifecycleError> {
        let path = paths.lock_file();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        // SAFETY: flock on a descriptor we own; closing it releases the lock.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Self { _file: file });
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Err(LifecycleError::Busy {
                machine: paths.name().to_string(),
            })
        } else {
            Err(anyhow!(err).context(format!("locking {}", path.display())).into())
        }
    }
}

/// Pid of the machine's live process, if any.
pub fn running_pid(paths: &MachinePaths) -> Option<u32> {
    qemu::read_pid(&paths.pid_file()).filter(|pid| qemu::process_alive(*pid))
}

/// Open a session on the control socket of a machine run by any process.
pub async fn connect_control(paths: &MachinePaths) -> Result<QmpClient, LifecycleError> {
    if running_pid(paths).is_none() {
        return Err(LifecycleError::NotRunning {
            machine: paths.name().to_string(),
        });
    }
    QmpClient::connect(&paths.control_socket())
        .await
        .map_err(|source| LifecycleError::Monitor {
            machine: paths.name().to_string(),
            source,
        })
}

/// What the hypervisor reports for a running machine.
pub async fn machine_status(paths: &MachinePaths) -> Result<VmStatus, LifecycleError> {
    let mut client = connect_control(paths).await?;
    client
        .query_status()
        .await
        .map_err(|source| LifecycleError::Monitor {
            machine: paths.name().to_string(),
            source,
        })
}

/// Remove pid and socket files left behind by a process that is gone.
pub fn clean_runtime_files(paths: &MachinePaths) {
    for file in paths.runtime_files() {
        match std::fs::remove_file(&file) {
            Ok(()) => debug!(path = %file.display(), "removed runtime file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %file.display(), error = %e, "failed to remove runtime file"),
        }
    }
}

/// Starts the machine process.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec, paths: &MachinePaths) -> anyhow::Result<Child>;
}

/// Runs qemu-system.
#[derive(Debug, Default, Clone)]
pub struct QemuLauncher;

#[async_trait]
impl Launcher for QemuLauncher {
    async fn launch(&self, spec: &LaunchSpec, paths: &MachinePaths) -> anyhow::Result<Child> {
        qemu::spawn_qemu(&spec.build_command(), paths).await
    }
}

/// Collaborators shared by every machine the process runs.
#[derive(Clone)]
pub struct Services {
    pub defaults: Arc<DefaultAllowList>,
    pub gateway: Arc<dyn ApprovalGateway>,
    pub resolver: Arc<dyn Resolver>,
    pub dialer: Arc<dyn Dialer>,
    pub launcher: Arc<dyn Launcher>,
    pub hooks: Option<Hooks>,
}

#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    pub mode: Mode,
    pub run_hooks: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Enforce,
            run_hooks: true,
        }
    }
}

#[derive(Debug)]
pub struct StartReport {
    pub pid: u32,
    pub proxy_port: u16,
    pub hooks: Option<BootReport>,
}

struct Running {
    child: Child,
    pid: u32,
    proxy: ProxyHandle,
    monitor: QmpClient,
    engine: Arc<FirewallEngine>,
}

/// Owns one machine while this process runs it.
pub struct MachineController {
    paths: MachinePaths,
    config: Arc<Config>,
    services: Services,
    state: LifecycleState,
    running: Option<Running>,
}

impl MachineController {
    pub fn new(paths: MachinePaths, config: Arc<Config>, services: Services) -> Self {
        Self {
            paths,
            config,
            services,
            state: LifecycleState::Stopped,
            running: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().map(|r| r.pid)
    }

    pub fn engine(&self) -> Option<&Arc<FirewallEngine>> {
        self.running.as_ref().map(|r| &r.engine)
    }

    fn machine(&self) -> String {
        self.paths.name().to_string()
    }

    #[instrument(skip(self, opts), fields(machine = %self.paths.name()))]
    pub async fn start(&mut self, opts: StartOptions) -> Result<StartReport, LifecycleError> {
        if let Some(pid) = self.pid() {
            return Err(LifecycleError::AlreadyRunning {
                machine: self.machine(),
                pid,
            });
        }
        let _lock = MachineLock::acquire(&self.paths).await?;
        if let Some(pid) = running_pid(&self.paths) {
            return Err(LifecycleError::AlreadyRunning {
                machine: self.machine(),
                pid,
            });
        }
        clean_runtime_files(&self.paths);

        self.state = LifecycleState::Starting;
        info!(mode = ?opts.mode, "starting machine");

        let mut proxy = None;
        let mut child = None;
        let result = self.bring_up(opts, &mut proxy, &mut child).await;
        match result {
            Ok((monitor, engine, hooks)) => {
                // bring_up fills both on success
                let (Some(proxy), Some(child)) = (proxy, child) else {
                    self.state = LifecycleState::Stopped;
                    return Err(self.launch_error(anyhow!("start did not complete")));
                };
                let pid = child.id().unwrap_or_default();
                let proxy_port = proxy.port();
                self.running = Some(Running {
                    child,
                    pid,
                    proxy,
                    monitor,
                    engine,
                });
                self.state = LifecycleState::Running;
                info!(pid, proxy_port, "machine running");
                Ok(StartReport {
                    pid,
                    proxy_port,
                    hooks,
                })
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(error = %reason, "start failed, tearing down");
                if let Some(mut child) = child {
                    if let Err(kill_err) = child.kill().await {
                        warn!(error = %kill_err, "failed to kill machine process");
                    }
                }
                if let Some(proxy) = proxy {
                    proxy.shutdown().await;
                }
                clean_runtime_files(&self.paths);
                self.state = LifecycleState::Stopped;
                Err(self.launch_error(e))
            }
        }
    }

    /// Start steps in order. Anything started is left in `proxy` and
    /// `child` so the caller can tear it down.
    async fn bring_up(
        &self,
        opts: StartOptions,
        proxy: &mut Option<ProxyHandle>,
        child: &mut Option<Child>,
    ) -> anyhow::Result<(QmpClient, Arc<FirewallEngine>, Option<BootReport>)> {
        let doc = self.paths.load()?;
        let rules = RuleStore::load(&self.paths.document())?;
        let mut engine = FirewallEngine::new(
            self.paths.name(),
            opts.mode,
            rules,
            self.services.defaults.clone(),
            self.services.gateway.clone(),
            self.services.resolver.clone(),
            self.config.approval.timeout(),
        );
        if let Some(command) = &self.config.approval.enrich_command {
            let target = SshTarget::for_machine(&doc);
            let enricher = GuestEnricher::new(self.paths.name(), target, command.as_str())
                .with_timeout(self.config.approval.enrich_timeout());
            engine = engine.with_enricher(Arc::new(enricher));
        }
        let engine = Arc::new(engine);

        let handle = self.start_proxy(&engine, doc.proxy_port)?;
        let proxy_port = handle.port();
        *proxy = Some(handle);
        if doc.proxy_port != Some(proxy_port) {
            self.paths.update(|d| d.proxy_port = Some(proxy_port))?;
        }

        let spec = LaunchSpec::new(
            &self.config.qemu,
            &self.paths,
            &doc,
            self.config.proxy.bind_address.to_string(),
            proxy_port,
        );
        let process = child.insert(self.services.launcher.launch(&spec, &self.paths).await?);

        let lifecycle = &self.config.lifecycle;
        let monitor_socket = self.paths.monitor_socket();
        let monitor = tokio::select! {
            connected = QmpClient::connect_with_retry(
                &monitor_socket,
                lifecycle.monitor_connect_retries,
                lifecycle.monitor_retry_delay(),
            ) => connected.context("connecting to the machine monitor")?,
            status = process.wait() => {
                let tail = qemu::read_tail(&self.paths.stderr_log(), 20).await;
                return Err(match status {
                    Ok(status) => anyhow!("machine process exited during startup ({}): {}", status, tail),
                    Err(e) => anyhow!(e).context("waiting for machine process"),
                });
            }
        };
        debug!("monitor session established");

        let hooks = match (&self.services.hooks, opts.run_hooks) {
            (Some(hooks), true) => Some(hooks.run_boot(&self.paths).await?),
            _ => None,
        };
        Ok((monitor, engine, hooks))
    }

    /// Bind the previous proxy port when it is free, any port otherwise.
    fn start_proxy(
        &self,
        engine: &Arc<FirewallEngine>,
        previous: Option<u16>,
    ) -> anyhow::Result<ProxyHandle> {
        let bind = self.config.proxy.bind_address;
        if let Some(port) = previous {
            match self.proxy_server(engine)?.start(SocketAddr::new(bind, port)) {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    let reason = format!("{:#}", e);
                    warn!(port, error = %reason, "previous proxy port unavailable");
                }
            }
        }
        self.proxy_server(engine)?.start(SocketAddr::new(bind, 0))
    }

    fn proxy_server(&self, engine: &Arc<FirewallEngine>) -> anyhow::Result<ProxyServer> {
        Ok(ProxyServer::new(
            engine.clone(),
            DecisionPool::new(self.config.proxy.decision_workers)?,
            self.services.resolver.clone(),
            self.services.dialer.clone(),
        )
        .with_handshake_timeout(self.config.proxy.handshake_timeout()))
    }

    fn launch_error(&self, source: anyhow::Error) -> LifecycleError {
        LifecycleError::Launch {
            machine: self.machine(),
            source,
        }
    }

    /// ACPI power-off, then SIGKILL once the grace period is over. `force`
    /// skips straight to the kill. The proxy and the monitor session are
    /// released however the process ends.
    #[instrument(skip(self), fields(machine = %self.paths.name()))]
    pub async fn stop(&mut self, force: bool) -> Result<Option<ExitStatus>, LifecycleError> {
        if self.running.is_none() {
            return Err(LifecycleError::NotRunning {
                machine: self.machine(),
            });
        }
        let _lock = MachineLock::acquire(&self.paths).await?;
        let Some(mut running) = self.running.take() else {
            return Err(LifecycleError::NotRunning {
                machine: self.machine(),
            });
        };
        self.state = LifecycleState::Stopping;
        info!(pid = running.pid, force, "stopping machine");

        let mut status = None;
        if !force && !running.monitor.is_valid() {
            warn!("monitor session is broken, killing");
        } else if !force {
            match running.monitor.system_powerdown().await {
                Ok(()) => {
                    let grace = self.config.lifecycle.shutdown_grace();
                    match tokio::time::timeout(grace, running.child.wait()).await {
                        Ok(Ok(exit)) => status = Some(exit),
                        Ok(Err(e)) => warn!(error = %e, "error waiting for machine exit"),
                        Err(_) => warn!(?grace, "machine did not power off in time, killing"),
                    }
                }
                Err(e) => warn!(error = %e, "ACPI power-off failed, killing"),
            }
        }

        if status.is_none() {
            if let Err(e) = running.child.kill().await {
                warn!(error = %e, "kill via child handle failed");
                if let Err(e) = qemu::kill_qemu(running.pid) {
                    let reason = format!("{:#}", e);
                    warn!(error = %reason, "kill by pid failed");
                }
            }
            status = running.child.try_wait().ok().flatten();
        }

        for event in running.monitor.take_events() {
            debug!(event = %event.event, "monitor event during stop");
        }
        self.release(running).await;
        Ok(status)
    }

    /// Resolve when the machine process exits on its own (guest shutdown,
    /// crash, a detached stop), then release the proxy and session.
    pub async fn wait(&mut self) -> Result<ExitStatus, LifecycleError> {
        let Some(running) = self.running.as_mut() else {
            return Err(LifecycleError::NotRunning {
                machine: self.machine(),
            });
        };
        let status = running
            .child
            .wait()
            .await
            .context("waiting for machine process")?;
        info!(machine = %self.paths.name(), %status, "machine process exited");
        if let Some(running) = self.running.take() {
            self.release(running).await;
        }
        Ok(status)
    }

    async fn release(&mut self, running: Running) {
        let Running {
            proxy,
            monitor,
            engine,
            ..
        } = running;
        drop(monitor);
        proxy.shutdown().await;
        debug!(recent = engine.recent().len(), "proxy released");
        clean_runtime_files(&self.paths);
        self.state = LifecycleState::Stopped;
        info!(machine = %self.paths.name(), "machine stopped");
    }
}

/// Stop a machine run by another process: ACPI power-off over the control
/// socket, poll the pid for `grace`, then SIGKILL. The owning process sees
/// its child exit and releases the proxy.
#[instrument(skip(paths), fields(machine = %paths.name()))]
pub async fn stop_detached(
    paths: &MachinePaths,
    grace: Duration,
    force: bool,
) -> Result<(), LifecycleError> {
    let _lock = MachineLock::acquire(paths).await?;
    let Some(pid) = running_pid(paths) else {
        clean_runtime_files(paths);
        return Err(LifecycleError::NotRunning {
            machine: paths.name().to_string(),
        });
    };

    let mut exited = false;
    if !force {
        match connect_control(paths).await {
            Ok(mut client) => match client.system_powerdown().await {
                Ok(()) => exited = qemu::wait_for_exit(pid, grace).await,
                Err(e) => warn!(error = %e, "ACPI power-off failed"),
            },
            Err(e) => warn!(error = %e, "falling back to SIGKILL"),
        }
    }
    if !exited {
        qemu::kill_qemu(pid)?;
        if !qemu::wait_for_exit(pid, Duration::from_secs(5)).await {
            return Err(anyhow!("machine process {} survived SIGKILL", pid).into());
        }
    }
    info!(pid, "machine stopped");
    Ok(())
}
