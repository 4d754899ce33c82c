use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::config::QemuConfig;
use crate::machine::{MachineDocument, MachinePaths, PortForward};

/// Guest-side address that slirp forwards to the machine's SOCKS5 gate.
/// Guest provisioning points its traffic redirection here.
pub const GUEST_PROXY_HOST: &str = "10.0.2.100";
pub const GUEST_PROXY_PORT: u16 = 1080;

/// Everything needed to launch one machine.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub qemu: QemuConfig,
    pub memory_mb: u32,
    pub cpus: u32,
    /// The machine's qcow2 overlay.
    pub disk: PathBuf,
    /// Host port forwarded to guest port 22.
    pub ssh_port: u16,
    /// Host address and port of the running proxy.
    pub proxy_host: String,
    pub proxy_port: u16,
    pub ports: Vec<PortForward>,
    /// QMP socket held by the lifecycle controller.
    pub monitor_socket: PathBuf,
    /// QMP socket for ad hoc clients in other processes.
    pub control_socket: PathBuf,
}

impl LaunchSpec {
    pub fn new(
        qemu: &QemuConfig,
        paths: &MachinePaths,
        doc: &MachineDocument,
        proxy_host: impl Into<String>,
        proxy_port: u16,
    ) -> Self {
        Self {
            name: paths.name().to_string(),
            qemu: qemu.clone(),
            memory_mb: doc.memory_mb,
            cpus: doc.cpus,
            disk: paths.disk(),
            ssh_port: doc.ssh_port,
            proxy_host: proxy_host.into(),
            proxy_port,
            ports: doc.ports.clone(),
            monitor_socket: paths.monitor_socket(),
            control_socket: paths.control_socket(),
        }
    }

    /// Build the qemu-system command line.
    ///
    /// Networking is slirp user mode: the only routes out of the guest are
    /// the host forwards and the guestfwd to the proxy.
    pub fn build_command(&self) -> QemuCommand {
        let mut args: Vec<String> = Vec::new();

        args.push("-name".into());
        args.push(self.name.clone());

        args.push("-machine".into());
        args.push(self.qemu.machine.clone());
        args.push("-accel".into());
        args.push(self.qemu.accel.clone());
        args.push("-cpu".into());
        args.push(self.qemu.cpu.clone());

        args.push("-m".into());
        args.push(format!("{}", self.memory_mb));
        args.push("-smp".into());
        args.push(format!("{}", self.cpus));

        if let Some(ref firmware) = self.qemu.firmware {
            args.push("-drive".into());
            args.push(format!(
                "if=pflash,format=raw,readonly=on,file={}",
                escape_opt(&firmware.to_string_lossy())
            ));
        }

        // Root disk (qcow2 overlay on the base image)
        args.push("-drive".into());
        args.push(format!(
            "file={},format=qcow2,if=virtio,cache=writeback",
            escape_opt(&self.disk.to_string_lossy())
        ));

        args.push("-netdev".into());
        args.push(self.netdev());
        args.push("-device".into());
        args.push("virtio-net-pci,netdev=net0".into());

        for (id, socket) in [
            ("monitor", &self.monitor_socket),
            ("control", &self.control_socket),
        ] {
            args.push("-chardev".into());
            args.push(format!(
                "socket,id={},path={},server=on,wait=off",
                id,
                escape_opt(&socket.to_string_lossy())
            ));
            args.push("-mon".into());
            args.push(format!("chardev={},mode=control", id));
        }

        args.push("-display".into());
        args.push(self.qemu.display.clone());

        QemuCommand {
            binary: self.qemu.system_binary.to_string_lossy().into_owned(),
            args,
        }
    }

    fn netdev(&self) -> String {
        let mut netdev = format!(
            "user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22",
            self.ssh_port
        );
        for forward in &self.ports {
            netdev.push_str(&format!(
                ",hostfwd=tcp:127.0.0.1:{}-:{}",
                forward.host, forward.guest
            ));
        }
        netdev.push_str(&format!(
            ",guestfwd=tcp:{}:{}-tcp:{}:{}",
            GUEST_PROXY_HOST, GUEST_PROXY_PORT, self.proxy_host, self.proxy_port
        ));
        netdev
    }
}

/// QEMU option values use ',' as a separator; a literal comma is doubled.
fn escape_opt(value: &str) -> String {
    value.replace(',', ",,")
}

/// A fully-resolved QEMU command ready to be spawned.
#[derive(Debug, Clone)]
pub struct QemuCommand {
    /// Path to the QEMU binary.
    pub binary: String,
    /// Command line arguments.
    pub args: Vec<String>,
}

impl QemuCommand {
    /// Convert to a tokio Command for spawning.
    ///
    /// stderr is null here; `spawn_qemu` redirects it to the machine's log.
    pub fn to_tokio_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(&self.args);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        cmd
    }

    /// Return the full command line as a string (for logging).
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.binary.clone()];
        parts.extend(self.args.iter().map(|a| {
            if a.contains(' ') || a.contains(',') {
                format!("'{}'", a)
            } else {
                a.clone()
            }
        }));
        parts.join(" ")
    }
}

/// Spawn the machine process and record its pid.
///
/// stderr goes to `qemu-stderr.log` in the machine directory. A piped
/// stderr nobody reads would stall QEMU once the pipe buffer fills.
pub async fn spawn_qemu(command: &QemuCommand, paths: &MachinePaths) -> Result<tokio::process::Child> {
    debug!(machine = %paths.name(), cmd = %command.command_line(), "spawning QEMU process");

    let stderr_path = paths.stderr_log();
    let stderr_file = std::fs::File::create(&stderr_path)
        .with_context(|| format!("failed to create {}", stderr_path.display()))?;

    let child = command
        .to_tokio_command()
        .stderr(std::process::Stdio::from(stderr_file))
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {}", command.binary))?;

    let pid = child.id().unwrap_or(0);
    debug!(machine = %paths.name(), pid, "QEMU process spawned");

    if pid != 0 {
        let pid_path = paths.pid_file();
        if let Err(e) = tokio::fs::write(&pid_path, pid.to_string()).await {
            warn!(
                pid,
                path = %pid_path.display(),
                error = %e,
                "failed to write QEMU PID file"
            );
        }
    }

    Ok(child)
}

/// Read a pid file. Missing or malformed files read as `None`.
pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0)
}

/// True if a process with this pid exists (it may belong to another user).
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// SIGKILL a machine process. Used as a last resort when the monitor
/// does not answer or the grace period ran out.
pub fn kill_qemu(pid: u32) -> Result<()> {
    warn!(pid, "force-killing QEMU process");
    let raw = libc::pid_t::try_from(pid).context("pid out of range")?;
    if raw <= 0 {
        bail!("refusing to signal pid {}", pid);
    }
    // SAFETY: plain kill(2) on a positive pid.
    let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!(pid, "QEMU process already gone");
        Ok(())
    } else {
        Err(err).with_context(|| format!("failed to kill QEMU process {}", pid))
    }
}

/// Poll until `pid` is gone or `timeout` passes. Returns whether it exited.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let poll_interval = Duration::from_millis(100);
    loop {
        if !process_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Read the last `n` lines of a file, returning them as a single string.
///
/// If the file does not exist or cannot be read, returns a descriptive
/// placeholder string rather than an error, since this is used for
/// best-effort diagnostics in error paths.
pub async fn read_tail(path: &Path, n: usize) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let lines: Vec<&str> = contents.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines[start..].join("\n")
        }
        Err(e) => format!("[could not read {}: {}]", path.display(), e),
    }
}
