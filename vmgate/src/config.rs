use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the vmgate home directory.
pub const HOME_ENV: &str = "VMGATE_HOME";

/// Top-level configuration, read from `<home>/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub qemu: QemuConfig,
    pub proxy: ProxyConfig,
    pub approval: ApprovalConfig,
    pub lifecycle: LifecycleConfig,
    pub defaults: MachineDefaults,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `config.toml` from the home directory, falling back to defaults
    /// when the file does not exist.
    pub fn load_from_home(home: &Path) -> Result<Self> {
        let path = home.join("config.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.proxy.decision_workers >= 1,
            "proxy.decision_workers must be >= 1"
        );
        anyhow::ensure!(
            self.proxy.decision_workers <= 64,
            "proxy.decision_workers must be <= 64"
        );
        anyhow::ensure!(
            self.proxy.handshake_timeout_secs >= 1,
            "proxy.handshake_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.approval.timeout_secs >= 1,
            "approval.timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.approval.enrich_timeout_secs >= 1,
            "approval.enrich_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.lifecycle.monitor_connect_retries >= 1,
            "lifecycle.monitor_connect_retries must be >= 1"
        );
        anyhow::ensure!(
            self.defaults.memory_mb >= 128,
            "defaults.memory_mb must be >= 128"
        );
        anyhow::ensure!(self.defaults.cpus >= 1, "defaults.cpus must be >= 1");
        anyhow::ensure!(
            self.defaults.first_ssh_port >= 1024,
            "defaults.first_ssh_port must be an unprivileged port"
        );
        Ok(())
    }
}

/// Resolve the vmgate home directory: `$VMGATE_HOME`, else `~/.vmgate`.
pub fn home_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    let user_home = std::env::var_os("HOME").context("neither VMGATE_HOME nor HOME is set")?;
    Ok(PathBuf::from(user_home).join(".vmgate"))
}

/// Hypervisor binaries and machine shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QemuConfig {
    /// The qemu-system binary.
    pub system_binary: PathBuf,
    /// The qemu-img binary, used for overlays and offline snapshots.
    pub img_binary: PathBuf,
    /// Accelerator passed to `-accel` (kvm, hvf, tcg).
    pub accel: String,
    /// Machine type passed to `-machine`.
    pub machine: String,
    pub cpu: String,
    /// Display backend; "none" runs headless.
    pub display: String,
    /// Optional read-only UEFI firmware image (pflash).
    pub firmware: Option<PathBuf>,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            system_binary: PathBuf::from("qemu-system-x86_64"),
            img_binary: PathBuf::from("qemu-img"),
            accel: "kvm".into(),
            machine: "q35".into(),
            cpu: "host".into(),
            display: "none".into(),
            firmware: None,
        }
    }
}

/// SOCKS5 gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Host address the per-machine proxy binds to.
    pub bind_address: IpAddr,
    /// Threads in the firewall decision pool.
    pub decision_workers: usize,
    /// Forward lookup timeout for domain-name targets.
    pub resolve_timeout_ms: u64,
    /// Reverse lookup timeout used by the firewall engine.
    pub reverse_lookup_timeout_ms: u64,
    /// Outbound connect timeout.
    pub connect_timeout_secs: u64,
    /// Time a client has to send its SOCKS5 greeting and request.
    pub handshake_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            decision_workers: 4,
            resolve_timeout_ms: 3000,
            reverse_lookup_timeout_ms: 1500,
            connect_timeout_secs: 15,
            handshake_timeout_secs: 10,
        }
    }
}

impl ProxyConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn reverse_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.reverse_lookup_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Approval gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Program asked about unknown destinations. It receives the request in
    /// `VMGATE_*` environment variables and prints `allow` or `deny`.
    /// Without one, unknown destinations are denied.
    pub command: Option<PathBuf>,
    /// Extra arguments for `command`.
    pub args: Vec<String>,
    /// Upper bound on a single approval.
    pub timeout_secs: u64,
    /// Command run inside the guest over SSH as `<command> <ip> <port>` to
    /// learn the domain and process behind a connection. Unset disables
    /// enrichment.
    pub enrich_command: Option<String>,
    pub enrich_timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: 300,
            enrich_command: None,
            enrich_timeout_secs: 5,
        }
    }
}

impl ApprovalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn enrich_timeout(&self) -> Duration {
        Duration::from_secs(self.enrich_timeout_secs)
    }
}

/// Timeouts for start/stop and hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub monitor_connect_retries: u32,
    /// Initial backoff between monitor connect attempts.
    pub monitor_retry_delay_ms: u64,
    /// How long an ACPI power-off may take before the process is killed.
    pub shutdown_grace_secs: u64,
    /// How long to wait for the guest to answer over SSH before boot hooks.
    pub reachability_timeout_secs: u64,
    pub hook_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            monitor_connect_retries: 20,
            monitor_retry_delay_ms: 100,
            shutdown_grace_secs: 30,
            reachability_timeout_secs: 120,
            hook_timeout_secs: 300,
        }
    }
}

impl LifecycleConfig {
    pub fn monitor_retry_delay(&self) -> Duration {
        Duration::from_millis(self.monitor_retry_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_secs(self.reachability_timeout_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }
}

/// Values used by `create` when the caller does not say otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineDefaults {
    pub memory_mb: u32,
    pub cpus: u32,
    pub ssh_user: String,
    /// First host port handed out for guest SSH forwarding.
    pub first_ssh_port: u16,
}

impl Default for MachineDefaults {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpus: 2,
            ssh_user: "ubuntu".into(),
            first_ssh_port: 2222,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.qemu.img_binary, PathBuf::from("qemu-img"));
        assert_eq!(config.proxy.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.proxy.decision_workers, 4);
        assert_eq!(config.proxy.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.approval.timeout(), Duration::from_secs(300));
        assert!(config.approval.command.is_none());
        assert!(config.approval.enrich_command.is_none());
        assert_eq!(config.lifecycle.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(config.defaults.ssh_user, "ubuntu");
        assert_eq!(config.defaults.first_ssh_port, 2222);
    }

    #[test]
    fn config_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
[qemu]
system_binary = "/opt/qemu/bin/qemu-system-aarch64"
accel = "hvf"
machine = "virt"

[proxy]
decision_workers = 2

[approval]
command = "/usr/local/bin/vmgate-ask"
timeout_secs = 60
enrich_command = "/usr/local/bin/vmgate-enrich"
"#,
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.qemu.accel, "hvf");
        assert_eq!(config.qemu.machine, "virt");
        // Unset fields keep their defaults
        assert_eq!(config.qemu.img_binary, PathBuf::from("qemu-img"));
        assert_eq!(config.proxy.decision_workers, 2);
        assert_eq!(config.proxy.connect_timeout_secs, 15);
        assert_eq!(
            config.approval.command,
            Some(PathBuf::from("/usr/local/bin/vmgate-ask"))
        );
        assert_eq!(config.approval.timeout(), Duration::from_secs(60));
        assert_eq!(
            config.approval.enrich_command.as_deref(),
            Some("/usr/local/bin/vmgate-enrich")
        );
        assert_eq!(config.approval.enrich_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn config_load_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[proxy\ndecision_workers = ").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn config_validation_rejects_zero_workers() {
        let mut config = Config::default();
        config.proxy.decision_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_zero_approval_timeout() {
        let mut config = Config::default();
        config.approval.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_privileged_ssh_port() {
        let mut config = Config::default();
        config.defaults.first_ssh_port = 22;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_home_without_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_home(dir.path()).unwrap();
        assert_eq!(config.proxy.decision_workers, 4);
    }
}
