//! On-disk machine store.
//!
//! Every machine lives in `<home>/vms/<name>/`. The directory holds the
//! overlay disk, the machine document (`vm.toml`) and the runtime files of a
//! running instance (pid, monitor sockets, lock, stderr log). The machine
//! document is the only persisted state; it is always rewritten through a
//! temp file and a rename so a crash never leaves a half-written document.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::vm::img::QemuImg;

/// Root of all vmgate state.
#[derive(Debug, Clone)]
pub struct Layout {
    home: PathBuf,
}

impl Layout {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn vms_dir(&self) -> PathBuf {
        self.home.join("vms")
    }

    pub fn machine(&self, name: &str) -> MachinePaths {
        MachinePaths {
            name: name.to_string(),
            dir: self.vms_dir().join(name),
        }
    }

    /// Newline-delimited default allow list.
    pub fn default_rules_path(&self) -> PathBuf {
        self.home.join("default-firewall-rules.conf")
    }

    /// Global hook scripts for one hook point.
    pub fn global_scripts_dir(&self, point: &str) -> PathBuf {
        self.home.join("scripts").join(point)
    }
}

/// Paths of one machine's directory.
#[derive(Debug, Clone)]
pub struct MachinePaths {
    name: String,
    dir: PathBuf,
}

impl MachinePaths {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.document().exists()
    }

    pub fn disk(&self) -> PathBuf {
        self.dir.join("disk.qcow2")
    }

    pub fn document(&self) -> PathBuf {
        self.dir.join("vm.toml")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("pid")
    }

    /// Socket for the session held by the lifecycle controller.
    pub fn monitor_socket(&self) -> PathBuf {
        self.dir.join("monitor.sock")
    }

    /// Socket for ad hoc clients in other processes.
    pub fn control_socket(&self) -> PathBuf {
        self.dir.join("control.sock")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.dir.join("lock")
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.dir.join("qemu-stderr.log")
    }

    pub fn scripts_dir(&self, point: &str) -> PathBuf {
        self.dir.join("scripts").join(point)
    }

    /// Runtime files that only make sense while the process is alive.
    pub fn runtime_files(&self) -> [PathBuf; 3] {
        [self.pid_file(), self.monitor_socket(), self.control_socket()]
    }

    pub fn load(&self) -> Result<MachineDocument> {
        MachineDocument::load(&self.document())
    }

    pub fn update<F>(&self, f: F) -> Result<MachineDocument>
    where
        F: FnOnce(&mut MachineDocument),
    {
        MachineDocument::update(&self.document(), f)
    }

    /// Record an extra forward. Takes effect on the next start.
    pub fn add_port(&self, forward: PortForward) -> Result<()> {
        let path = self.document();
        let mut doc = MachineDocument::load(&path)?;
        if doc.ports.contains(&forward) {
            bail!("port forward {} already exists on '{}'", forward, self.name);
        }
        if forward.host == doc.ssh_port || doc.ports.iter().any(|p| p.host == forward.host) {
            bail!("host port {} is already forwarded on '{}'", forward.host, self.name);
        }
        doc.ports.push(forward);
        doc.save(&path)
    }

    /// Drop a forward. Takes effect on the next start.
    pub fn remove_port(&self, forward: PortForward) -> Result<()> {
        let path = self.document();
        let mut doc = MachineDocument::load(&path)?;
        let before = doc.ports.len();
        doc.ports.retain(|p| *p != forward);
        if doc.ports.len() == before {
            bail!("port forward {} not found on '{}'", forward, self.name);
        }
        doc.save(&path)
    }
}

/// A `host:guest` TCP forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortForward {
    pub host: u16,
    pub guest: u16,
}

impl FromStr for PortForward {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, guest) = s
            .split_once(':')
            .with_context(|| format!("port forward '{}' is not host:guest", s))?;
        let host: u16 = host
            .trim()
            .parse()
            .with_context(|| format!("invalid host port in '{}'", s))?;
        let guest: u16 = guest
            .trim()
            .parse()
            .with_context(|| format!("invalid guest port in '{}'", s))?;
        if host == 0 || guest == 0 {
            bail!("port forward '{}' uses port 0", s);
        }
        Ok(Self { host, guest })
    }
}

impl TryFrom<String> for PortForward {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PortForward> for String {
    fn from(p: PortForward) -> String {
        p.to_string()
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.guest)
    }
}

/// Contents of `vm.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineDocument {
    /// Base image the overlay was created from.
    pub base: PathBuf,
    pub memory_mb: u32,
    pub cpus: u32,
    pub ssh_port: u16,
    pub ssh_user: String,
    /// Proxy port bound on the last start; reused when still free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    #[serde(default)]
    pub ports: Vec<PortForward>,
    #[serde(default)]
    pub first_boot_completed: bool,
    /// Persisted firewall rules, `"ip:port" = "allow" | "deny"`.
    #[serde(default)]
    pub firewall: BTreeMap<String, String>,
}

impl MachineDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading machine document: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing machine document: {}", path.display()))
    }

    /// Write the document atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = toml::to_string(self).context("serializing machine document")?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, data)
            .with_context(|| format!("writing temp document: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming temp document to: {}", path.display()))?;
        Ok(())
    }

    /// Read-modify-write. Fields the closure does not touch are preserved
    /// as they are on disk, not as some earlier in-memory copy had them.
    pub fn update<F>(path: &Path, f: F) -> Result<Self>
    where
        F: FnOnce(&mut Self),
    {
        let mut doc = Self::load(path)?;
        f(&mut doc);
        doc.save(path)?;
        Ok(doc)
    }
}

/// Parameters for a new machine.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    pub base: PathBuf,
    pub memory_mb: u32,
    pub cpus: u32,
    pub ssh_user: String,
    pub ports: Vec<PortForward>,
}

/// Machine names become directory names and hook environment values.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        bail!("machine name must be 1-64 characters");
    }
    if name.starts_with('-') || name.starts_with('.') {
        bail!("machine name '{}' must not start with '-' or '.'", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        bail!(
            "machine name '{}' may only contain letters, digits, '-', '_' and '.'",
            name
        );
    }
    Ok(())
}

/// Create, enumerate and remove machines under one [`Layout`].
#[derive(Debug, Clone)]
pub struct MachineStore {
    layout: Layout,
}

impl MachineStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Paths of an existing machine.
    pub fn get(&self, name: &str) -> Result<MachinePaths> {
        validate_name(name)?;
        let paths = self.layout.machine(name);
        if !paths.exists() {
            bail!("machine '{}' does not exist", name);
        }
        Ok(paths)
    }

    /// Names of all machines, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.layout.vms_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.layout.machine(&name).exists() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// First SSH port at or above `first` not used by any machine.
    pub fn next_ssh_port(&self, first: u16) -> Result<u16> {
        let mut used = HashSet::new();
        for name in self.list()? {
            match self.layout.machine(&name).load() {
                Ok(doc) => {
                    used.insert(doc.ssh_port);
                }
                Err(e) => warn!(machine = %name, error = %e, "skipping unreadable machine document"),
            }
        }
        (first..=u16::MAX)
            .find(|p| !used.contains(p))
            .context("no free SSH port left")
    }

    /// Create the machine directory, its overlay disk and its document.
    /// The machine gets the first SSH port at or above `first_ssh_port`
    /// that no other machine uses.
    pub async fn create(
        &self,
        name: &str,
        spec: MachineSpec,
        first_ssh_port: u16,
        img: &QemuImg,
    ) -> Result<MachinePaths> {
        validate_name(name)?;
        if self.layout.machine(name).dir().exists() {
            bail!("machine '{}' already exists", name);
        }
        let base = std::fs::canonicalize(&spec.base)
            .with_context(|| format!("base image not found: {}", spec.base.display()))?;
        let ssh_port = self.next_ssh_port(first_ssh_port)?;
        self.create_with_ssh_port(name, spec, base, ssh_port, img).await
    }

    async fn create_with_ssh_port(
        &self,
        name: &str,
        spec: MachineSpec,
        base: PathBuf,
        ssh_port: u16,
        img: &QemuImg,
    ) -> Result<MachinePaths> {
        let paths = self.layout.machine(name);
        std::fs::create_dir_all(paths.dir())
            .with_context(|| format!("creating {}", paths.dir().display()))?;

        if let Err(e) = img.create_overlay(&base, &paths.disk()).await {
            let _ = std::fs::remove_dir_all(paths.dir());
            return Err(e).context("creating overlay disk");
        }

        let doc = MachineDocument {
            base,
            memory_mb: spec.memory_mb,
            cpus: spec.cpus,
            ssh_port,
            ssh_user: spec.ssh_user,
            proxy_port: None,
            ports: spec.ports,
            first_boot_completed: false,
            firewall: BTreeMap::new(),
        };
        if let Err(e) = doc.save(&paths.document()) {
            let _ = std::fs::remove_dir_all(paths.dir());
            return Err(e);
        }

        info!(machine = %name, ssh_port, "machine created");
        Ok(paths)
    }

    /// Delete a machine directory. The caller checks it is not running.
    pub fn remove(&self, name: &str) -> Result<()> {
        let paths = self.get(name)?;
        std::fs::remove_dir_all(paths.dir())
            .with_context(|| format!("removing {}", paths.dir().display()))?;
        debug!(machine = %name, "machine directory removed");
        Ok(())
    }
}
