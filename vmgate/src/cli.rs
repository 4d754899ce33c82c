//! Subcommand implementations.
//!
//! Every command works from the home directory alone. `start` runs the
//! machine in the foreground; the other commands talk to it through its
//! pid file and control socket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::firewall::{
    ApprovalGateway, CommandGateway, DefaultAllowList, Destination, Mode, RuleStore, StaticGateway,
    Verdict,
};
use crate::hooks::{self, HookPoint, HookRunner, Hooks, SshProbe};
use crate::lifecycle::{
    self, running_pid, MachineController, MachineLock, QemuLauncher, Services, StartOptions,
};
use crate::machine::{Layout, MachineSpec, MachineStore, PortForward};
use crate::proxy::TcpDialer;
use crate::resolver::SystemResolver;
use crate::snapshot::{LiveSnapshots, SnapshotManager};
use crate::ssh::SshTarget;
use crate::vm::qemu::{GUEST_PROXY_HOST, GUEST_PROXY_PORT};
use crate::vm::QemuImg;

/// Configuration and machine store for one home directory.
pub struct App {
    config: Arc<Config>,
    store: MachineStore,
}

impl App {
    pub fn open(home: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&home)
            .with_context(|| format!("creating home directory: {}", home.display()))?;
        let config = Config::load_from_home(&home)?;
        Ok(Self {
            config: Arc::new(config),
            store: MachineStore::new(Layout::new(home)),
        })
    }

    fn layout(&self) -> &Layout {
        self.store.layout()
    }

    fn img(&self) -> QemuImg {
        QemuImg::new(&self.config.qemu.img_binary)
    }

    fn hooks(&self) -> Hooks {
        Hooks::new(
            self.layout().clone(),
            HookRunner::new(self.config.lifecycle.hook_timeout()),
            Arc::new(SshProbe::new()),
            self.config.lifecycle.reachability_timeout(),
        )
    }

    fn services(&self) -> Result<Services> {
        let defaults = DefaultAllowList::load_or_seed(&self.layout().default_rules_path())?;
        let gateway: Arc<dyn ApprovalGateway> = match &self.config.approval.command {
            Some(program) => {
                Arc::new(CommandGateway::new(program).with_args(self.config.approval.args.clone()))
            }
            None => Arc::new(StaticGateway(Verdict::Deny)),
        };
        let proxy = &self.config.proxy;
        Ok(Services {
            defaults: Arc::new(defaults),
            gateway,
            resolver: Arc::new(SystemResolver::new(
                proxy.resolve_timeout(),
                proxy.reverse_lookup_timeout(),
            )),
            dialer: Arc::new(TcpDialer::new(proxy.connect_timeout())),
            launcher: Arc::new(QemuLauncher),
            hooks: Some(self.hooks()),
        })
    }
}

// ---------------------------------------------------------------------------
// create / remove
// ---------------------------------------------------------------------------

pub struct CreateArgs {
    pub base: PathBuf,
    pub memory: Option<u32>,
    pub cpus: Option<u32>,
    pub user: Option<String>,
    pub ports: Vec<PortForward>,
    pub run_hooks: bool,
}

pub async fn run_create(app: &App, name: &str, args: CreateArgs) -> Result<()> {
    let defaults = &app.config.defaults;
    let spec = MachineSpec {
        base: args.base,
        memory_mb: args.memory.unwrap_or(defaults.memory_mb),
        cpus: args.cpus.unwrap_or(defaults.cpus),
        ssh_user: args.user.unwrap_or_else(|| defaults.ssh_user.clone()),
        ports: args.ports,
    };
    let paths = app
        .store
        .create(name, spec, defaults.first_ssh_port, &app.img())
        .await?;
    let doc = paths.load()?;
    println!("Created {} (ssh port {})", name, doc.ssh_port);

    if args.run_hooks {
        let outcomes = app.hooks().run_create(&paths).await?;
        for outcome in outcomes.iter().filter(|o| !o.success) {
            println!(
                "  {} create hook {} failed: {}",
                outcome.source, outcome.script, outcome.detail
            );
        }
    }
    Ok(())
}

pub async fn run_remove(app: &App, name: &str) -> Result<()> {
    let paths = app.store.get(name)?;
    let _lock = MachineLock::acquire(&paths).await?;
    if let Some(pid) = running_pid(&paths) {
        bail!("machine '{}' is running (pid {}); stop it first", name, pid);
    }
    app.store.remove(name)?;
    println!("Removed {}", name);
    Ok(())
}

// ---------------------------------------------------------------------------
// list / info
// ---------------------------------------------------------------------------

struct MachineRow {
    name: String,
    state: String,
    ssh_port: Option<u16>,
}

fn machine_rows(app: &App) -> Result<Vec<MachineRow>> {
    let mut rows = Vec::new();
    for name in app.store.list()? {
        let paths = app.layout().machine(&name);
        let state = match running_pid(&paths) {
            Some(pid) => format!("running (pid {})", pid),
            None => "stopped".to_string(),
        };
        // A damaged document still gets a row.
        let ssh_port = paths.load().ok().map(|d| d.ssh_port);
        rows.push(MachineRow {
            name,
            state,
            ssh_port,
        });
    }
    Ok(rows)
}

pub fn run_list(app: &App) -> Result<()> {
    let rows = machine_rows(app)?;
    if rows.is_empty() {
        println!("No machines in {}", app.layout().vms_dir().display());
        return Ok(());
    }
    println!("{:<24} {:<22} SSH", "NAME", "STATE");
    for row in rows {
        let ssh = row
            .ssh_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "?".into());
        println!("{:<24} {:<22} {}", row.name, row.state, ssh);
    }
    Ok(())
}

pub async fn run_info(app: &App, name: &str) -> Result<()> {
    let paths = app.store.get(name)?;
    let doc = paths.load()?;
    let rules = RuleStore::load(&paths.document())?;

    println!("Machine:     {}", name);
    match running_pid(&paths) {
        Some(pid) => {
            println!("State:       running (pid {})", pid);
            match lifecycle::machine_status(&paths).await {
                Ok(status) => println!("VM status:   {:?}", status),
                Err(e) => println!("VM status:   unknown ({})", e),
            }
        }
        None => println!("State:       stopped"),
    }
    println!("Base image:  {}", doc.base.display());
    println!("Disk:        {}", paths.disk().display());
    println!("Memory:      {} MiB", doc.memory_mb);
    println!("CPUs:        {}", doc.cpus);
    println!("SSH:         vmgate ssh {} (port {})", name, doc.ssh_port);
    if let Some(port) = doc.proxy_port {
        println!(
            "Proxy:       {}:{} (guest: {}:{})",
            app.config.proxy.bind_address, port, GUEST_PROXY_HOST, GUEST_PROXY_PORT
        );
    }
    for forward in &doc.ports {
        println!("Forward:     127.0.0.1:{} -> guest:{}", forward.host, forward.guest);
    }
    println!(
        "First boot:  {}",
        if doc.first_boot_completed { "done" } else { "pending" }
    );
    println!("Firewall:    {} rule(s)", rules.len());
    for (dest, verdict) in rules.list() {
        println!("  {:<5} {}", verdict.as_str(), dest);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// start / stop
// ---------------------------------------------------------------------------

/// Boot the machine and stay attached until it powers off or the user
/// interrupts, in which case it is powered off.
pub async fn run_start(app: &App, name: &str, allow_all: bool, run_hooks: bool) -> Result<()> {
    let paths = app.store.get(name)?;
    let doc = paths.load()?;
    let mut controller = MachineController::new(paths, app.config.clone(), app.services()?);
    let opts = StartOptions {
        mode: if allow_all { Mode::AllowAll } else { Mode::Enforce },
        run_hooks,
    };
    let report = controller.start(opts).await?;

    println!("{} is running (pid {})", name, report.pid);
    println!("  ssh:   vmgate ssh {} (port {})", name, doc.ssh_port);
    println!(
        "  proxy: {}:{} (guest: {}:{})",
        app.config.proxy.bind_address, report.proxy_port, GUEST_PROXY_HOST, GUEST_PROXY_PORT
    );
    if allow_all {
        println!("  firewall: allow-all, nothing is recorded");
    }
    if let Some(hooks) = &report.hooks {
        for failure in hooks.failures() {
            println!(
                "  {} hook {} failed: {}",
                failure.source, failure.script, failure.detail
            );
        }
    }

    tokio::select! {
        status = controller.wait() => {
            let status = status?;
            println!("{} exited ({})", name, status);
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Stopping {}...", name);
            controller.stop(false).await?;
            println!("{} stopped", name);
        }
    }
    Ok(())
}

pub async fn run_stop(app: &App, name: &str, force: bool) -> Result<()> {
    let paths = app.store.get(name)?;
    lifecycle::stop_detached(&paths, app.config.lifecycle.shutdown_grace(), force).await?;
    println!("{} stopped", name);
    Ok(())
}

/// `ssh` into a running machine, interactively or running `command`.
/// Returns the exit code of the ssh client.
pub async fn run_ssh(app: &App, name: &str, command: Vec<String>) -> Result<i32> {
    let mut ssh = ssh_command(app, name, command)?;
    let status = ssh.status().await.context("running ssh")?;
    Ok(status.code().unwrap_or(255))
}

fn ssh_command(app: &App, name: &str, command: Vec<String>) -> Result<tokio::process::Command> {
    let paths = app.store.get(name)?;
    if running_pid(&paths).is_none() {
        bail!("machine '{}' is not running", name);
    }
    let target = SshTarget::for_machine(&paths.load()?);
    let mut ssh = tokio::process::Command::new("ssh");
    ssh.args(target.args()).args(command);
    Ok(ssh)
}

// ---------------------------------------------------------------------------
// ports
// ---------------------------------------------------------------------------

pub enum PortOp {
    List,
    Add(PortForward),
    Remove(PortForward),
}

/// Edit the extra forwards in `vm.toml`. QEMU fixes its forwards at launch,
/// so changes apply from the next start.
pub fn run_port(app: &App, name: &str, op: PortOp) -> Result<()> {
    let paths = app.store.get(name)?;
    match op {
        PortOp::List => {
            let doc = paths.load()?;
            println!("{:<8} 127.0.0.1:{} -> guest:22", "ssh", doc.ssh_port);
            for forward in &doc.ports {
                println!("{:<8} 127.0.0.1:{} -> guest:{}", "forward", forward.host, forward.guest);
            }
            return Ok(());
        }
        PortOp::Add(forward) => {
            paths.add_port(forward)?;
            println!("Added port forward {}", forward);
        }
        PortOp::Remove(forward) => {
            paths.remove_port(forward)?;
            println!("Removed port forward {}", forward);
        }
    }
    if running_pid(&paths).is_some() {
        println!("Note: {} is running; restart it to apply the change", name);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// snapshot
// ---------------------------------------------------------------------------

pub enum SnapshotOp {
    Create(String),
    Revert(String),
    Delete(String),
    List,
}

/// Snapshot commands hold the machine lock. A running machine is driven
/// over its control socket, a stopped one through qemu-img.
pub async fn run_snapshot(app: &App, name: &str, op: SnapshotOp) -> Result<()> {
    let paths = app.store.get(name)?;
    let _lock = MachineLock::acquire(&paths).await?;
    let img = app.img();
    let manager = SnapshotManager::new(name, paths.disk(), &img);

    let mut session = match running_pid(&paths) {
        Some(_) => Some(lifecycle::connect_control(&paths).await?),
        None => None,
    };
    let live = session.as_mut().map(|c| c as &mut dyn LiveSnapshots);

    match op {
        SnapshotOp::Create(snapshot) => {
            let kind = manager.create(&snapshot, live).await?;
            println!("Created {} snapshot '{}'", kind, snapshot);
        }
        SnapshotOp::Revert(snapshot) => {
            manager.revert(&snapshot, live).await?;
            println!("Reverted {} to '{}'", name, snapshot);
        }
        SnapshotOp::Delete(snapshot) => {
            manager.delete(&snapshot, live).await?;
            println!("Deleted snapshot '{}'", snapshot);
        }
        SnapshotOp::List => {
            let snapshots = manager.list(live).await?;
            if snapshots.is_empty() {
                println!("No snapshots");
                return Ok(());
            }
            println!("{:<24} {:<8} {:<20} VM STATE", "NAME", "KIND", "DATE");
            for s in snapshots {
                println!(
                    "{:<24} {:<8} {:<20} {}",
                    s.name,
                    s.kind.to_string(),
                    s.date.as_deref().unwrap_or("-"),
                    s.vm_state_size.map(format_bytes).unwrap_or_else(|| "-".into())
                );
            }
        }
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

// ---------------------------------------------------------------------------
// firewall
// ---------------------------------------------------------------------------

pub enum FirewallOp {
    List,
    Set(Destination, Verdict),
    Remove(Destination),
    Clear,
}

/// Edit the rules in `vm.toml`. A running machine re-reads them before its
/// next rule lookup.
pub fn run_firewall(app: &App, name: &str, op: FirewallOp) -> Result<()> {
    let paths = app.store.get(name)?;
    let mut rules = RuleStore::load(&paths.document())?;
    let running = running_pid(&paths).is_some();

    match op {
        FirewallOp::List => {
            if rules.is_empty() {
                println!("No firewall rules for {}", name);
            }
            for (dest, verdict) in rules.list() {
                println!("{:<5} {}", verdict.as_str(), dest);
            }
            return Ok(());
        }
        FirewallOp::Set(dest, verdict) => {
            rules.set(dest, verdict)?;
            println!("{} {}", verdict, dest);
        }
        FirewallOp::Remove(dest) => {
            if rules.remove(&dest)? {
                println!("Removed rule for {}", dest);
            } else {
                println!("No rule for {}", dest);
            }
        }
        FirewallOp::Clear => {
            let count = rules.clear()?;
            println!("Removed {} rule(s)", count);
        }
    }
    if running {
        println!("Note: {} is running; the change applies to its next connection", name);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// hooks
// ---------------------------------------------------------------------------

pub fn run_hooks(app: &App, name: &str) -> Result<()> {
    let paths = app.store.get(name)?;
    for point in HookPoint::ALL {
        let scripts = hooks::collect(app.layout(), &paths, point)?;
        println!("{}:", point);
        if scripts.is_empty() {
            println!("  (none)");
        }
        for script in scripts {
            println!(
                "  {:<32} {:<8} {}",
                script.file_name(),
                script.source.to_string(),
                script.path.display()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::machine::MachineDocument;

    fn app_with_machine(home: &std::path::Path, name: &str) -> App {
        let app = App::open(home.to_path_buf()).unwrap();
        let paths = app.layout().machine(name);
        std::fs::create_dir_all(paths.dir()).unwrap();
        MachineDocument {
            base: PathBuf::from("/images/jammy.qcow2"),
            memory_mb: 2048,
            cpus: 2,
            ssh_port: 2222,
            ssh_user: "ubuntu".into(),
            proxy_port: None,
            ports: Vec::new(),
            first_boot_completed: false,
            firewall: BTreeMap::new(),
        }
        .save(&paths.document())
        .unwrap();
        app
    }

    #[test]
    fn firewall_edits_land_in_the_document() {
        let home = tempfile::tempdir().unwrap();
        let app = app_with_machine(home.path(), "dev");
        let dest: Destination = "93.184.216.34:443".parse().unwrap();
        let other: Destination = "10.1.2.3:22".parse().unwrap();

        run_firewall(&app, "dev", FirewallOp::Set(dest, Verdict::Allow)).unwrap();
        run_firewall(&app, "dev", FirewallOp::Set(other, Verdict::Deny)).unwrap();
        let doc = app.layout().machine("dev").load().unwrap();
        assert_eq!(doc.firewall.get("93.184.216.34:443").map(String::as_str), Some("allow"));
        assert_eq!(doc.firewall.get("10.1.2.3:22").map(String::as_str), Some("deny"));

        run_firewall(&app, "dev", FirewallOp::Remove(dest)).unwrap();
        let doc = app.layout().machine("dev").load().unwrap();
        assert!(!doc.firewall.contains_key("93.184.216.34:443"));

        run_firewall(&app, "dev", FirewallOp::Clear).unwrap();
        let doc = app.layout().machine("dev").load().unwrap();
        assert!(doc.firewall.is_empty());
        // untouched fields survive the rewrites
        assert_eq!(doc.ssh_port, 2222);
    }

    #[tokio::test]
    async fn unknown_machine_is_an_error() {
        let home = tempfile::tempdir().unwrap();
        let app = App::open(home.path().to_path_buf()).unwrap();
        assert!(run_firewall(&app, "ghost", FirewallOp::List).is_err());
        assert!(run_port(&app, "ghost", PortOp::List).is_err());
        assert!(run_info(&app, "ghost").await.is_err());
    }

    #[test]
    fn port_edits_land_in_the_document() {
        let home = tempfile::tempdir().unwrap();
        let app = app_with_machine(home.path(), "dev");
        let forward: PortForward = "8080:80".parse().unwrap();

        run_port(&app, "dev", PortOp::Add(forward)).unwrap();
        assert!(run_port(&app, "dev", PortOp::Add(forward)).is_err());
        assert_eq!(app.layout().machine("dev").load().unwrap().ports, vec![forward]);
        run_port(&app, "dev", PortOp::List).unwrap();

        run_port(&app, "dev", PortOp::Remove(forward)).unwrap();
        assert!(app.layout().machine("dev").load().unwrap().ports.is_empty());
        assert!(run_port(&app, "dev", PortOp::Remove(forward)).is_err());
    }

    #[test]
    fn ssh_targets_the_forwarded_port_of_a_running_machine() {
        let home = tempfile::tempdir().unwrap();
        let app = app_with_machine(home.path(), "dev");
        let command = vec!["uname".to_string(), "-a".to_string()];
        let err = ssh_command(&app, "dev", command.clone()).unwrap_err();
        assert!(err.to_string().contains("not running"));

        let paths = app.layout().machine("dev");
        std::fs::write(paths.pid_file(), std::process::id().to_string()).unwrap();
        let ssh = ssh_command(&app, "dev", command).unwrap();
        let args: Vec<String> = ssh
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let tail = &args[args.len() - 5..];
        assert_eq!(tail, ["-p", "2222", "ubuntu@127.0.0.1", "uname", "-a"]);
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
    }

    #[tokio::test]
    async fn info_reports_an_unreachable_monitor_without_failing() {
        let home = tempfile::tempdir().unwrap();
        let app = app_with_machine(home.path(), "dev");
        let paths = app.layout().machine("dev");
        std::fs::write(paths.pid_file(), std::process::id().to_string()).unwrap();
        run_info(&app, "dev").await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_on_a_running_machine_needs_its_control_socket() {
        let home = tempfile::tempdir().unwrap();
        let app = app_with_machine(home.path(), "dev");
        let paths = app.layout().machine("dev");
        std::fs::write(paths.pid_file(), std::process::id().to_string()).unwrap();
        let err = run_snapshot(&app, "dev", SnapshotOp::List).await.unwrap_err();
        let err = err.downcast::<lifecycle::LifecycleError>().unwrap();
        assert!(matches!(err, lifecycle::LifecycleError::Monitor { .. }));
    }

    #[tokio::test]
    async fn remove_refuses_a_running_machine() {
        let home = tempfile::tempdir().unwrap();
        let app = app_with_machine(home.path(), "dev");
        let paths = app.layout().machine("dev");
        // our own pid is certainly alive
        std::fs::write(paths.pid_file(), std::process::id().to_string()).unwrap();

        let err = run_remove(&app, "dev").await.unwrap_err();
        assert!(err.to_string().contains("is running"));
        assert!(paths.dir().exists());

        std::fs::remove_file(paths.pid_file()).unwrap();
        run_remove(&app, "dev").await.unwrap();
        assert!(!paths.dir().exists());
    }

    #[test]
    fn rows_report_state_from_the_pid_file() {
        let home = tempfile::tempdir().unwrap();
        let app = app_with_machine(home.path(), "a");
        app_with_machine(home.path(), "b");
        std::fs::write(
            app.layout().machine("b").pid_file(),
            std::process::id().to_string(),
        )
        .unwrap();

        let rows = machine_rows(&app).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "a");
        assert_eq!(rows[0].state, "stopped");
        assert!(rows[1].state.starts_with("running"));
        assert_eq!(rows[1].ssh_port, Some(2222));
    }

    #[test]
    fn services_seed_the_default_allow_list() {
        let home = tempfile::tempdir().unwrap();
        let app = App::open(home.path().to_path_buf()).unwrap();
        let services = app.services().unwrap();
        assert!(!services.defaults.is_empty());
        assert!(app.layout().default_rules_path().exists());
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(268435456), "256.0 MiB");
    }
}
