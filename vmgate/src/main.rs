mod cli;
mod config;
mod firewall;
mod hooks;
mod lifecycle;
mod machine;
mod proxy;
mod resolver;
mod snapshot;
mod ssh;
mod vm;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::{App, CreateArgs, FirewallOp, PortOp, SnapshotOp};
use crate::firewall::{Destination, Verdict};
use crate::machine::PortForward;

#[derive(Parser)]
#[command(
    name = "vmgate",
    about = "Local QEMU machines behind a default-deny SOCKS5 firewall"
)]
struct Cli {
    /// Home directory (default: $VMGATE_HOME, else ~/.vmgate).
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a machine as a copy-on-write overlay of a base image.
    Create {
        name: String,
        /// Base qcow2 image.
        #[arg(long)]
        base: PathBuf,
        /// Memory in MiB (default from config).
        #[arg(long)]
        memory: Option<u32>,
        #[arg(long)]
        cpus: Option<u32>,
        /// SSH user inside the guest (default from config).
        #[arg(long)]
        user: Option<String>,
        /// Extra TCP forward from the host, as host:guest. Repeatable.
        #[arg(long = "port", short = 'p')]
        ports: Vec<PortForward>,
        /// Skip the create hooks.
        #[arg(long)]
        no_hooks: bool,
    },
    /// Delete a stopped machine and its disk.
    Remove { name: String },
    /// List machines and whether they are running.
    List,
    /// Show a machine's settings, ports and firewall rules.
    Info { name: String },
    /// Boot a machine in the foreground. Ctrl-C powers it off.
    Start {
        name: String,
        /// Allow every outbound connection without consulting rules.
        #[arg(long)]
        allow_all: bool,
        /// Skip initial-boot and boot hooks.
        #[arg(long)]
        no_hooks: bool,
    },
    /// Open a shell on a running machine, or run a command there.
    Ssh {
        name: String,
        /// Command to run instead of a login shell.
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Power off a machine started by another vmgate process.
    Stop {
        name: String,
        /// Kill the process instead of asking the guest to power off.
        #[arg(long)]
        force: bool,
    },
    /// Manage named snapshots.
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
    /// Manage extra TCP forwards (applied on the next start).
    Port {
        #[command(subcommand)]
        action: PortAction,
    },
    /// Inspect or edit a machine's firewall rules.
    Firewall {
        #[command(subcommand)]
        action: FirewallAction,
    },
    /// Show the hook scripts a machine would run, by hook point.
    Hooks { name: String },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Take a snapshot (live when running, disk-only when stopped).
    Create { name: String, snapshot: String },
    /// Revert to a snapshot.
    Revert { name: String, snapshot: String },
    Delete { name: String, snapshot: String },
    List { name: String },
}

#[derive(Subcommand)]
enum PortAction {
    List { name: String },
    /// Forward a host port to a guest port, as host:guest.
    Add { name: String, forward: PortForward },
    Remove { name: String, forward: PortForward },
}

#[derive(Subcommand)]
enum FirewallAction {
    List { name: String },
    /// Always allow a destination (ip:port).
    Allow { name: String, dest: Destination },
    /// Always deny a destination (ip:port).
    Deny { name: String, dest: Destination },
    /// Forget the rule for a destination; the next connection asks again.
    Remove { name: String, dest: Destination },
    /// Forget every rule.
    Clear { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let home = match cli.home {
        Some(home) => home,
        None => config::home_dir()?,
    };
    let app = App::open(home)?;

    match cli.command {
        Commands::Create {
            name,
            base,
            memory,
            cpus,
            user,
            ports,
            no_hooks,
        } => {
            cli::run_create(
                &app,
                &name,
                CreateArgs {
                    base,
                    memory,
                    cpus,
                    user,
                    ports,
                    run_hooks: !no_hooks,
                },
            )
            .await?;
        }
        Commands::Remove { name } => cli::run_remove(&app, &name).await?,
        Commands::List => cli::run_list(&app)?,
        Commands::Info { name } => cli::run_info(&app, &name).await?,
        Commands::Start {
            name,
            allow_all,
            no_hooks,
        } => cli::run_start(&app, &name, allow_all, !no_hooks).await?,
        Commands::Ssh { name, command } => {
            let code = cli::run_ssh(&app, &name, command).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Stop { name, force } => cli::run_stop(&app, &name, force).await?,
        Commands::Port { action } => {
            let (name, op) = match action {
                PortAction::List { name } => (name, PortOp::List),
                PortAction::Add { name, forward } => (name, PortOp::Add(forward)),
                PortAction::Remove { name, forward } => (name, PortOp::Remove(forward)),
            };
            cli::run_port(&app, &name, op)?;
        }
        Commands::Snapshot { action } => {
            let (name, op) = match action {
                SnapshotAction::Create { name, snapshot } => (name, SnapshotOp::Create(snapshot)),
                SnapshotAction::Revert { name, snapshot } => (name, SnapshotOp::Revert(snapshot)),
                SnapshotAction::Delete { name, snapshot } => (name, SnapshotOp::Delete(snapshot)),
                SnapshotAction::List { name } => (name, SnapshotOp::List),
            };
            cli::run_snapshot(&app, &name, op).await?;
        }
        Commands::Firewall { action } => {
            let (name, op) = match action {
                FirewallAction::List { name } => (name, FirewallOp::List),
                FirewallAction::Allow { name, dest } => (name, FirewallOp::Set(dest, Verdict::Allow)),
                FirewallAction::Deny { name, dest } => (name, FirewallOp::Set(dest, Verdict::Deny)),
                FirewallAction::Remove { name, dest } => (name, FirewallOp::Remove(dest)),
                FirewallAction::Clear { name } => (name, FirewallOp::Clear),
            };
            cli::run_firewall(&app, &name, op)?;
        }
        Commands::Hooks { name } => cli::run_hooks(&app, &name)?,
    }

    Ok(())
}
