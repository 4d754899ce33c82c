//! Named snapshots of one machine, live or offline.
//!
//! The mechanism follows the machine's state at call time, not the kind a
//! snapshot was taken with: a running machine goes through its monitor
//! session (`savevm`/`loadvm`/`delvm`), a stopped one through `qemu-img`.
//! Both write internal qcow2 snapshots, so either path can see and revert
//! what the other created. Callers hold the machine lock.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::vm::qmp::{validate_hmp_tag, MonitorError, QmpClient};
use crate::vm::QemuImg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Disk and memory, taken while running.
    Live,
    /// Disk only.
    Offline,
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SnapshotKind::Live => "live",
            SnapshotKind::Offline => "offline",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub kind: SnapshotKind,
    /// Bytes of saved VM state, when known.
    pub vm_state_size: Option<u64>,
    pub date: Option<String>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot '{name}' not found on machine '{machine}'")]
    NotFound { machine: String, name: String },

    #[error("snapshot '{name}' already exists on machine '{machine}'")]
    AlreadyExists { machine: String, name: String },

    #[error("invalid snapshot name '{0}': use 1-128 of [A-Za-z0-9._-]")]
    InvalidName(String),

    /// The monitor session failed mid-operation. The operation may or may
    /// not have been applied.
    #[error("machine '{machine}' unreachable: {source}")]
    Unreachable {
        machine: String,
        #[source]
        source: MonitorError,
    },

    #[error("machine '{machine}' refused the snapshot command: {source}")]
    Refused {
        machine: String,
        #[source]
        source: MonitorError,
    },

    #[error("disk image utility failed: {0:#}")]
    Tool(anyhow::Error),
}

/// Snapshot operations on a running machine.
#[async_trait]
pub trait LiveSnapshots: Send {
    async fn save(&mut self, name: &str) -> Result<(), MonitorError>;
    async fn load(&mut self, name: &str) -> Result<(), MonitorError>;
    async fn delete(&mut self, name: &str) -> Result<(), MonitorError>;
    async fn list(&mut self) -> Result<Vec<SnapshotInfo>, MonitorError>;
}

#[async_trait]
impl LiveSnapshots for QmpClient {
    async fn save(&mut self, name: &str) -> Result<(), MonitorError> {
        self.savevm(name).await
    }

    async fn load(&mut self, name: &str) -> Result<(), MonitorError> {
        self.loadvm(name).await
    }

    async fn delete(&mut self, name: &str) -> Result<(), MonitorError> {
        self.delvm(name).await
    }

    async fn list(&mut self) -> Result<Vec<SnapshotInfo>, MonitorError> {
        let table = self.info_snapshots().await?;
        Ok(parse_info_snapshots(&table))
    }
}

/// Snapshot operations on the disk of a stopped machine.
#[async_trait]
pub trait OfflineSnapshots: Send + Sync {
    async fn create(&self, disk: &Path, name: &str) -> anyhow::Result<()>;
    async fn apply(&self, disk: &Path, name: &str) -> anyhow::Result<()>;
    async fn delete(&self, disk: &Path, name: &str) -> anyhow::Result<()>;
    async fn list(&self, disk: &Path) -> anyhow::Result<Vec<SnapshotInfo>>;
}

#[async_trait]
impl OfflineSnapshots for QemuImg {
    async fn create(&self, disk: &Path, name: &str) -> anyhow::Result<()> {
        self.snapshot_create(disk, name).await
    }

    async fn apply(&self, disk: &Path, name: &str) -> anyhow::Result<()> {
        self.snapshot_apply(disk, name).await
    }

    async fn delete(&self, disk: &Path, name: &str) -> anyhow::Result<()> {
        self.snapshot_delete(disk, name).await
    }

    async fn list(&self, disk: &Path) -> anyhow::Result<Vec<SnapshotInfo>> {
        self.snapshot_list(disk).await
    }
}

pub struct SnapshotManager<'a> {
    machine: String,
    disk: PathBuf,
    offline: &'a dyn OfflineSnapshots,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(machine: impl Into<String>, disk: PathBuf, offline: &'a dyn OfflineSnapshots) -> Self {
        Self {
            machine: machine.into(),
            disk,
            offline,
        }
    }

    /// Take a snapshot. `live` is the monitor session of a running
    /// machine, `None` when it is stopped.
    #[instrument(skip(self, live), fields(machine = %self.machine, running = live.is_some()))]
    pub async fn create(
        &self,
        name: &str,
        mut live: Option<&mut (dyn LiveSnapshots + '_)>,
    ) -> Result<SnapshotKind, SnapshotError> {
        validate_name(name)?;
        if self.find(name, live.as_deref_mut()).await?.is_some() {
            return Err(SnapshotError::AlreadyExists {
                machine: self.machine.clone(),
                name: name.to_string(),
            });
        }
        let kind = match live {
            Some(session) => {
                session.save(name).await.map_err(|e| self.monitor_error(e))?;
                SnapshotKind::Live
            }
            None => {
                self.offline
                    .create(&self.disk, name)
                    .await
                    .map_err(SnapshotError::Tool)?;
                SnapshotKind::Offline
            }
        };
        info!(snapshot = %name, %kind, "snapshot created");
        Ok(kind)
    }

    /// Revert to a snapshot. A running machine is reverted in place through
    /// its monitor; a stopped one has the snapshot applied to its disk.
    #[instrument(skip(self, live), fields(machine = %self.machine, running = live.is_some()))]
    pub async fn revert(
        &self,
        name: &str,
        mut live: Option<&mut (dyn LiveSnapshots + '_)>,
    ) -> Result<(), SnapshotError> {
        validate_name(name)?;
        self.require(name, live.as_deref_mut()).await?;
        match live {
            Some(session) => session.load(name).await.map_err(|e| self.monitor_error(e))?,
            None => self
                .offline
                .apply(&self.disk, name)
                .await
                .map_err(SnapshotError::Tool)?,
        }
        info!(snapshot = %name, "reverted to snapshot");
        Ok(())
    }

    #[instrument(skip(self, live), fields(machine = %self.machine, running = live.is_some()))]
    pub async fn delete(
        &self,
        name: &str,
        mut live: Option<&mut (dyn LiveSnapshots + '_)>,
    ) -> Result<(), SnapshotError> {
        validate_name(name)?;
        self.require(name, live.as_deref_mut()).await?;
        match live {
            // delvm drops the snapshot from every image the machine has open
            Some(session) => session.delete(name).await.map_err(|e| self.monitor_error(e))?,
            None => self
                .offline
                .delete(&self.disk, name)
                .await
                .map_err(SnapshotError::Tool)?,
        }
        info!(snapshot = %name, "snapshot deleted");
        Ok(())
    }

    pub async fn list(
        &self,
        live: Option<&mut (dyn LiveSnapshots + '_)>,
    ) -> Result<Vec<SnapshotInfo>, SnapshotError> {
        match live {
            Some(session) => session.list().await.map_err(|e| self.monitor_error(e)),
            None => self
                .offline
                .list(&self.disk)
                .await
                .map_err(SnapshotError::Tool),
        }
    }

    async fn find(
        &self,
        name: &str,
        live: Option<&mut (dyn LiveSnapshots + '_)>,
    ) -> Result<Option<SnapshotInfo>, SnapshotError> {
        Ok(self.list(live).await?.into_iter().find(|s| s.name == name))
    }

    async fn require(
        &self,
        name: &str,
        live: Option<&mut (dyn LiveSnapshots + '_)>,
    ) -> Result<SnapshotInfo, SnapshotError> {
        self.find(name, live)
            .await?
            .ok_or_else(|| SnapshotError::NotFound {
                machine: self.machine.clone(),
                name: name.to_string(),
            })
    }

    fn monitor_error(&self, e: MonitorError) -> SnapshotError {
        match e {
            MonitorError::InvalidTag(tag) => SnapshotError::InvalidName(tag),
            e if e.is_unreachable() => SnapshotError::Unreachable {
                machine: self.machine.clone(),
                source: e,
            },
            e => SnapshotError::Refused {
                machine: self.machine.clone(),
                source: e,
            },
        }
    }
}

fn validate_name(name: &str) -> Result<(), SnapshotError> {
    validate_hmp_tag(name).map_err(|_| SnapshotError::InvalidName(name.to_string()))
}

/// Parse the HMP `info snapshots` table.
///
/// ```text
/// List of snapshots present on all disks:
/// ID        TAG               VM SIZE                DATE     VM CLOCK     ICOUNT
/// --        warm            256 MiB 2024-03-01 10:15:02 00:01:12.345
/// ```
pub fn parse_info_snapshots(table: &str) -> Vec<SnapshotInfo> {
    let mut rows = table.lines().skip_while(|l| !l.trim_start().starts_with("ID"));
    // header
    rows.next();

    rows.filter_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 {
            return None;
        }
        let name = tokens[1].to_string();
        let date_at = tokens[2..].iter().position(|t| is_date(t))? + 2;
        let size = parse_size(&tokens[2..date_at]);
        let date = tokens
            .get(date_at + 1)
            .map(|time| format!("{} {}", tokens[date_at], time));
        Some(SnapshotInfo {
            kind: if size.unwrap_or(0) > 0 {
                SnapshotKind::Live
            } else {
                SnapshotKind::Offline
            },
            name,
            vm_state_size: size,
            date,
        })
    })
    .collect()
}

fn is_date(token: &str) -> bool {
    let b = token.as_bytes();
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
}

/// "256 MiB", "0 B", "1.5 GiB" or a bare byte count.
fn parse_size(tokens: &[&str]) -> Option<u64> {
    let (number, unit) = match tokens {
        [n] => (*n, "B"),
        [n, u] => (*n, *u),
        _ => return None,
    };
    let value: f64 = number.parse().ok()?;
    let scale: u64 = match unit {
        "B" => 1,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1 << 40,
        _ => return None,
    };
    Some((value * scale as f64).round() as u64)
}
