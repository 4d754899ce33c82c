use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::snapshot::{SnapshotInfo, SnapshotKind};

/// Wrapper around the `qemu-img` utility: overlays and disk-only
/// (internal qcow2) snapshots of a stopped machine.
#[derive(Debug, Clone)]
pub struct QemuImg {
    program: PathBuf,
    /// Arguments placed before every subcommand.
    leading_args: Vec<String>,
}

impl QemuImg {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Run `program leading_args... <subcommand>`; lets a shell stand in
    /// for the real binary.
    pub fn with_args(program: impl Into<PathBuf>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// Create a qcow2 overlay at `disk` backed by `base`.
    pub async fn create_overlay(&self, base: &Path, disk: &Path) -> Result<()> {
        let base = base.to_string_lossy();
        let disk = disk.to_string_lossy();
        self.run(&["create", "-f", "qcow2", "-b", &base, "-F", "qcow2", &disk])
            .await
            .map(|_| ())
    }

    pub async fn snapshot_create(&self, disk: &Path, name: &str) -> Result<()> {
        self.snapshot("-c", disk, name).await
    }

    /// Apply a snapshot to the disk. The machine must be stopped.
    pub async fn snapshot_apply(&self, disk: &Path, name: &str) -> Result<()> {
        self.snapshot("-a", disk, name).await
    }

    pub async fn snapshot_delete(&self, disk: &Path, name: &str) -> Result<()> {
        self.snapshot("-d", disk, name).await
    }

    /// Snapshots recorded in the image. `-U` allows reading while a
    /// running machine holds the image lock.
    pub async fn snapshot_list(&self, disk: &Path) -> Result<Vec<SnapshotInfo>> {
        let disk = disk.to_string_lossy();
        let output = self.run(&["info", "--output=json", "-U", &disk]).await?;
        parse_image_info(&output)
    }

    async fn snapshot(&self, flag: &str, disk: &Path, name: &str) -> Result<()> {
        let disk = disk.to_string_lossy();
        self.run(&["snapshot", flag, name, &disk]).await.map(|_| ())
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(program = %self.program.display(), ?args, "running qemu-img");
        let output = tokio::process::Command::new(&self.program)
            .args(&self.leading_args)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "qemu-img {} failed ({}): {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Deserialize)]
struct ImageInfo {
    #[serde(default)]
    snapshots: Vec<ImageSnapshot>,
}

#[derive(Deserialize)]
struct ImageSnapshot {
    name: String,
    #[serde(rename = "vm-state-size", default)]
    vm_state_size: u64,
    #[serde(rename = "date-sec")]
    date_sec: Option<i64>,
}

/// Parse `qemu-img info --output=json`. A snapshot that carries VM state
/// was taken live.
fn parse_image_info(json: &str) -> Result<Vec<SnapshotInfo>> {
    let info: ImageInfo = serde_json::from_str(json).context("parsing qemu-img info output")?;
    Ok(info
        .snapshots
        .into_iter()
        .map(|s| SnapshotInfo {
            kind: if s.vm_state_size > 0 {
                SnapshotKind::Live
            } else {
                SnapshotKind::Offline
            },
            name: s.name,
            vm_state_size: Some(s.vm_state_size),
            date: s
                .date_sec
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string()),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A qemu-img stand-in that logs its arguments and prints `stdout`.
    fn fake(dir: &Path, stdout: &str, exit: i32) -> QemuImg {
        let log = dir.join("calls.log");
        let script = format!(
            "echo \"$@\" >> '{}'; printf '%s' '{}'; echo 'qemu-img: boom' >&2; exit {}",
            log.display(),
            stdout,
            exit
        );
        QemuImg::with_args("/bin/sh", vec!["-c".into(), script, "qemu-img".into()])
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn overlay_and_snapshot_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let img = fake(dir.path(), "", 0);
        let disk = Path::new("/vms/dev/disk.qcow2");

        img.create_overlay(Path::new("/images/base.qcow2"), disk)
            .await
            .unwrap();
        img.snapshot_create(disk, "s1").await.unwrap();
        img.snapshot_apply(disk, "s1").await.unwrap();
        img.snapshot_delete(disk, "s1").await.unwrap();

        assert_eq!(
            calls(dir.path()),
            vec![
                "create -f qcow2 -b /images/base.qcow2 -F qcow2 /vms/dev/disk.qcow2",
                "snapshot -c s1 /vms/dev/disk.qcow2",
                "snapshot -a s1 /vms/dev/disk.qcow2",
                "snapshot -d s1 /vms/dev/disk.qcow2",
            ]
        );
    }

    #[tokio::test]
    async fn failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let img = fake(dir.path(), "", 1);
        let err = img
            .snapshot_apply(Path::new("/vms/dev/disk.qcow2"), "s1")
            .await
            .unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("qemu-img snapshot failed"));
        assert!(msg.contains("boom"));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let img = QemuImg::new("/nonexistent/qemu-img");
        assert!(img
            .create_overlay(Path::new("/a"), Path::new("/b"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn list_runs_info_with_force_share() {
        let dir = tempfile::tempdir().unwrap();
        let img = fake(dir.path(), r#"{"filename": "disk.qcow2"}"#, 0);
        let snapshots = img
            .snapshot_list(Path::new("/vms/dev/disk.qcow2"))
            .await
            .unwrap();
        assert!(snapshots.is_empty());
        assert_eq!(
            calls(dir.path()),
            vec!["info --output=json -U /vms/dev/disk.qcow2"]
        );
    }

    #[test]
    fn parse_info_kinds_and_dates() {
        let json = r#"{
            "filename": "disk.qcow2",
            "format": "qcow2",
            "snapshots": [
                {"id": "1", "name": "clean", "vm-state-size": 0, "date-sec": 1700000000, "date-nsec": 0, "vm-clock-sec": 0, "vm-clock-nsec": 0},
                {"id": "2", "name": "warm", "vm-state-size": 268435456, "date-sec": 1700003600, "date-nsec": 0, "vm-clock-sec": 12, "vm-clock-nsec": 0}
            ]
        }"#;
        let snaps = parse_image_info(json).unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].name, "clean");
        assert_eq!(snaps[0].kind, SnapshotKind::Offline);
        assert_eq!(snaps[0].date.as_deref(), Some("2023-11-14 22:13:20"));
        assert_eq!(snaps[1].kind, SnapshotKind::Live);
        assert_eq!(snaps[1].vm_state_size, Some(268435456));
    }

    #[test]
    fn parse_info_rejects_garbage() {
        assert!(parse_image_info("qemu-img: Could not open").is_err());
    }
}
