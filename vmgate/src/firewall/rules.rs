use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use super::{Destination, Verdict};
use crate::machine::MachineDocument;

#[derive(Debug, Error)]
pub enum RuleStoreError {
    #[error("failed to read rules from {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("invalid rule key '{key}': expected ip:port or [ipv6]:port")]
    InvalidKey { key: String },

    #[error("invalid verdict '{value}' for rule '{key}': expected allow or deny")]
    InvalidVerdict { key: String, value: String },

    #[error("failed to persist rules to {path}: {reason}")]
    Persist { path: PathBuf, reason: String },
}

/// Per-machine destination → verdict table.
///
/// Not synchronized; the firewall engine keeps it behind a reader/writer
/// lock. Each mutation re-reads the machine document, edits only the key it
/// concerns and writes the result back, so rules added by another process
/// (the CLI while the machine runs) survive. A failed write leaves memory
/// as it was.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: HashMap<Destination, Verdict>,
    document: Option<PathBuf>,
    /// Document text the table was last parsed from; `None` after a
    /// mutation rewrote it.
    seen: Option<String>,
}

impl RuleStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the `[firewall]` table of a machine document. Later mutations
    /// are written back to the same document.
    pub fn load(document: &Path) -> Result<Self, RuleStoreError> {
        let text = std::fs::read_to_string(document).map_err(|e| RuleStoreError::Load {
            path: document.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut store = Self {
            document: Some(document.to_path_buf()),
            ..Self::default()
        };
        store.reload_from(&text)?;
        debug!(path = %document.display(), rules = store.len(), "rule store loaded");
        Ok(store)
    }

    pub fn document(&self) -> Option<&Path> {
        self.document.as_deref()
    }

    /// Whether `text` is the document content the table already reflects.
    pub fn is_current(&self, text: &str) -> bool {
        self.seen.as_deref() == Some(text)
    }

    /// Replace the table with the one in `text` (a whole machine document).
    /// Returns false when nothing changed. On error the table is untouched.
    pub fn reload_from(&mut self, text: &str) -> Result<bool, RuleStoreError> {
        if self.is_current(text) {
            return Ok(false);
        }
        let path = self.document.clone().unwrap_or_default();
        let doc: MachineDocument = toml::from_str(text).map_err(|e| RuleStoreError::Load {
            path,
            reason: e.to_string(),
        })?;
        let rules = parse_table(&doc.firewall)?;
        let changed = rules != self.rules;
        self.rules = rules;
        self.seen = Some(text.to_string());
        Ok(changed)
    }

    pub fn get(&self, dest: &Destination) -> Option<Verdict> {
        self.rules.get(dest).copied()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// All rules ordered by address then port.
    pub fn list(&self) -> Vec<(Destination, Verdict)> {
        let mut out: Vec<_> = self.rules.iter().map(|(d, v)| (*d, *v)).collect();
        out.sort_by_key(|(d, _)| (d.ip, d.port));
        out
    }

    pub fn set(&mut self, dest: Destination, verdict: Verdict) -> Result<(), RuleStoreError> {
        self.commit(|table| {
            drop_key(table, &dest);
            table.insert(dest.to_string(), verdict.as_str().to_string());
        })
        .map(|_| ())
    }

    /// Returns whether a rule was present.
    pub fn remove(&mut self, dest: &Destination) -> Result<bool, RuleStoreError> {
        self.commit(|table| drop_key(table, dest))
    }

    /// Drop every rule. Returns how many there were.
    pub fn clear(&mut self) -> Result<usize, RuleStoreError> {
        self.commit(|table| {
            let count = table.len();
            table.clear();
            count
        })
    }

    /// Apply `edit` to the current on-disk table (or the in-memory one for
    /// stores without a document) and adopt the result.
    fn commit<T>(
        &mut self,
        edit: impl FnOnce(&mut BTreeMap<String, String>) -> T,
    ) -> Result<T, RuleStoreError> {
        let Some(path) = self.document.clone() else {
            let mut table = render_table(&self.rules);
            let out = edit(&mut table);
            self.rules = parse_table(&table)?;
            return Ok(out);
        };

        let persist_error = |e: anyhow::Error| RuleStoreError::Persist {
            path: path.clone(),
            reason: format!("{:#}", e),
        };
        let mut doc = MachineDocument::load(&path).map_err(persist_error)?;
        let out = edit(&mut doc.firewall);
        let rules = parse_table(&doc.firewall)?;
        doc.save(&path).map_err(persist_error)?;
        self.rules = rules;
        self.seen = None;
        Ok(out)
    }
}

/// Remove every key naming `dest`, however it was spelled. Returns whether
/// there was one.
fn drop_key(table: &mut BTreeMap<String, String>, dest: &Destination) -> bool {
    let before = table.len();
    table.retain(|key, _| key.parse::<Destination>().ok().as_ref() != Some(dest));
    table.len() != before
}

/// Parse the persisted `"ip:port" = "allow"|"deny"` table.
pub fn parse_table(
    table: &BTreeMap<String, String>,
) -> Result<HashMap<Destination, Verdict>, RuleStoreError> {
    let mut rules = HashMap::with_capacity(table.len());
    for (key, value) in table {
        let dest: Destination = key
            .parse()
            .map_err(|_| RuleStoreError::InvalidKey { key: key.clone() })?;
        let verdict: Verdict = value.parse().map_err(|_| RuleStoreError::InvalidVerdict {
            key: key.clone(),
            value: value.clone(),
        })?;
        rules.insert(dest, verdict);
    }
    Ok(rules)
}

fn render_table(rules: &HashMap<Destination, Verdict>) -> BTreeMap<String, String> {
    rules
        .iter()
        .map(|(d, v)| (d.to_string(), v.as_str().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(s: &str) -> Destination {
        s.parse().unwrap()
    }

    fn write_document(dir: &Path, firewall: &[(&str, &str)]) -> PathBuf {
        let path = dir.join("vm.toml");
        let doc = MachineDocument {
            base: PathBuf::from("/images/base.qcow2"),
            memory_mb: 1024,
            cpus: 1,
            ssh_port: 2222,
            ssh_user: "ubuntu".into(),
            proxy_port: None,
            ports: Vec::new(),
            first_boot_completed: true,
            firewall: firewall
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        doc.save(&path).unwrap();
        path
    }

    #[test]
    fn load_parses_ipv4_and_ipv6_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_document(
            dir.path(),
            &[("1.1.1.1:443", "allow"), ("[2606:4700::1111]:53", "deny")],
        );
        let store = RuleStore::load(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&dest("1.1.1.1:443")), Some(Verdict::Allow));
        assert_eq!(store.get(&dest("[2606:4700::1111]:53")), Some(Verdict::Deny));
        assert_eq!(store.get(&dest("1.1.1.1:80")), None);
    }

    #[test]
    fn load_rejects_unknown_verdict_naming_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_document(dir.path(), &[("1.1.1.1:443", "maybe")]);
        match RuleStore::load(&path) {
            Err(RuleStoreError::InvalidVerdict { key, value }) => {
                assert_eq!(key, "1.1.1.1:443");
                assert_eq!(value, "maybe");
            }
            other => panic!("expected InvalidVerdict, got {:?}", other),
        }
    }

    #[test]
    fn load_rejects_bad_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_document(dir.path(), &[("example.com:443", "allow")]);
        assert!(matches!(
            RuleStore::load(&path),
            Err(RuleStoreError::InvalidKey { .. })
        ));
    }

    #[test]
    fn mutations_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_document(dir.path(), &[]);
        let mut store = RuleStore::load(&path).unwrap();

        store.set(dest("1.1.1.1:443"), Verdict::Allow).unwrap();
        store.set(dest("[::1]:22"), Verdict::Deny).unwrap();
        let doc = MachineDocument::load(&path).unwrap();
        assert_eq!(doc.firewall.get("1.1.1.1:443").map(String::as_str), Some("allow"));
        assert_eq!(doc.firewall.get("[::1]:22").map(String::as_str), Some("deny"));
        // Other document fields survive the rewrite
        assert!(doc.first_boot_completed);

        assert!(store.remove(&dest("[::1]:22")).unwrap());
        assert!(!store.remove(&dest("[::1]:22")).unwrap());
        assert_eq!(MachineDocument::load(&path).unwrap().firewall.len(), 1);

        assert_eq!(store.clear().unwrap(), 1);
        assert!(store.is_empty());
        assert!(MachineDocument::load(&path).unwrap().firewall.is_empty());

        let reloaded = RuleStore::load(&path).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn failed_persist_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_document(dir.path(), &[]);
        let mut store = RuleStore::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let err = store.set(dest("8.8.8.8:53"), Verdict::Allow).unwrap_err();
        assert!(matches!(err, RuleStoreError::Persist { .. }));
        assert_eq!(store.get(&dest("8.8.8.8:53")), None);
    }

    #[test]
    fn stale_store_keeps_rules_written_by_another_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_document(dir.path(), &[]);
        let mut running = RuleStore::load(&path).unwrap();
        let mut cli = RuleStore::load(&path).unwrap();

        cli.set(dest("6.6.6.6:22"), Verdict::Deny).unwrap();
        running.set(dest("1.1.1.1:443"), Verdict::Allow).unwrap();

        let doc = MachineDocument::load(&path).unwrap();
        assert_eq!(doc.firewall.get("6.6.6.6:22").map(String::as_str), Some("deny"));
        assert_eq!(doc.firewall.get("1.1.1.1:443").map(String::as_str), Some("allow"));
        // The writer also picks up what it merged
        assert_eq!(running.get(&dest("6.6.6.6:22")), Some(Verdict::Deny));

        // Removal is decided against the document, not the stale copy
        assert!(cli.remove(&dest("1.1.1.1:443")).unwrap());
        assert_eq!(MachineDocument::load(&path).unwrap().firewall.len(), 1);
    }

    #[test]
    fn set_replaces_a_differently_spelled_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_document(dir.path(), &[("[2606:4700:0:0::1111]:53", "allow")]);
        let mut store = RuleStore::load(&path).unwrap();

        store.set(dest("[2606:4700::1111]:53"), Verdict::Deny).unwrap();
        let doc = MachineDocument::load(&path).unwrap();
        assert_eq!(doc.firewall.len(), 1);
        assert_eq!(doc.firewall.get("[2606:4700::1111]:53").map(String::as_str), Some("deny"));
    }

    #[test]
    fn reload_tracks_document_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_document(dir.path(), &[("1.1.1.1:443", "allow")]);
        let mut store = RuleStore::load(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(store.is_current(&text));
        assert!(!store.reload_from(&text).unwrap());

        write_document(dir.path(), &[("9.9.9.9:53", "deny")]);
        let edited = std::fs::read_to_string(&path).unwrap();
        assert!(store.reload_from(&edited).unwrap());
        assert_eq!(store.list(), vec![(dest("9.9.9.9:53"), Verdict::Deny)]);

        // A broken edit keeps the last good table
        assert!(store.reload_from("firewall = 3").is_err());
        assert_eq!(store.get(&dest("9.9.9.9:53")), Some(Verdict::Deny));
    }

    #[test]
    fn list_is_sorted() {
        let mut store = RuleStore::in_memory();
        store.set(dest("9.9.9.9:53"), Verdict::Deny).unwrap();
        store.set(dest("1.1.1.1:443"), Verdict::Allow).unwrap();
        store.set(dest("1.1.1.1:80"), Verdict::Allow).unwrap();
        let keys: Vec<String> = store.list().iter().map(|(d, _)| d.to_string()).collect();
        assert_eq!(keys, vec!["1.1.1.1:80", "1.1.1.1:443", "9.9.9.9:53"]);
    }
}
