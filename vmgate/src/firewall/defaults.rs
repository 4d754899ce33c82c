use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Domains every machine may reach without a prompt: distribution mirrors,
/// language package registries and source hosting.
pub const BUILTIN_DOMAINS: &[&str] = &[
    "archive.ubuntu.com",
    "security.ubuntu.com",
    "ports.ubuntu.com",
    "canonical.com",
    "ubuntu.com",
    "launchpad.net",
    "debian.org",
    "deb.nodesource.com",
    "dl.google.com",
    "packages.microsoft.com",
    "download.docker.com",
    "github.com",
    "githubusercontent.com",
    "pypi.org",
    "files.pythonhosted.org",
    "npmjs.org",
    "registry.npmjs.org",
];

/// Process-wide list of allowed domain suffixes. Read-only once loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultAllowList {
    suffixes: Vec<String>,
}

impl DefaultAllowList {
    pub fn builtin() -> Self {
        Self::from_entries(BUILTIN_DOMAINS.iter().copied())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse the file format: one suffix per line, `#` comments and blank
    /// lines ignored.
    pub fn parse(text: &str) -> Self {
        Self::from_entries(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#')),
        )
    }

    fn from_entries<'a>(entries: impl Iterator<Item = &'a str>) -> Self {
        let mut suffixes: Vec<String> = Vec::new();
        for entry in entries {
            let entry = normalize(entry);
            if !entry.is_empty() && !suffixes.contains(&entry) {
                suffixes.push(entry);
            }
        }
        Self { suffixes }
    }

    /// Load `path`, writing the built-in list there first if it does not
    /// exist yet.
    pub fn load_or_seed(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            std::fs::write(path, render_builtin())
                .with_context(|| format!("writing default allow list: {}", path.display()))?;
            info!(path = %path.display(), "seeded default allow list");
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading default allow list: {}", path.display()))?;
        let list = Self::parse(&text);
        debug!(entries = list.len(), "default allow list loaded");
        Ok(list)
    }

    /// The entry `host` falls under, if any. `host` must equal the entry or
    /// end with `.` + entry; `evilgithub.com` does not match `github.com`.
    pub fn matches(&self, host: &str) -> Option<&str> {
        let host = normalize(host);
        if host.is_empty() {
            return None;
        }
        self.suffixes
            .iter()
            .find(|suffix| {
                host == **suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            })
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.suffixes.iter().map(String::as_str)
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn render_builtin() -> String {
    let mut out = String::from(
        "# Domains reachable from every machine without approval.\n\
         # One suffix per line; subdomains match too.\n",
    );
    for domain in BUILTIN_DOMAINS {
        out.push_str(domain);
        out.push('\n');
    }
    out
}
