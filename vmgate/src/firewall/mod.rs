//! Per-machine outbound firewall.
//!
//! [`FirewallEngine::decide`] answers allow/deny for one destination. The
//! order is fixed and the first hit wins:
//!
//! 1. the machine's [`RuleStore`] (exact ip:port, re-read when the machine
//!    document changes),
//! 2. the process-wide [`DefaultAllowList`] (never copied into rules),
//!    matched against the name the guest connected to, else the domain the
//!    guest's [`Enricher`] reports, else a reverse lookup,
//! 3. the [`ApprovalGateway`], whose answer is persisted. A timeout counts
//!    as a persisted deny; a gateway error denies without persisting.
//!
//! Locking: the rule store sits behind a `RwLock` (read-mostly). Prompts are
//! serialized by `prompt_lock`, so a human never sees two questions for one
//! machine at once. Callers racing on the same unknown destination share a
//! `OnceCell` from `in_flight`; only the first one prompts. Neither lock is
//! held while the other is acquired except `prompt_lock` → `rules`.

pub mod approval;
pub mod defaults;
pub mod enrich;
pub mod pool;
pub mod rules;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, error, info, instrument, warn};

pub use approval::{ApprovalGateway, ApprovalRequest, CommandGateway, StaticGateway};
pub use defaults::DefaultAllowList;
pub use enrich::{Enricher, Enrichment, GuestEnricher};
pub use pool::DecisionPool;
pub use rules::{RuleStore, RuleStoreError};

use crate::resolver::Resolver;

/// Size of the per-machine ring of recent decisions.
pub const RECENT_CONNECTIONS: usize = 20;

/// A TCP destination. Rule identity is exactly this pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub ip: IpAddr,
    pub port: u16,
}

impl Destination {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

/// `1.2.3.4:443` or `[2001:db8::1]:443`; also the persisted rule key.
impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Serialized as its rule key.
impl Serialize for Destination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for Destination {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<SocketAddr>().map(Self::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown verdict '{0}': expected allow or deny")]
pub struct VerdictParseError(pub String);

impl FromStr for Verdict {
    type Err = VerdictParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Verdict::Allow),
            "deny" => Ok(Verdict::Deny),
            other => Err(VerdictParseError(other.to_string())),
        }
    }
}

/// Which step of the decision order produced a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Rule,
    DefaultList { suffix: String },
    Approval { persisted: bool },
    Timeout { persisted: bool },
    GatewayError,
    AllowAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub origin: Origin,
}

impl Decision {
    pub fn new(verdict: Verdict, origin: Origin) -> Self {
        Self { verdict, origin }
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Enforce,
    /// Everything allowed, nothing persisted, no prompts.
    AllowAll,
}

/// One entry of the recent-decisions ring.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub at: DateTime<Utc>,
    pub destination: Destination,
    pub hostname: Option<String>,
    pub process_name: Option<String>,
    pub verdict: Verdict,
}

/// Well-known service for a port, shown to whoever approves.
pub fn service_name(port: u16) -> Option<&'static str> {
    Some(match port {
        20 => "FTP Data",
        21 => "FTP",
        22 => "SSH",
        23 => "Telnet",
        25 => "SMTP",
        53 => "DNS",
        80 => "HTTP",
        110 => "POP3",
        143 => "IMAP",
        443 => "HTTPS",
        465 => "SMTPS",
        587 => "SMTP Submission",
        993 => "IMAPS",
        995 => "POP3S",
        3306 => "MySQL",
        5432 => "PostgreSQL",
        6379 => "Redis",
        8080 => "HTTP Proxy",
        8443 => "HTTPS Alt",
        27017 => "MongoDB",
        _ => return None,
    })
}

pub struct FirewallEngine {
    machine: String,
    mode: Mode,
    rules: RwLock<RuleStore>,
    defaults: Arc<DefaultAllowList>,
    gateway: Arc<dyn ApprovalGateway>,
    resolver: Arc<dyn Resolver>,
    enricher: Option<Arc<dyn Enricher>>,
    approval_timeout: Duration,
    /// Machine document the rules come from, re-read before each lookup.
    document: Option<PathBuf>,
    prompt_lock: Mutex<()>,
    in_flight: StdMutex<HashMap<Destination, Arc<OnceCell<Decision>>>>,
    recent: StdMutex<VecDeque<ConnectionRecord>>,
}

impl FirewallEngine {
    pub fn new(
        machine: impl Into<String>,
        mode: Mode,
        rules: RuleStore,
        defaults: Arc<DefaultAllowList>,
        gateway: Arc<dyn ApprovalGateway>,
        resolver: Arc<dyn Resolver>,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            machine: machine.into(),
            mode,
            document: rules.document().map(Path::to_path_buf),
            rules: RwLock::new(rules),
            defaults,
            gateway,
            resolver,
            enricher: None,
            approval_timeout,
            prompt_lock: Mutex::new(()),
            in_flight: StdMutex::new(HashMap::new()),
            recent: StdMutex::new(VecDeque::with_capacity(RECENT_CONNECTIONS)),
        }
    }

    /// Ask `enricher` about every destination that reaches a lookup.
    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// Decision that needs neither a lookup nor a prompt: allow-all mode or
    /// an existing rule. Cheap enough to run on the proxy's event loop.
    pub async fn cached(&self, dest: &Destination, hostname: Option<&str>) -> Option<Decision> {
        let decision = match self.mode {
            Mode::AllowAll => Decision::new(Verdict::Allow, Origin::AllowAll),
            Mode::Enforce => {
                self.refresh_rules().await;
                let verdict = self.rules.read().await.get(dest)?;
                Decision::new(verdict, Origin::Rule)
            }
        };
        self.record(*dest, hostname.map(str::to_string), None, &decision);
        Some(decision)
    }

    /// Full decision. May wait for a reverse lookup and for a human.
    #[instrument(skip(self), fields(machine = %self.machine))]
    pub async fn decide(&self, dest: Destination, hostname: Option<String>) -> Decision {
        if let Some(decision) = self.cached(&dest, hostname.as_deref()).await {
            debug!(verdict = %decision.verdict, origin = ?decision.origin, "decided without prompt");
            return decision;
        }

        let enrichment = match &self.enricher {
            Some(enricher) => enricher.enrich(&dest).await,
            None => Enrichment::default(),
        };
        let supplied = hostname.is_some();
        let mut hostname = hostname.or_else(|| enrichment.domain.clone());
        if let Some(decision) = self.default_allowed(&dest, hostname.as_deref()) {
            self.record(dest, hostname, enrichment.process_name, &decision);
            return decision;
        }
        if !supplied {
            if let Some(name) = self.resolver.reverse(dest.ip).await {
                if let Some(decision) = self.default_allowed(&dest, Some(&name)) {
                    self.record(dest, Some(name), enrichment.process_name, &decision);
                    return decision;
                }
                if hostname.is_none() {
                    hostname = Some(name);
                }
            }
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            in_flight.entry(dest).or_default().clone()
        };
        let decision = cell
            .get_or_init(|| self.ask(dest, hostname.clone(), &enrichment))
            .await
            .clone();
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if in_flight.get(&dest).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                in_flight.remove(&dest);
            }
        }

        self.record(dest, hostname, enrichment.process_name, &decision);
        decision
    }

    fn default_allowed(&self, dest: &Destination, hostname: Option<&str>) -> Option<Decision> {
        let host = hostname?;
        let suffix = self.defaults.matches(host)?;
        debug!(%dest, hostname = host, suffix, "allowed by default list");
        Some(Decision::new(
            Verdict::Allow,
            Origin::DefaultList {
                suffix: suffix.to_string(),
            },
        ))
    }

    /// Adopt rule edits made to the machine document by other processes.
    async fn refresh_rules(&self) {
        let Some(path) = &self.document else {
            return;
        };
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) => {
                debug!(machine = %self.machine, error = %e, "machine document unreadable, keeping rules");
                return;
            }
        };
        if self.rules.read().await.is_current(&text) {
            return;
        }
        match self.rules.write().await.reload_from(&text) {
            Ok(true) => info!(machine = %self.machine, "firewall rules reloaded from document"),
            Ok(false) => {}
            Err(e) => warn!(machine = %self.machine, error = %e, "ignoring invalid rule edit"),
        }
    }

    async fn ask(
        &self,
        dest: Destination,
        hostname: Option<String>,
        enrichment: &Enrichment,
    ) -> Decision {
        let _prompt = self.prompt_lock.lock().await;

        // Answered while we queued for the prompt.
        if let Some(verdict) = self.rules.read().await.get(&dest) {
            return Decision::new(verdict, Origin::Rule);
        }

        let request = ApprovalRequest {
            machine: self.machine.clone(),
            destination: dest,
            hostname,
            process_name: enrichment.process_name.clone(),
            process_pid: enrichment.process_pid,
            service: service_name(dest.port),
            recent: self.recent(),
            timeout: self.approval_timeout,
        };
        info!(
            machine = %self.machine,
            %dest,
            hostname = request.hostname.as_deref().unwrap_or("-"),
            process = request.process_name.as_deref().unwrap_or("-"),
            service = request.service.unwrap_or("-"),
            "asking for approval"
        );

        match tokio::time::timeout(self.approval_timeout, self.gateway.approve(&request)).await {
            Ok(Ok(verdict)) => {
                let persisted = self.persist(dest, verdict).await;
                Decision::new(verdict, Origin::Approval { persisted })
            }
            Ok(Err(e)) => {
                let error = format!("{:#}", e);
                warn!(machine = %self.machine, %dest, %error, "approval gateway failed, denying");
                Decision::new(Verdict::Deny, Origin::GatewayError)
            }
            Err(_) => {
                warn!(
                    machine = %self.machine,
                    %dest,
                    timeout_secs = self.approval_timeout.as_secs(),
                    "approval timed out, denying"
                );
                let persisted = self.persist(dest, Verdict::Deny).await;
                Decision::new(Verdict::Deny, Origin::Timeout { persisted })
            }
        }
    }

    async fn persist(&self, dest: Destination, verdict: Verdict) -> bool {
        match self.rules.write().await.set(dest, verdict) {
            Ok(()) => true,
            Err(e) => {
                error!(machine = %self.machine, %dest, %verdict, error = %e, "firewall rule not persisted");
                false
            }
        }
    }

    fn record(
        &self,
        destination: Destination,
        hostname: Option<String>,
        process_name: Option<String>,
        decision: &Decision,
    ) {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == RECENT_CONNECTIONS {
            recent.pop_front();
        }
        recent.push_back(ConnectionRecord {
            at: Utc::now(),
            destination,
            hostname,
            process_name,
            verdict: decision.verdict,
        });
    }

    /// Recent decisions, oldest first.
    pub fn recent(&self) -> Vec<ConnectionRecord> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub async fn rules(&self) -> Vec<(Destination, Verdict)> {
        self.rules.read().await.list()
    }

    pub async fn set_rule(&self, dest: Destination, verdict: Verdict) -> Result<(), RuleStoreError> {
        self.rules.write().await.set(dest, verdict)
    }

    pub async fn remove_rule(&self, dest: &Destination) -> Result<bool, RuleStoreError> {
        self.rules.write().await.remove(dest)
    }

    pub async fn clear_rules(&self) -> Result<usize, RuleStoreError> {
        self.rules.write().await.clear()
    }
}
