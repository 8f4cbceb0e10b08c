//! Rule store shared by every connection task
//!
//! Holds the current `RuleSnapshot` behind a reader/writer guard. Readers copy
//! the `Arc` out and release the guard before doing any regex work. Writers
//! build the next snapshot off to the side, swap it in, then hand the new
//! document to a background persister so the external store sees changes in
//! mutation order. The in-memory snapshot stays authoritative when a persist
//! fails.

pub mod backend;
pub mod snapshot;

pub use backend::{InMemoryRuleBackend, JsonFileRuleBackend, RuleBackend};
#[cfg(feature = "redis-storage")]
pub use backend::RedisRuleBackend;
pub use snapshot::{
    normalize_ip, CompiledPattern, InterceptionPattern, IpClassification, IpStatus, RuleSet,
    RuleSnapshot,
};

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::filter::{inspection, InspectedRequest};
use crate::storage::StorageError;

/// Error type for rule mutations
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Invalid IP address: {0}")]
    InvalidIp(String),

    #[error("Unknown IP rule type: {0}. Expected 'whitelist' or 'blacklist'")]
    UnknownClassification(String),

    #[error("Interception pattern already exists: {0}")]
    DuplicatePattern(String),

    #[error("Rule backend error: {0}")]
    Backend(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, RuleError>;

enum PersistCommand {
    Save(RuleSet),
    Flush(oneshot::Sender<()>),
}

/// Concurrency-safe owner of the current rule snapshot
pub struct RuleStore {
    current: RwLock<Arc<RuleSnapshot>>,
    writer: Mutex<()>,
    backend: Arc<dyn RuleBackend>,
    persist_tx: mpsc::UnboundedSender<PersistCommand>,
}

impl RuleStore {
    /// Load the initial snapshot from `backend` and start the persister.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn load(backend: Arc<dyn RuleBackend>) -> Result<Self> {
        let rules = backend.load().await?;
        let snapshot = RuleSnapshot::from_rule_set(rules);

        info!(
            whitelist = snapshot.whitelist().len(),
            blacklist = snapshot.blacklist().len(),
            patterns = snapshot.patterns().len(),
            "Rules loaded"
        );

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_worker(backend.clone(), persist_rx));

        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
            backend,
            persist_tx,
        })
    }

    /// Convenience constructor backed by an in-memory store seeded with `rules`
    pub async fn in_memory(rules: RuleSet) -> Result<Self> {
        Self::load(Arc::new(InMemoryRuleBackend::new(rules))).await
    }

    /// Current snapshot; the read guard is released before returning
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.current.read().clone()
    }

    /// Current rules in the external document schema
    pub fn rule_set(&self) -> RuleSet {
        self.snapshot().to_rule_set()
    }

    pub fn ip_status(&self, ip: &str) -> IpStatus {
        match normalize_ip(ip) {
            Some(ip) => self.snapshot().classify(&ip),
            None => IpStatus::Neutral,
        }
    }

    /// `(allowed, in_whitelist)`: blacklisted addresses always yield
    /// `(false, false)`, whitelisted `(true, true)`, anything else
    /// `(true, false)`.
    pub fn is_ip_allowed(&self, ip: &str) -> (bool, bool) {
        self.ip_status(ip).as_pair()
    }

    /// `true` when no pattern in `snapshot` matches the request
    pub fn check_request(&self, request: &InspectedRequest, snapshot: &RuleSnapshot) -> bool {
        inspection::first_match(request, snapshot).is_none()
    }

    pub fn ip_rule(&self, ip: &str) -> Option<IpClassification> {
        let ip = normalize_ip(ip)?;
        self.snapshot().ip_rule(&ip)
    }

    pub fn pattern(&self, name: &str) -> Option<InterceptionPattern> {
        self.snapshot().pattern(name).map(|p| p.pattern().clone())
    }

    /// Put `ip` on one list, removing it from the other
    pub fn add_ip_rule(&self, ip: &str, classification: IpClassification) -> Result<()> {
        let ip = normalize_ip(ip).ok_or_else(|| RuleError::InvalidIp(ip.to_string()))?;

        self.mutate(|current| Ok(Some(current.with_ip_rule(ip, classification))))?;
        Ok(())
    }

    /// Remove `ip` from both lists. Returns whether anything was removed.
    pub fn delete_ip_rule(&self, ip: &str) -> Result<bool> {
        let ip = normalize_ip(ip).ok_or_else(|| RuleError::InvalidIp(ip.to_string()))?;
        self.mutate(|current| Ok(current.without_ip_rule(&ip)))
    }

    /// Append a pattern. Names are unique; a malformed regex is accepted and
    /// skipped during inspection.
    pub fn add_pattern(&self, pattern: InterceptionPattern) -> Result<()> {
        self.mutate(|current| {
            if current.pattern(&pattern.name).is_some() {
                return Err(RuleError::DuplicatePattern(pattern.name.clone()));
            }
            Ok(Some(current.with_pattern(pattern)))
        })?;
        Ok(())
    }

    /// Remove the pattern called `name`. Returns whether it existed.
    pub fn delete_pattern(&self, name: &str) -> Result<bool> {
        self.mutate(|current| Ok(current.without_pattern(name)))
    }

    /// Replace the snapshot with the backend's current document
    pub async fn reload(&self) -> Result<()> {
        let rules = self.backend.load().await?;
        let snapshot = RuleSnapshot::from_rule_set(rules);

        let _writer = self.writer.lock();
        *self.current.write() = Arc::new(snapshot);
        info!("Rules reloaded from backend");
        Ok(())
    }

    /// Wait until every mutation made so far has been handed to the backend
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.persist_tx.send(PersistCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn mutate<F>(&self, build: F) -> Result<bool>
    where
        F: FnOnce(&RuleSnapshot) -> Result<Option<RuleSnapshot>>,
    {
        let _writer = self.writer.lock();

        let current = self.snapshot();
        let Some(next) = build(&current)? else {
            return Ok(false);
        };
        let document = next.to_rule_set();

        *self.current.write() = Arc::new(next);

        if self.persist_tx.send(PersistCommand::Save(document)).is_err() {
            warn!("Rule persister stopped, change kept in memory only");
        }

        Ok(true)
    }
}

async fn persist_worker(
    backend: Arc<dyn RuleBackend>,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            PersistCommand::Save(rules) => {
                if let Err(e) = backend.save(&rules).await {
                    error!(error = %e, "Failed to persist rules, in-memory rules remain active");
                }
            }
            PersistCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
