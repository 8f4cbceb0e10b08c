//! Traffic telemetry
//!
//! Connection tasks hand finished records to a background worker through an
//! unbounded channel and never wait on storage. For each record the worker
//! bumps the matching daily counter, writes the fast store, then the durable
//! store. A durable failure marks the fast-store key as unsynced. Storage
//! errors are logged and absorbed.

pub mod record;
pub mod store;

pub use record::{Counter, DailyMetricBucket, TrafficLogRecord, TrafficStatus};
pub use store::{
    DurableLogStore, FastLogStore, InMemoryDurableLogStore, InMemoryFastLogStore,
    InMemoryMetricStore, JsonLinesLogStore, MetricStore,
};
#[cfg(feature = "redis-storage")]
pub use store::{RedisFastLogStore, RedisMetricStore};

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// What happened to one request or connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    BlockedBlacklist,
    BlockedRule,
    Failed,
}

impl Outcome {
    /// Daily counter bumped for this outcome. Failures are logged only.
    pub fn counter(&self) -> Option<Counter> {
        match self {
            Outcome::Success => Some(Counter::WebsiteRequests),
            Outcome::BlockedBlacklist => Some(Counter::BlockedByBlacklist),
            Outcome::BlockedRule => Some(Counter::BlockedByRules),
            Outcome::Failed => None,
        }
    }
}

/// Storage handles used by the telemetry worker
#[derive(Clone)]
pub struct TelemetryStores {
    pub metrics: Arc<dyn MetricStore>,
    pub fast: Arc<dyn FastLogStore>,
    pub durable: Arc<dyn DurableLogStore>,
}

impl TelemetryStores {
    pub fn in_memory() -> Self {
        Self {
            metrics: Arc::new(InMemoryMetricStore::new()),
            fast: Arc::new(InMemoryFastLogStore::new()),
            durable: Arc::new(InMemoryDurableLogStore::new()),
        }
    }
}

enum Command {
    Record(Outcome, TrafficLogRecord),
    Flush(oneshot::Sender<()>),
}

/// Cheap-to-clone handle onto the telemetry worker
#[derive(Clone)]
pub struct Telemetry {
    tx: mpsc::UnboundedSender<Command>,
}

impl Telemetry {
    /// Start the worker. Must be called from within a tokio runtime.
    pub fn spawn(stores: TelemetryStores) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(stores, rx));
        Self { tx }
    }

    /// Queue `record`; never blocks the caller
    pub fn record(&self, outcome: Outcome, record: TrafficLogRecord) {
        if self.tx.send(Command::Record(outcome, record)).is_err() {
            warn!("Telemetry worker stopped, record dropped");
        }
    }

    /// Wait until every record queued so far has been processed
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn worker(stores: TelemetryStores, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(outcome, record) => process(&stores, outcome, &record).await,
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn process(stores: &TelemetryStores, outcome: Outcome, record: &TrafficLogRecord) {
    if let Some(counter) = outcome.counter() {
        if let Err(e) = stores.metrics.increment(record.day(), counter).await {
            error!(counter = counter.as_str(), error = %e, "Failed to update daily counter");
        }
    }

    let key = match stores.fast.write_fast(record).await {
        Ok(key) => Some(key),
        Err(e) => {
            error!(error = %e, "Failed to write traffic log to fast store");
            None
        }
    };

    match stores.durable.write_durable(record).await {
        Ok(()) => debug!(client_ip = %record.client_ip, status = %record.status, "Traffic logged"),
        Err(e) => {
            error!(error = %e, "Failed to write traffic log to durable store");
            if let Some(key) = key {
                if let Err(e) = stores.fast.mark_unsynced(&key).await {
                    error!(key = %key, error = %e, "Failed to mark traffic log as unsynced");
                }
            }
        }
    }
}
