//! Telemetry storage backends
//!
//! Traffic logs go to a fast keyed store first and a durable store second.
//! Counters live in a per-day metric store. In-memory, JSON-lines and Redis
//! (distributed) implementations are provided.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

#[cfg(feature = "redis-storage")]
use redis::AsyncCommands;

use crate::storage::Result;

#[cfg(feature = "redis-storage")]
use crate::storage::{SharedRedisClient, StorageError};

use super::record::{Counter, DailyMetricBucket, TrafficLogRecord};

/// Per-day counter storage
#[async_trait::async_trait]
pub trait MetricStore: Send + Sync {
    /// Add one to `counter` in the bucket for `date`, creating it if absent
    async fn increment(&self, date: NaiveDate, counter: Counter) -> Result<()>;

    async fn bucket(&self, date: NaiveDate) -> Result<Option<DailyMetricBucket>>;
}

/// Fast keyed log store, written before the durable store
#[async_trait::async_trait]
pub trait FastLogStore: Send + Sync {
    /// Store `record` and return its key
    async fn write_fast(&self, record: &TrafficLogRecord) -> Result<String>;

    /// Flag `key` for out-of-band reconciliation with the durable store
    async fn mark_unsynced(&self, key: &str) -> Result<()>;
}

/// Durable, queryable log store
#[async_trait::async_trait]
pub trait DurableLogStore: Send + Sync {
    async fn write_durable(&self, record: &TrafficLogRecord) -> Result<()>;

    /// Newest records first
    async fn recent(&self, limit: usize) -> Result<Vec<TrafficLogRecord>>;
}

fn log_key(seq: u64) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("log:{}:{}", nanos, seq)
}

pub struct InMemoryMetricStore {
    buckets: DashMap<NaiveDate, DailyMetricBucket>,
}

impl InMemoryMetricStore {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }
}

impl Default for InMemoryMetricStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetricStore for InMemoryMetricStore {
    async fn increment(&self, date: NaiveDate, counter: Counter) -> Result<()> {
        self.buckets
            .entry(date)
            .or_insert_with(|| DailyMetricBucket::new(date))
            .increment(counter);
        Ok(())
    }

    async fn bucket(&self, date: NaiveDate) -> Result<Option<DailyMetricBucket>> {
        Ok(self.buckets.get(&date).map(|entry| entry.value().clone()))
    }
}

#[derive(Debug, Clone)]
pub struct FastLogEntry {
    pub record: TrafficLogRecord,
    pub unsynced: bool,
}

pub struct InMemoryFastLogStore {
    entries: DashMap<String, FastLogEntry>,
    seq: AtomicU64,
}

impl InMemoryFastLogStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<FastLogEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn records(&self) -> Vec<TrafficLogRecord> {
        self.entries.iter().map(|entry| entry.record.clone()).collect()
    }

    pub fn unsynced_keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.unsynced)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for InMemoryFastLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FastLogStore for InMemoryFastLogStore {
    async fn write_fast(&self, record: &TrafficLogRecord) -> Result<String> {
        let key = log_key(self.seq.fetch_add(1, Ordering::Relaxed));
        self.entries.insert(
            key.clone(),
            FastLogEntry {
                record: record.clone(),
                unsynced: false,
            },
        );
        Ok(key)
    }

    async fn mark_unsynced(&self, key: &str) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.unsynced = true;
        }
        Ok(())
    }
}

pub struct InMemoryDurableLogStore {
    records: Mutex<Vec<TrafficLogRecord>>,
}

impl InMemoryDurableLogStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// All records in arrival order
    pub fn records(&self) -> Vec<TrafficLogRecord> {
        self.records.lock().clone()
    }
}

impl Default for InMemoryDurableLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DurableLogStore for InMemoryDurableLogStore {
    async fn write_durable(&self, record: &TrafficLogRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<TrafficLogRecord>> {
        let records = self.records.lock();
        Ok(records.iter().rev().take(limit).cloned().collect())
    }
}

/// Append-only JSON-lines file
pub struct JsonLinesLogStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesLogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait::async_trait]
impl DurableLogStore for JsonLinesLogStore {
    async fn write_durable(&self, record: &TrafficLogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<TrafficLogRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let records = contents
            .lines()
            .rev()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable traffic log line");
                    None
                }
            })
            .take(limit)
            .collect();

        Ok(records)
    }
}

/// Redis fast store: one key per record plus a set of unsynced keys
#[cfg(feature = "redis-storage")]
pub struct RedisFastLogStore {
    client: SharedRedisClient,
    seq: AtomicU64,
}

#[cfg(feature = "redis-storage")]
impl RedisFastLogStore {
    const UNSYNCED_SET: &'static str = "logs:unsynced";

    pub fn from_client(client: SharedRedisClient) -> Self {
        Self {
            client,
            seq: AtomicU64::new(0),
        }
    }
}

#[cfg(feature = "redis-storage")]
#[async_trait::async_trait]
impl FastLogStore for RedisFastLogStore {
    async fn write_fast(&self, record: &TrafficLogRecord) -> Result<String> {
        let mut conn = self.client.connection().await?;
        let key = log_key(self.seq.fetch_add(1, Ordering::Relaxed));
        let json = serde_json::to_string(record)?;

        let _: () = conn
            .set(&key, json)
            .await
            .map_err(|e| StorageError::Redis(e.to_string()))?;

        Ok(key)
    }

    async fn mark_unsynced(&self, key: &str) -> Result<()> {
        let mut conn = self.client.connection().await?;

        let _: () = conn
            .sadd(Self::UNSYNCED_SET, key)
            .await
            .map_err(|e| StorageError::Redis(e.to_string()))?;

        Ok(())
    }
}

/// Redis metrics: one hash per day, one field per counter
#[cfg(feature = "redis-storage")]
pub struct RedisMetricStore {
    client: SharedRedisClient,
}

#[cfg(feature = "redis-storage")]
impl RedisMetricStore {
    pub fn from_client(client: SharedRedisClient) -> Self {
        Self { client }
    }

    fn bucket_key(date: NaiveDate) -> String {
        format!("metrics:{}", date.format("%Y-%m-%d"))
    }
}

#[cfg(feature = "redis-storage")]
#[async_trait::async_trait]
impl MetricStore for RedisMetricStore {
    async fn increment(&self, date: NaiveDate, counter: Counter) -> Result<()> {
        let mut conn = self.client.connection().await?;

        let _: () = conn
            .hincr(Self::bucket_key(date), counter.as_str(), 1)
            .await
            .map_err(|e| StorageError::Redis(e.to_string()))?;

        Ok(())
    }

    async fn bucket(&self, date: NaiveDate) -> Result<Option<DailyMetricBucket>> {
        let mut conn = self.client.connection().await?;

        let fields: std::collections::HashMap<String, u64> = conn
            .hgetall(Self::bucket_key(date))
            .await
            .map_err(|e| StorageError::Redis(e.to_string()))?;

        if fields.is_empty() {
            return Ok(None);
        }

        let mut bucket = DailyMetricBucket::new(date);
        for counter in [
            Counter::WebsiteRequests,
            Counter::BlockedByBlacklist,
            Counter::BlockedByRules,
        ] {
            bucket.add(counter, fields.get(counter.as_str()).copied().unwrap_or(0));
        }

        Ok(Some(bucket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_metrics_create_bucket() {
        let store = InMemoryMetricStore::new();
        assert!(store.bucket(day()).await.unwrap().is_none());

        store.increment(day(), Counter::BlockedByRules).await.unwrap();
        store.increment(day(), Counter::BlockedByRules).await.unwrap();

        let bucket = store.bucket(day()).await.unwrap().unwrap();
        assert_eq!(bucket.blocked_by_rules_total, 2);
        assert_eq!(bucket.website_requests_total, 0);
    }

    #[tokio::test]
    async fn test_fast_store_keys_are_unique() {
        let store = InMemoryFastLogStore::new();
        let record = TrafficLogRecord::success("1.1.1.1", "t");

        let a = store.write_fast(&record).await.unwrap();
        let b = store.write_fast(&record).await.unwrap();

        assert_ne!(a, b);
        assert!(a.starts_with("log:"));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_fast_store_mark_unsynced() {
        let store = InMemoryFastLogStore::new();
        let key = store
            .write_fast(&TrafficLogRecord::success("1.1.1.1", "t"))
            .await
            .unwrap();

        assert!(store.unsynced_keys().is_empty());
        store.mark_unsynced(&key).await.unwrap();
        assert_eq!(store.unsynced_keys(), vec![key.clone()]);
        assert!(store.get(&key).unwrap().unsynced);
    }

    #[tokio::test]
    async fn test_json_lines_append_and_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesLogStore::new(dir.path().join("traffic.jsonl"));

        assert!(store.recent(10).await.unwrap().is_empty());

        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            store
                .write_durable(&TrafficLogRecord::success(ip, "t"))
                .await
                .unwrap();
        }

        let recent = store.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].client_ip, "3.3.3.3");
        assert_eq!(recent[1].client_ip, "2.2.2.2");
    }

    #[tokio::test]
    async fn test_json_lines_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic.jsonl");
        let store = JsonLinesLogStore::new(&path);

        store
            .write_durable(&TrafficLogRecord::success("1.1.1.1", "t"))
            .await
            .unwrap();
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{ truncated\n");
        std::fs::write(&path, contents).unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_durable_recent_order() {
        let store = InMemoryDurableLogStore::new();
        for ip in ["a", "b", "c"] {
            store
                .write_durable(&TrafficLogRecord::success(ip, "t"))
                .await
                .unwrap();
        }

        let recent = store.recent(5).await.unwrap();
        let ips: Vec<_> = recent.iter().map(|r| r.client_ip.as_str()).collect();
        assert_eq!(ips, vec!["c", "b", "a"]);
    }
}
