//! External rule store backends
//!
//! Supports an in-memory store (tests, ephemeral runs), a JSON document on
//! disk and Redis (distributed) storage.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::storage::Result;

#[cfg(feature = "redis-storage")]
use crate::storage::{SharedRedisClient, StorageError};

use super::snapshot::RuleSet;

/// Trait for durable rule storage
#[async_trait::async_trait]
pub trait RuleBackend: Send + Sync {
    /// Read the whole rule document
    async fn load(&self) -> Result<RuleSet>;

    /// Replace the stored rule document
    async fn save(&self, rules: &RuleSet) -> Result<()>;
}

/// Rule document held in process memory
pub struct InMemoryRuleBackend {
    rules: Mutex<RuleSet>,
}

impl InMemoryRuleBackend {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: Mutex::new(rules),
        }
    }

    /// Last saved document
    pub fn current(&self) -> RuleSet {
        self.rules.lock().clone()
    }
}

impl Default for InMemoryRuleBackend {
    fn default() -> Self {
        Self::new(RuleSet::default())
    }
}

#[async_trait::async_trait]
impl RuleBackend for InMemoryRuleBackend {
    async fn load(&self) -> Result<RuleSet> {
        Ok(self.rules.lock().clone())
    }

    async fn save(&self, rules: &RuleSet) -> Result<()> {
        *self.rules.lock() = rules.clone();
        Ok(())
    }
}

/// Rule document stored as pretty-printed JSON.
///
/// A missing file loads as an empty rule set.
pub struct JsonFileRuleBackend {
    path: PathBuf,
}

impl JsonFileRuleBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl RuleBackend for JsonFileRuleBackend {
    async fn load(&self) -> Result<RuleSet> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "Rule file not found, starting empty");
                Ok(RuleSet::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, rules: &RuleSet) -> Result<()> {
        let json = serde_json::to_vec_pretty(rules)?;

        // readers only ever see a complete document
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }
}

/// Redis storage for distributed rule sharing
#[cfg(feature = "redis-storage")]
pub struct RedisRuleBackend {
    client: SharedRedisClient,
}

#[cfg(feature = "redis-storage")]
impl RedisRuleBackend {
    const KEY: &'static str = "rules:document";

    pub fn from_client(client: SharedRedisClient) -> Self {
        Self { client }
    }
}

#[cfg(feature = "redis-storage")]
#[async_trait::async_trait]
impl RuleBackend for RedisRuleBackend {
    async fn load(&self) -> Result<RuleSet> {
        use redis::AsyncCommands;

        let mut conn = self.client.connection().await?;
        let document: Option<String> = conn
            .get(Self::KEY)
            .await
            .map_err(|e| StorageError::Redis(e.to_string()))?;

        match document {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(RuleSet::default()),
        }
    }

    async fn save(&self, rules: &RuleSet) -> Result<()> {
        use redis::AsyncCommands;

        let mut conn = self.client.connection().await?;
        let json = serde_json::to_string(rules)?;

        let _: () = conn
            .set(Self::KEY, json)
            .await
            .map_err(|e| StorageError::Redis(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::InterceptionPattern;

    fn sample() -> RuleSet {
        RuleSet {
            whitelist: vec!["10.0.0.1".to_string()],
            blacklist: vec!["10.0.0.2".to_string()],
            patterns: vec![InterceptionPattern::new("sqli", "DROP TABLE").with_method("POST")],
        }
    }

    #[tokio::test]
    async fn test_json_file_missing_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileRuleBackend::new(dir.path().join("rules.json"));

        let rules = backend.load().await.unwrap();
        assert_eq!(rules, RuleSet::default());
    }

    #[tokio::test]
    async fn test_json_file_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileRuleBackend::new(dir.path().join("rules.json"));

        backend.save(&sample()).await.unwrap();
        let loaded = backend.load().await.unwrap();

        assert_eq!(loaded, sample());
        assert!(!dir.path().join("rules.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let backend = JsonFileRuleBackend::new(path);
        assert!(backend.load().await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_backend() {
        let backend = InMemoryRuleBackend::default();
        backend.save(&sample()).await.unwrap();
        assert_eq!(backend.current(), sample());
        assert_eq!(backend.load().await.unwrap(), sample());
    }
}
