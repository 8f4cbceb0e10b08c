//! Stone firewall - Entry point

use std::net::SocketAddr;
use std::sync::Arc;

use stone_firewall::config::{Config, RuleStorageType, StorageType};
use stone_firewall::decoy::DecoyResponder;
use stone_firewall::error::{FirewallError, Result};
use stone_firewall::proxy::ProxyClient;
use stone_firewall::rules::{InMemoryRuleBackend, JsonFileRuleBackend, RuleBackend, RuleStore};
use stone_firewall::server::{Firewall, Server};
use stone_firewall::telemetry::{
    InMemoryFastLogStore, InMemoryMetricStore, JsonLinesLogStore, Telemetry, TelemetryStores,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[cfg(feature = "redis-storage")]
use stone_firewall::rules::RedisRuleBackend;
#[cfg(feature = "redis-storage")]
use stone_firewall::storage::SharedRedisClient;
#[cfg(feature = "redis-storage")]
use stone_firewall::telemetry::{RedisFastLogStore, RedisMetricStore};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env()?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| FirewallError::Config(format!("Invalid listen address: {}", e)))?;

    let rules = Arc::new(RuleStore::load(rule_backend(&config)?).await?);
    let telemetry = Telemetry::spawn(telemetry_stores(&config)?);
    let proxy = Arc::new(ProxyClient::new(config.proxy.client_config())?);
    let decoy = DecoyResponder::new(config.firewall.block_page.clone());

    let firewall = Firewall::new(rules, proxy, decoy, telemetry)
        .with_max_body_bytes(config.firewall.max_body_bytes)
        .with_header_timeout(config.firewall.header_timeout);

    let server = Server::bind(addr, firewall)
        .await?
        .with_mode(config.firewall.mode)
        .with_max_connections(config.server.max_connections);
    server.run().await?;

    Ok(())
}

fn rule_backend(config: &Config) -> Result<Arc<dyn RuleBackend>> {
    let backend: Arc<dyn RuleBackend> = match config.rules.storage {
        RuleStorageType::Memory => Arc::new(InMemoryRuleBackend::default()),
        RuleStorageType::File => Arc::new(JsonFileRuleBackend::new(config.rules.file.clone())),
        #[cfg(feature = "redis-storage")]
        RuleStorageType::Redis => {
            let url = config.rules.redis_url.as_deref().unwrap_or_default();
            Arc::new(RedisRuleBackend::from_client(SharedRedisClient::new(url)?))
        }
    };
    Ok(backend)
}

fn telemetry_stores(config: &Config) -> Result<TelemetryStores> {
    let durable = Arc::new(JsonLinesLogStore::new(config.telemetry.traffic_log_path.clone()));

    let stores = match config.telemetry.storage {
        StorageType::Memory => TelemetryStores {
            metrics: Arc::new(InMemoryMetricStore::new()),
            fast: Arc::new(InMemoryFastLogStore::new()),
            durable,
        },
        #[cfg(feature = "redis-storage")]
        StorageType::Redis => {
            let url = config.telemetry.redis_url.as_deref().unwrap_or_default();
            let client = SharedRedisClient::new(url)?;
            TelemetryStores {
                metrics: Arc::new(RedisMetricStore::from_client(client.clone())),
                fast: Arc::new(RedisFastLogStore::from_client(client)),
                durable,
            }
        }
    };
    Ok(stores)
}
