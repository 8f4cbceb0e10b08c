//! Unified error types for the Stone firewall

use std::net::SocketAddr;
use thiserror::Error;

use crate::rules::RuleError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Upstream connection failed: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rule store error: {0}")]
    Rules(#[from] RuleError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, FirewallError>;
