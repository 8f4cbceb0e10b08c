//! TCP listener and connection dispatch
//!
//! Responsibilities:
//! - Accept TCP connections, never giving up on a transient accept error
//! - Canonicalize the client IP and drop blacklisted peers before parsing
//! - Spawn one task per connection (HTTP inspection or raw relay)
//! - Optional cap on concurrently served connections

pub mod connection;
pub mod tcp;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::decoy::DecoyResponder;
use crate::error::{FirewallError, Result};
use crate::filter::BlockReason;
use crate::proxy::ProxyClient;
use crate::rules::{IpStatus, RuleStore};
use crate::telemetry::{Outcome, Telemetry, TrafficLogRecord};

pub use connection::ConnectionHandler;

/// How accepted connections are processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Parse HTTP, inspect every request, forward or decoy
    #[default]
    Http,
    /// Relay raw bytes to the upstream after the accept-time blacklist check
    Tcp,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Http => write!(f, "http"),
            Mode::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(Mode::Http),
            "tcp" => Ok(Mode::Tcp),
            other => Err(format!("unknown mode '{}', expected 'http' or 'tcp'", other)),
        }
    }
}

/// Everything a connection task needs, shared across all of them
pub struct Firewall {
    pub rules: Arc<RuleStore>,
    pub proxy: Arc<ProxyClient>,
    pub decoy: DecoyResponder,
    pub telemetry: Telemetry,
    /// Request body ceiling; `None` buffers bodies of any size
    pub max_body_bytes: Option<usize>,
    /// Deadline for a client to finish sending request headers
    pub header_timeout: Option<Duration>,
}

impl Firewall {
    pub fn new(
        rules: Arc<RuleStore>,
        proxy: Arc<ProxyClient>,
        decoy: DecoyResponder,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            rules,
            proxy,
            decoy,
            telemetry,
            max_body_bytes: None,
            header_timeout: None,
        }
    }

    pub fn with_max_body_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn with_header_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.header_timeout = timeout;
        self
    }

    pub fn target(&self) -> &str {
        self.proxy.target()
    }
}

/// Listening socket plus dispatch policy
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
    firewall: Arc<Firewall>,
    mode: Mode,
    connection_limit: Option<Arc<Semaphore>>,
}

impl Server {
    pub async fn bind(addr: SocketAddr, firewall: Firewall) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FirewallError::Bind { addr, source: e })?;

        let actual_addr = listener
            .local_addr()
            .map_err(|e| FirewallError::Config(format!("Failed to get local address: {}", e)))?;

        info!(%actual_addr, "Server bound successfully");

        Ok(Self {
            listener,
            addr: actual_addr,
            firewall: Arc::new(firewall),
            mode: Mode::Http,
            connection_limit: None,
        })
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Cap concurrently served connections; further accepts wait for a slot
    pub fn with_max_connections(mut self, max: Option<usize>) -> Self {
        self.connection_limit = max.map(|max| Arc::new(Semaphore::new(max)));
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        info!(
            addr = %self.addr,
            mode = %self.mode,
            upstream = self.firewall.target(),
            "Starting server"
        );

        loop {
            let permit = match &self.connection_limit {
                Some(limit) => match limit.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        error!("Connection limiter closed");
                        return Ok(());
                    }
                },
                None => None,
            };

            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(%e, "Failed to accept connection");
                    continue;
                }
            };

            let client_ip = remote_addr.ip().to_canonical();
            if reject_blacklisted(&self.firewall, client_ip) {
                drop(stream);
                continue;
            }

            let firewall = self.firewall.clone();
            let mode = self.mode;

            tokio::spawn(async move {
                match mode {
                    Mode::Http => {
                        ConnectionHandler::new(firewall, remote_addr, client_ip)
                            .serve(stream)
                            .await
                    }
                    Mode::Tcp => tcp::relay(stream, remote_addr, client_ip, firewall).await,
                }
                drop(permit);
            });
        }
    }
}

/// Count and log a blacklisted peer. Returns whether it must be dropped.
fn reject_blacklisted(firewall: &Firewall, client_ip: IpAddr) -> bool {
    let ip = client_ip.to_string();
    if firewall.rules.ip_status(&ip) != IpStatus::Blacklisted {
        debug!(client_ip = %ip, "Connection accepted");
        return false;
    }

    let reason = BlockReason::Blacklist;
    info!(client_ip = %ip, reason = %reason, "Dropping connection before parsing");
    firewall.telemetry.record(
        Outcome::BlockedBlacklist,
        TrafficLogRecord::blocked(ip, firewall.target(), reason.to_string()),
    );
    true
}
