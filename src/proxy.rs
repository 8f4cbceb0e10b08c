//! Upstream client for allowed requests
//!
//! Handles request forwarding with:
//! - Connection pooling to the origin
//! - Destination rewriting (scheme and authority of the upstream)
//! - Hop-by-hop header removal, optional X-Forwarded-For / X-Real-IP
//! - Streaming of the origin response back to the caller

use std::net::IpAddr;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{HeaderMap, Request, Response, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::error::{FirewallError, Result};

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Upstream origin, `host:port` or `http://host:port`
    pub upstream_url: String,
    /// Deadline for the origin's response head; `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Keep the client's Host header instead of the upstream authority
    pub preserve_host: bool,
    /// Add X-Forwarded-For and X-Real-IP
    pub forwarded_headers: bool,
}

impl ProxyConfig {
    pub fn new(upstream_url: impl Into<String>) -> Self {
        Self {
            upstream_url: upstream_url.into(),
            timeout: Some(Duration::from_secs(30)),
            preserve_host: true,
            forwarded_headers: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_preserve_host(mut self, preserve: bool) -> Self {
        self.preserve_host = preserve;
        self
    }

    pub fn with_forwarded_headers(mut self, enabled: bool) -> Self {
        self.forwarded_headers = enabled;
        self
    }
}

/// Reverse proxy client with connection pooling
pub struct ProxyClient {
    config: ProxyConfig,
    client: Client<HttpConnector, Full<Bytes>>,
    upstream_uri: Uri,
    target: String,
}

impl ProxyClient {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let raw = config.upstream_url.trim();
        let url = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let upstream_uri: Uri = url
            .parse()
            .map_err(|e| FirewallError::Config(format!("Invalid upstream URL: {}", e)))?;

        if upstream_uri.scheme_str() != Some("http") {
            return Err(FirewallError::Config(format!(
                "Unsupported upstream scheme in {}. Only plain http is supported",
                config.upstream_url
            )));
        }

        let host = upstream_uri
            .host()
            .ok_or_else(|| FirewallError::Config("Upstream URL has no host".to_string()))?;
        let target = format!("{}:{}", host, upstream_uri.port_u16().unwrap_or(80));

        let client = Client::builder(TokioExecutor::new()).build_http();

        Ok(Self {
            config,
            client,
            upstream_uri,
            target,
        })
    }

    /// Upstream `host:port`, used for dialing in relay mode and in log records
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Send `req` to the origin and return its response with the body still
    /// streaming. Method, path, query, remaining headers and body go out
    /// unchanged.
    pub async fn forward(
        &self,
        mut req: Request<Full<Bytes>>,
        client_ip: IpAddr,
    ) -> Result<Response<Incoming>> {
        let upstream_path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let upstream_uri = format!("http://{}{}", self.authority(), upstream_path);

        *req.uri_mut() = upstream_uri
            .parse()
            .map_err(|e| FirewallError::Upstream(format!("Failed to parse upstream URI: {}", e)))?;

        self.rewrite_headers(req.headers_mut(), client_ip);

        let call = self.client.request(req);
        let response = match self.config.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| FirewallError::Upstream("Upstream request timeout".to_string()))?,
            None => call.await,
        }
        .map_err(|e| FirewallError::Upstream(format!("Upstream request failed: {}", e)))?;

        Ok(response)
    }

    fn authority(&self) -> &str {
        self.upstream_uri
            .authority()
            .map(|a| a.as_str())
            .unwrap_or(&self.target)
    }

    /// Rewrite request headers for the outbound leg
    fn rewrite_headers(&self, headers: &mut HeaderMap, client_ip: IpAddr) {
        strip_hop_by_hop(headers);

        if self.config.forwarded_headers {
            let client_ip = client_ip.to_string();
            let forwarded = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{}, {}", existing, client_ip),
                None => client_ip.clone(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert("x-forwarded-for", value);
            }
            if let Ok(value) = HeaderValue::from_str(&client_ip) {
                headers.insert("x-real-ip", value);
            }
        }

        if !self.config.preserve_host {
            if let Ok(value) = HeaderValue::from_str(self.authority()) {
                headers.insert(HOST, value);
            }
        }
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
