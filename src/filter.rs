//! Request evaluation
//!
//! Buffers the request body once, decides allow/block from the client's IP
//! status and the content-inspection patterns, and rebuilds a request whose
//! body is byte-identical to what the client sent.

pub mod inspection;

use std::fmt;

use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::http::request::Parts;
use hyper::{HeaderMap, Method, Request, Uri};

use crate::rules::{IpStatus, RuleSnapshot};

/// Why a request was blocked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// Client IP is on the blacklist
    Blacklist,
    /// An interception pattern matched
    Rule { pattern: String },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Blacklist => write!(f, "IP in blacklist"),
            BlockReason::Rule { pattern } => write!(f, "Blocked by rule '{}'", pattern),
        }
    }
}

/// Outcome of evaluating one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block(BlockReason),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => write!(f, "Allow"),
            Verdict::Block(reason) => write!(f, "Block({})", reason),
        }
    }
}

/// Error type for request body buffering
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("Failed to read request body: {0}")]
    Read(String),

    #[error("Request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Request head plus its fully buffered body.
///
/// The body is kept as `Bytes`, so inspection and forwarding share one
/// buffer and the forwarded bytes are exactly the received ones.
#[derive(Debug)]
pub struct InspectedRequest {
    parts: Parts,
    body: Bytes,
}

impl InspectedRequest {
    pub fn new(parts: Parts, body: Bytes) -> Self {
        Self { parts, body }
    }

    /// Read the whole body of `req`, optionally capped at `limit` bytes
    pub async fn read<B>(req: Request<B>, limit: Option<usize>) -> Result<Self, BodyError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();

        let body = match limit {
            Some(limit) => Limited::new(body, limit)
                .collect()
                .await
                .map_err(|e| {
                    if e.is::<LengthLimitError>() {
                        BodyError::TooLarge { limit }
                    } else {
                        BodyError::Read(e.to_string())
                    }
                })?
                .to_bytes(),
            None => body
                .collect()
                .await
                .map_err(|e| {
                    let e: Box<dyn std::error::Error + Send + Sync> = e.into();
                    BodyError::Read(e.to_string())
                })?
                .to_bytes(),
        };

        Ok(Self { parts, body })
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Reassemble a request that can be read again from the start
    pub fn into_request(self) -> Request<Full<Bytes>> {
        Request::from_parts(self.parts, Full::new(self.body))
    }
}

/// Decide allow/block for one request against `snapshot`.
///
/// Blacklisted clients are blocked outright, whitelisted clients skip
/// content inspection, neutral clients are blocked iff a pattern matches.
pub fn evaluate(ip_status: IpStatus, request: &InspectedRequest, snapshot: &RuleSnapshot) -> Verdict {
    match ip_status {
        IpStatus::Blacklisted => Verdict::Block(BlockReason::Blacklist),
        IpStatus::Whitelisted => Verdict::Allow,
        IpStatus::Neutral => match inspection::first_match(request, snapshot) {
            Some(found) => {
                tracing::debug!(
                    pattern = found.pattern.name(),
                    surface = %found.surface,
                    "Interception pattern matched"
                );
                Verdict::Block(BlockReason::Rule {
                    pattern: found.pattern.name().to_string(),
                })
            }
            None => Verdict::Allow,
        },
    }
}
