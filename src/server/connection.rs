//! Per-connection request cycle
//!
//! hyper parses one request at a time off the socket (READ_REQUEST). Each
//! cycle then re-evaluates the client against the current rule snapshot,
//! either forwards the request or answers with a decoy, and decides whether
//! the connection goes back to READ_REQUEST or is CLOSED. A closing decision
//! is carried to hyper as `Connection: close` on the response.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode, Version};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::filter::{evaluate, BlockReason, InspectedRequest, Verdict};
use crate::rules::IpStatus;
use crate::telemetry::{Outcome, Telemetry, TrafficLogRecord, TrafficStatus};

use super::Firewall;

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Where a connection goes after a request/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ReadRequest,
    Closed,
}

/// How one request/response cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Origin answered; `upstream_close` when it asked to end the connection
    Forwarded { upstream_close: bool },
    Blocked,
    Failed,
}

/// Only a forwarded exchange whose origin keeps the connection open loops
/// back to reading the next request.
pub fn next_state(cycle: Cycle) -> ConnectionState {
    match cycle {
        Cycle::Forwarded {
            upstream_close: false,
        } => ConnectionState::ReadRequest,
        _ => ConnectionState::Closed,
    }
}

/// Whether the origin response ends the connection: an explicit
/// `Connection: close`, or HTTP/1.0 without `keep-alive`.
pub fn upstream_wants_close(version: Version, headers: &HeaderMap) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };

    if has_token("close") {
        return true;
    }
    version == Version::HTTP_10 && !has_token("keep-alive")
}

/// Relayed origin body that logs the exchange once the client got all of it.
///
/// Ending the stream records `success`. A stream error, or the connection
/// dropping the body before its end, records `failed`.
pub struct RecordedBody {
    inner: ResponseBody,
    pending: Option<(Telemetry, TrafficLogRecord)>,
}

impl RecordedBody {
    pub fn new(inner: ResponseBody, telemetry: Telemetry, record: TrafficLogRecord) -> Self {
        Self {
            inner,
            pending: Some((telemetry, record)),
        }
    }

    fn finish(&mut self, error: Option<String>) {
        let Some((telemetry, record)) = self.pending.take() else {
            return;
        };

        match error {
            None => telemetry.record(Outcome::Success, record),
            Some(error) => telemetry.record(
                Outcome::Failed,
                record.with_status(TrafficStatus::Failed).with_error(error),
            ),
        }
    }
}

impl Body for RecordedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(None) => this.finish(None),
            Poll::Ready(Some(Err(e))) => this.finish(Some(e.to_string())),
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => this.finish(None),
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RecordedBody {
    fn drop(&mut self) {
        if self.inner.is_end_stream() {
            self.finish(None);
        } else {
            self.finish(Some(
                "client connection closed before the response was delivered".to_string(),
            ));
        }
    }
}

/// Serves every request arriving on one client connection
pub struct ConnectionHandler {
    firewall: Arc<Firewall>,
    remote_addr: SocketAddr,
    client_ip: IpAddr,
    cycles: AtomicU64,
    /// Whether the last cycle left the connection in READ_REQUEST
    awaiting_request: AtomicBool,
}

impl ConnectionHandler {
    pub fn new(firewall: Arc<Firewall>, remote_addr: SocketAddr, client_ip: IpAddr) -> Self {
        Self {
            firewall,
            remote_addr,
            client_ip,
            cycles: AtomicU64::new(0),
            awaiting_request: AtomicBool::new(true),
        }
    }

    /// Drive the connection until it is closed
    pub async fn serve(self, stream: TcpStream) {
        let handler = Arc::new(self);
        let io = TokioIo::new(stream);

        let mut builder = http1::Builder::new();
        builder.keep_alive(true);
        if let Some(timeout) = handler.firewall.header_timeout {
            builder.timer(TokioTimer::new()).header_read_timeout(timeout);
        }

        let service = {
            let handler = handler.clone();
            service_fn(move |req| {
                let handler = handler.clone();
                async move { handler.cycle(req).await }
            })
        };

        let result = builder.serve_connection(io, service).await;
        let remote_addr = handler.remote_addr;

        match result {
            Ok(()) if handler.awaiting_request.load(Ordering::Relaxed) => {
                warn!(
                    %remote_addr,
                    served = handler.cycles.load(Ordering::Relaxed),
                    "Connection closed while waiting for a request"
                );
                handler.record_failure(TrafficLogRecord::failed(
                    handler.client_ip.to_string(),
                    handler.firewall.target(),
                    "connection closed before a complete request",
                ));
            }
            Ok(()) => debug!(%remote_addr, "Connection closed"),
            Err(e) if is_read_failure(&e) => {
                warn!(%remote_addr, error = %e, "Failed to read request");
                handler.record_failure(TrafficLogRecord::failed(
                    handler.client_ip.to_string(),
                    handler.firewall.target(),
                    e.to_string(),
                ));
            }
            Err(e) => warn!(%remote_addr, error = %e, "Connection error"),
        }
    }

    fn settle(&self, state: ConnectionState) -> ConnectionState {
        self.awaiting_request
            .store(state == ConnectionState::ReadRequest, Ordering::Relaxed);
        state
    }

    /// One EVALUATE -> FORWARD/BLOCK -> RESPOND pass
    async fn cycle(&self, req: Request<Incoming>) -> Result<Response<ResponseBody>, Infallible> {
        self.cycles.fetch_add(1, Ordering::Relaxed);

        let firewall = &self.firewall;
        let remote_addr = self.remote_addr;
        let client_ip = self.client_ip.to_string();

        debug!(%remote_addr, method = %req.method(), uri = %req.uri(), "Request received");

        let record = TrafficLogRecord::success(client_ip.as_str(), firewall.target())
            .with_head(req.method(), req.uri(), req.headers());

        let snapshot = firewall.rules.snapshot();
        let ip_status = snapshot.classify(&client_ip);

        // blacklisted mid-connection: no need to buffer the body
        if ip_status == IpStatus::Blacklisted {
            return Ok(self.block(BlockReason::Blacklist, record).await);
        }

        let inspected = match InspectedRequest::read(req, firewall.max_body_bytes).await {
            Ok(inspected) => inspected,
            Err(e) => {
                warn!(%remote_addr, error = %e, "Failed to read request body");
                self.settle(ConnectionState::Closed);
                self.record_failure(
                    record
                        .with_status(TrafficStatus::Failed)
                        .with_error(e.to_string()),
                );
                let decoy = firewall.decoy.respond().await;
                return Ok(decoy.map(|body| body.map_err(|never| match never {}).boxed()));
            }
        };

        let record = record.with_body_excerpt(inspected.body());

        match evaluate(ip_status, &inspected, &snapshot) {
            Verdict::Block(reason) => Ok(self.block(reason, record).await),
            Verdict::Allow => Ok(self.forward(inspected, record).await),
        }
    }

    async fn block(&self, reason: BlockReason, record: TrafficLogRecord) -> Response<ResponseBody> {
        let outcome = match reason {
            BlockReason::Blacklist => Outcome::BlockedBlacklist,
            BlockReason::Rule { .. } => Outcome::BlockedRule,
        };

        let response = self.firewall.decoy.respond().await;
        let state = self.settle(next_state(Cycle::Blocked));
        info!(
            remote_addr = %self.remote_addr,
            reason = %reason,
            status = response.status().as_u16(),
            ?state,
            "Request blocked"
        );

        self.firewall.telemetry.record(
            outcome,
            record
                .with_status(TrafficStatus::Blocked)
                .with_error(reason.to_string()),
        );

        response.map(|body| body.map_err(|never| match never {}).boxed())
    }

    async fn forward(
        &self,
        inspected: InspectedRequest,
        record: TrafficLogRecord,
    ) -> Response<ResponseBody> {
        let remote_addr = self.remote_addr;
        let request = inspected.into_request();

        match self.firewall.proxy.forward(request, self.client_ip).await {
            Ok(mut response) => {
                let upstream_close = upstream_wants_close(response.version(), response.headers());
                let state = self.settle(next_state(Cycle::Forwarded { upstream_close }));
                if state == ConnectionState::Closed {
                    response
                        .headers_mut()
                        .insert(CONNECTION, HeaderValue::from_static("close"));
                }

                debug!(
                    %remote_addr,
                    status = response.status().as_u16(),
                    ?state,
                    "Upstream responded"
                );
                let telemetry = self.firewall.telemetry.clone();
                response.map(|body| RecordedBody::new(body.boxed(), telemetry, record).boxed())
            }
            Err(e) => {
                let state = self.settle(next_state(Cycle::Failed));
                error!(%remote_addr, error = %e, ?state, "Proxy forward failed");
                self.record_failure(
                    record
                        .with_status(TrafficStatus::Failed)
                        .with_error(e.to_string()),
                );
                bad_gateway()
            }
        }
    }

    fn record_failure(&self, record: TrafficLogRecord) {
        self.firewall.telemetry.record(Outcome::Failed, record);
    }
}

/// hyper errors that mean the client never delivered a well-formed request
fn is_read_failure(e: &hyper::Error) -> bool {
    e.is_parse() || e.is_parse_too_large() || e.is_incomplete_message() || e.is_timeout()
}

fn bad_gateway() -> Response<ResponseBody> {
    let body: ResponseBody = Full::new(Bytes::from_static(b"Bad Gateway"))
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}
