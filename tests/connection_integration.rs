//! Integration tests for the per-connection request cycle

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1::SendRequest;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use stone_firewall::decoy::{DecoyResponder, MAX_STATUS, MIN_STATUS};
use stone_firewall::proxy::{ProxyClient, ProxyConfig};
use stone_firewall::rules::{RuleSet, RuleStore};
use stone_firewall::server::{Firewall, Server};
use stone_firewall::telemetry::{
    InMemoryDurableLogStore, InMemoryFastLogStore, InMemoryMetricStore, Telemetry,
    TelemetryStores, TrafficLogRecord, TrafficStatus,
};

const BLOCK_PAGE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/static/block.html");

struct Harness {
    addr: SocketAddr,
    telemetry: Telemetry,
    durable: Arc<InMemoryDurableLogStore>,
    server: tokio::task::JoinHandle<stone_firewall::error::Result<()>>,
}

impl Harness {
    /// Poll until `count` records were logged or give up after a few seconds
    async fn wait_for_records(&self, count: usize) -> Vec<TrafficLogRecord> {
        for _ in 0..100 {
            self.telemetry.flush().await;
            let records = self.durable.records();
            if records.len() >= count {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.durable.records()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Backend echoing the request body. Counts accepted connections and honors
/// an `x-close` request header by answering with `Connection: close`.
async fn run_echo_backend() -> (SocketAddr, Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    let handle = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);

            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let close = req.headers().contains_key("x-close");
                    let forwarded = req
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let host = req
                        .headers()
                        .get("host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let body = req.into_body().collect().await?.to_bytes();

                    let mut builder = Response::builder()
                        .status(StatusCode::OK)
                        .header("X-Backend", "echo")
                        .header("X-Seen-Host", host)
                        .header("X-Seen-Forwarded-For", forwarded);
                    if close {
                        builder = builder.header("Connection", "close");
                    }
                    Ok::<_, hyper::Error>(builder.body(Full::new(body)).unwrap())
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    (addr, connections, handle)
}

async fn start_firewall<F>(upstream: String, configure: F) -> Harness
where
    F: FnOnce(Firewall) -> Firewall,
{
    start_firewall_with_proxy(ProxyConfig::new(upstream), configure).await
}

async fn start_firewall_with_proxy<F>(proxy: ProxyConfig, configure: F) -> Harness
where
    F: FnOnce(Firewall) -> Firewall,
{
    let rules = Arc::new(RuleStore::in_memory(RuleSet::default()).await.unwrap());
    let durable = Arc::new(InMemoryDurableLogStore::new());
    let telemetry = Telemetry::spawn(TelemetryStores {
        metrics: Arc::new(InMemoryMetricStore::new()),
        fast: Arc::new(InMemoryFastLogStore::new()),
        durable: durable.clone(),
    });

    let firewall = configure(Firewall::new(
        rules,
        Arc::new(ProxyClient::new(proxy).unwrap()),
        DecoyResponder::new(BLOCK_PAGE),
        telemetry.clone(),
    ));

    let server = Server::bind(SocketAddr::from(([127, 0, 0, 1], 0)), firewall)
        .await
        .unwrap();
    let addr = server.addr();
    let server = tokio::spawn(async move { server.run().await });

    Harness {
        addr,
        telemetry,
        durable,
        server,
    }
}

async fn connect(
    addr: SocketAddr,
) -> (
    SendRequest<Full<Bytes>>,
    tokio::task::JoinHandle<hyper::Result<()>>,
) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    (sender, tokio::spawn(conn))
}

fn get(path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .uri(path)
        .header("host", "shop.example.com")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[tokio::test]
async fn test_keep_alive_between_allowed_requests() {
    let (backend_addr, _, backend_handle) = run_echo_backend().await;
    let harness = start_firewall(backend_addr.to_string(), |f| f).await;

    let (mut sender, conn) = connect(harness.addr).await;

    for path in ["/one", "/two", "/three"] {
        sender.ready().await.unwrap();
        let response = sender.send_request(get(path)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("connection").is_none());
        response.into_body().collect().await.unwrap();
    }

    assert!(!conn.is_finished());

    let records = harness.wait_for_records(3).await;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == TrafficStatus::Success));

    backend_handle.abort();
}

#[tokio::test]
async fn test_upstream_connection_close_closes_client_connection() {
    let (backend_addr, _, backend_handle) = run_echo_backend().await;
    let harness = start_firewall(backend_addr.to_string(), |f| f).await;

    let (mut sender, conn) = connect(harness.addr).await;

    let req = Request::builder()
        .uri("/bye")
        .header("host", "firewall")
        .header("x-close", "1")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["connection"], "close");
    response.into_body().collect().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), conn)
        .await
        .expect("client connection should be closed")
        .unwrap()
        .ok();

    // the firewall closed the connection itself, so no read was pending
    tokio::time::sleep(Duration::from_millis(100)).await;
    let records = harness.wait_for_records(1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TrafficStatus::Success);

    backend_handle.abort();
}

#[tokio::test]
async fn test_body_forwarded_byte_for_byte() {
    let (backend_addr, _, backend_handle) = run_echo_backend().await;
    let harness = start_firewall(backend_addr.to_string(), |f| f).await;

    let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
    let (mut sender, _conn) = connect(harness.addr).await;

    let req = Request::builder()
        .method(Method::PUT)
        .uri("/upload")
        .header("host", "firewall")
        .header("content-type", "application/octet-stream")
        .body(Full::new(Bytes::from(payload.clone())))
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let echoed = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(echoed.len(), payload.len());
    assert_eq!(&echoed[..], &payload[..]);

    backend_handle.abort();
}

#[tokio::test]
async fn test_host_preserved_and_no_forwarded_headers_by_default() {
    let (backend_addr, _, backend_handle) = run_echo_backend().await;
    let harness = start_firewall(backend_addr.to_string(), |f| f).await;

    let (mut sender, _conn) = connect(harness.addr).await;
    let response = sender.send_request(get("/")).await.unwrap();

    assert_eq!(response.headers()["x-seen-host"], "shop.example.com");
    assert_eq!(response.headers()["x-seen-forwarded-for"], "");

    backend_handle.abort();
}

#[tokio::test]
async fn test_forwarded_headers_when_enabled() {
    let (backend_addr, _, backend_handle) = run_echo_backend().await;
    let proxy = ProxyConfig::new(backend_addr.to_string())
        .with_preserve_host(false)
        .with_forwarded_headers(true);
    let harness = start_firewall_with_proxy(proxy, |f| f).await;

    let (mut sender, _conn) = connect(harness.addr).await;
    let response = sender.send_request(get("/")).await.unwrap();

    assert_eq!(response.headers()["x-seen-host"], backend_addr.to_string().as_str());
    assert_eq!(response.headers()["x-seen-forwarded-for"], "127.0.0.1");

    backend_handle.abort();
}

#[tokio::test]
async fn test_upstream_failure_returns_bad_gateway() {
    // reserve a port, then free it so nothing is listening
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let harness = start_firewall(format!("http://{}", dead_addr), |f| f).await;

    let (mut sender, conn) = connect(harness.addr).await;
    let response = sender.send_request(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.headers()["connection"], "close");
    response.into_body().collect().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), conn)
        .await
        .expect("client connection should be closed")
        .unwrap()
        .ok();

    let records = harness.wait_for_records(1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TrafficStatus::Failed);
    assert!(records[0].error.is_some());
}

#[tokio::test]
async fn test_body_over_limit_gets_decoy_and_failed_record() {
    let (backend_addr, connections, backend_handle) = run_echo_backend().await;
    let harness =
        start_firewall(backend_addr.to_string(), |f| f.with_max_body_bytes(Some(16))).await;

    let (mut sender, _conn) = connect(harness.addr).await;
    let req = Request::builder()
        .method(Method::POST)
        .uri("/upload")
        .header("host", "firewall")
        .body(Full::new(Bytes::from(vec![b'a'; 64])))
        .unwrap();
    let response = sender.send_request(req).await.unwrap();

    let status = response.status().as_u16();
    assert!((MIN_STATUS..=MAX_STATUS).contains(&status));
    assert!(response.headers().get("x-backend").is_none());
    assert_eq!(response.headers()["connection"], "close");

    let records = harness.wait_for_records(1).await;
    assert_eq!(records[0].status, TrafficStatus::Failed);
    assert!(records[0].error.as_deref().unwrap().contains("exceeds 16 bytes"));
    assert_eq!(connections.load(Ordering::SeqCst), 0);

    backend_handle.abort();
}

#[tokio::test]
async fn test_body_within_limit_forwarded() {
    let (backend_addr, _, backend_handle) = run_echo_backend().await;
    let harness =
        start_firewall(backend_addr.to_string(), |f| f.with_max_body_bytes(Some(16))).await;

    let (mut sender, _conn) = connect(harness.addr).await;
    let req = Request::builder()
        .method(Method::POST)
        .uri("/upload")
        .header("host", "firewall")
        .body(Full::new(Bytes::from_static(b"sixteen bytes!!!")))
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    backend_handle.abort();
}

#[tokio::test]
async fn test_connection_closed_before_request_is_logged() {
    let (backend_addr, _, backend_handle) = run_echo_backend().await;
    let harness = start_firewall(backend_addr.to_string(), |f| f).await;

    let stream = TcpStream::connect(harness.addr).await.unwrap();
    drop(stream);

    let records = harness.wait_for_records(1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TrafficStatus::Failed);
    assert_eq!(records[0].client_ip, "127.0.0.1");

    backend_handle.abort();
}

#[tokio::test]
async fn test_client_hangup_after_served_request_is_logged() {
    let (backend_addr, _, backend_handle) = run_echo_backend().await;
    let harness = start_firewall(backend_addr.to_string(), |f| f).await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream
        .write_all(b"GET /one HTTP/1.1\r\nHost: shop.example.com\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed before the response arrived");
        head.extend_from_slice(&buf[..n]);
    }
    assert!(head.starts_with(b"HTTP/1.1 200"));

    stream.shutdown().await.unwrap();
    drop(stream);

    let records = harness.wait_for_records(2).await;
    let statuses: Vec<_> = records.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![TrafficStatus::Success, TrafficStatus::Failed]);
    assert_eq!(
        records[1].error.as_deref(),
        Some("connection closed before a complete request")
    );

    backend_handle.abort();
}

#[tokio::test]
async fn test_malformed_request_is_logged() {
    let (backend_addr, connections, backend_handle) = run_echo_backend().await;
    let harness = start_firewall(backend_addr.to_string(), |f| f).await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;

    let records = harness.wait_for_records(1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TrafficStatus::Failed);
    assert_eq!(connections.load(Ordering::SeqCst), 0);

    backend_handle.abort();
}

#[tokio::test]
async fn test_header_timeout_closes_idle_client() {
    let (backend_addr, _, backend_handle) = run_echo_backend().await;
    let harness = start_firewall(backend_addr.to_string(), |f| {
        f.with_header_timeout(Some(Duration::from_millis(200)))
    })
    .await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n").await.unwrap();

    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf)).await;
    assert!(read.is_ok(), "server should hang up on a stalled client");

    let records = harness.wait_for_records(1).await;
    assert_eq!(records[0].status, TrafficStatus::Failed);

    backend_handle.abort();
}
