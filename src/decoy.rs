//! Randomized block responses
//!
//! Every blocked request gets the configured block page with a random status
//! code in 200..=503 and a random-length HTML comment appended, so neither
//! the status nor the body length can be used to fingerprint the firewall.

use std::path::PathBuf;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{HeaderMap, Response, StatusCode};
use rand::Rng;

pub const MIN_STATUS: u16 = 200;
pub const MAX_STATUS: u16 = 503;
pub const MIN_PADDING: usize = 5000;
pub const MAX_PADDING: usize = 10000;

const COMMENT_OPEN: &str = "<!-- ";
const COMMENT_CLOSE: &str = " -->";

// printable ASCII minus '-', '<' and '>' so the comment cannot terminate early
const PADDING_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789 !\"#$%&'()*+,./:;=?@[\\]^_`{|}~";

const FALLBACK_PAGE: &str = "<!DOCTYPE html>\n<html><head><title>Request blocked</title></head>\
<body><h1>Request blocked</h1><p>Your request could not be processed.</p></body></html>\n";

/// One synthesized block response
#[derive(Debug, Clone)]
pub struct Decoy {
    status: StatusCode,
    body: Bytes,
    padding_len: usize,
}

impl Decoy {
    /// Build a decoy from `page`, appending a padding comment whose total
    /// length is drawn uniformly from `MIN_PADDING..=MAX_PADDING`.
    pub fn generate<R: Rng + ?Sized>(page: &[u8], rng: &mut R) -> Self {
        let status = random_status(rng);
        let padding_len = rng.gen_range(MIN_PADDING..=MAX_PADDING);

        let filler = padding_len - COMMENT_OPEN.len() - COMMENT_CLOSE.len();
        let mut body = Vec::with_capacity(page.len() + padding_len);
        body.extend_from_slice(page);
        body.extend_from_slice(COMMENT_OPEN.as_bytes());
        body.extend((0..filler).map(|_| PADDING_CHARSET[rng.gen_range(0..PADDING_CHARSET.len())]));
        body.extend_from_slice(COMMENT_CLOSE.as_bytes());

        Self {
            status,
            body: Bytes::from(body),
            padding_len,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Bytes appended after the block page, comment markers included
    pub fn padding_len(&self) -> usize {
        self.padding_len
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}

/// Status in `MIN_STATUS..=MAX_STATUS`.
///
/// 204 and 304 are redrawn: they cannot carry the block page body.
fn random_status<R: Rng + ?Sized>(rng: &mut R) -> StatusCode {
    loop {
        let code = rng.gen_range(MIN_STATUS..=MAX_STATUS);
        if code == 204 || code == 304 {
            continue;
        }
        if let Ok(status) = StatusCode::from_u16(code) {
            return status;
        }
    }
}

/// Produces decoy responses from the block page on disk
#[derive(Debug, Clone)]
pub struct DecoyResponder {
    block_page: PathBuf,
}

impl DecoyResponder {
    pub fn new(block_page: impl Into<PathBuf>) -> Self {
        Self {
            block_page: block_page.into(),
        }
    }

    /// Read the block page as it is on disk right now
    pub async fn load_page(&self) -> Bytes {
        match tokio::fs::read(&self.block_page).await {
            Ok(page) => Bytes::from(page),
            Err(e) => {
                tracing::warn!(
                    path = %self.block_page.display(),
                    error = %e,
                    "Block page unavailable, using built-in page"
                );
                Bytes::from_static(FALLBACK_PAGE.as_bytes())
            }
        }
    }

    pub async fn decoy(&self) -> Decoy {
        let page = self.load_page().await;
        Decoy::generate(&page, &mut rand::thread_rng())
    }

    pub async fn respond(&self) -> Response<Full<Bytes>> {
        self.decoy().await.into_response()
    }
}
