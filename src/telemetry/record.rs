//! Traffic log records and daily counters

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use hyper::{HeaderMap, Method, Uri};
use serde::{Deserialize, Serialize};

/// Longest body prefix copied into a log record
pub const BODY_EXCERPT_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficStatus {
    Success,
    Failed,
    Blocked,
}

impl fmt::Display for TrafficStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficStatus::Success => write!(f, "success"),
            TrafficStatus::Failed => write!(f, "failed"),
            TrafficStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// One processed request or failed parse attempt. Write-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficLogRecord {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub target: String,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
    pub status: TrafficStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrafficLogRecord {
    pub fn new(client_ip: impl Into<String>, target: impl Into<String>, status: TrafficStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            client_ip: client_ip.into(),
            target: target.into(),
            url: String::new(),
            method: String::new(),
            headers: BTreeMap::new(),
            body: String::new(),
            status,
            error: None,
        }
    }

    pub fn success(client_ip: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(client_ip, target, TrafficStatus::Success)
    }

    pub fn blocked(
        client_ip: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(client_ip, target, TrafficStatus::Blocked).with_error(reason)
    }

    pub fn failed(
        client_ip: impl Into<String>,
        target: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(client_ip, target, TrafficStatus::Failed).with_error(error)
    }

    /// Copy method, URL and headers of the request into the record
    pub fn with_head(mut self, method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        self.method = method.to_string();
        self.url = uri.to_string();

        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        self.headers = map;
        self
    }

    pub fn with_body_excerpt(mut self, body: &[u8]) -> Self {
        let end = body.len().min(BODY_EXCERPT_LIMIT);
        self.body = String::from_utf8_lossy(&body[..end]).into_owned();
        self
    }

    pub fn with_status(mut self, status: TrafficStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Calendar day (UTC) the record counts towards
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Daily counter names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    WebsiteRequests,
    BlockedByBlacklist,
    BlockedByRules,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::WebsiteRequests => "website_requests_total",
            Counter::BlockedByBlacklist => "blocked_by_blacklist_total",
            Counter::BlockedByRules => "blocked_by_rules_total",
        }
    }
}

/// Per-day totals. Counters only ever grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyMetricBucket {
    pub date: NaiveDate,
    pub website_requests_total: u64,
    pub blocked_by_blacklist_total: u64,
    pub blocked_by_rules_total: u64,
}

impl DailyMetricBucket {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            website_requests_total: 0,
            blocked_by_blacklist_total: 0,
            blocked_by_rules_total: 0,
        }
    }

    pub fn increment(&mut self, counter: Counter) {
        *self.slot(counter) += 1;
    }

    pub fn add(&mut self, counter: Counter, amount: u64) {
        *self.slot(counter) += amount;
    }

    pub fn get(&self, counter: Counter) -> u64 {
        match counter {
            Counter::WebsiteRequests => self.website_requests_total,
            Counter::BlockedByBlacklist => self.blocked_by_blacklist_total,
            Counter::BlockedByRules => self.blocked_by_rules_total,
        }
    }

    fn slot(&mut self, counter: Counter) -> &mut u64 {
        match counter {
            Counter::WebsiteRequests => &mut self.website_requests_total,
            Counter::BlockedByBlacklist => &mut self.blocked_by_blacklist_total,
            Counter::BlockedByRules => &mut self.blocked_by_rules_total,
        }
    }
}
