//! Immutable rule views and the external rule document schema

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use hyper::Method;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use super::RuleError;

/// List membership of an IP address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpClassification {
    #[serde(alias = "whitelist")]
    Whitelisted,
    #[serde(alias = "blacklist")]
    Blacklisted,
}

impl fmt::Display for IpClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpClassification::Whitelisted => write!(f, "whitelisted"),
            IpClassification::Blacklisted => write!(f, "blacklisted"),
        }
    }
}

impl FromStr for IpClassification {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "whitelist" | "whitelisted" => Ok(IpClassification::Whitelisted),
            "blacklist" | "blacklisted" => Ok(IpClassification::Blacklisted),
            other => Err(RuleError::UnknownClassification(other.to_string())),
        }
    }
}

/// Result of looking an address up in both lists.
///
/// Blacklist membership wins over whitelist membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpStatus {
    Blacklisted,
    Whitelisted,
    Neutral,
}

impl IpStatus {
    /// `(allowed, in_whitelist)` pair as exposed by `RuleStore::is_ip_allowed`
    pub fn as_pair(self) -> (bool, bool) {
        match self {
            IpStatus::Blacklisted => (false, false),
            IpStatus::Whitelisted => (true, true),
            IpStatus::Neutral => (true, false),
        }
    }
}

/// Normalize an address string for rule matching.
///
/// IPv4-mapped IPv6 addresses collapse to their IPv4 form. Returns `None`
/// when the input is not an IP address.
pub fn normalize_ip(ip: &str) -> Option<String> {
    ip.trim()
        .parse::<IpAddr>()
        .ok()
        .map(|addr| addr.to_canonical().to_string())
}

/// Content inspection pattern as stored in the external rule store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptionPattern {
    pub name: String,
    pub regex: String,
    /// HTTP method the pattern is scoped to; `None` applies to every method
    #[serde(default, deserialize_with = "empty_as_none")]
    pub method: Option<String>,
}

impl InterceptionPattern {
    pub fn new(name: impl Into<String>, regex: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            regex: regex.into(),
            method: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        let method = method.into();
        self.method = if method.trim().is_empty() {
            None
        } else {
            Some(method.trim().to_string())
        };
        self
    }

    /// Methods are case-sensitive tokens: a pattern scoped to `post` never
    /// sees `POST` requests
    pub fn applies_to(&self, method: &Method) -> bool {
        match &self.method {
            Some(scoped) => scoped == method.as_str(),
            None => true,
        }
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty()))
}

/// Pattern with its regex compiled once per snapshot build
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pattern: InterceptionPattern,
    regex: Option<Regex>,
}

impl CompiledPattern {
    pub fn compile(pattern: InterceptionPattern) -> Self {
        let regex = match Regex::new(&pattern.regex) {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::warn!(
                    pattern = %pattern.name,
                    error = %e,
                    "Malformed interception regex, pattern will be skipped"
                );
                None
            }
        };

        Self { pattern, regex }
    }

    pub fn name(&self) -> &str {
        &self.pattern.name
    }

    pub fn pattern(&self) -> &InterceptionPattern {
        &self.pattern
    }

    /// Compiled regex, `None` when the source failed to compile
    pub fn regex(&self) -> Option<&Regex> {
        self.regex.as_ref()
    }
}

/// External rule document: `{whitelist, blacklist, patterns}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<InterceptionPattern>,
}

/// Point-in-time view of every IP and content rule.
///
/// Never mutated after construction; `RuleStore` swaps whole snapshots.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    whitelist: BTreeSet<String>,
    blacklist: BTreeSet<String>,
    patterns: Vec<CompiledPattern>,
}

impl RuleSnapshot {
    pub fn from_rule_set(rules: RuleSet) -> Self {
        let whitelist = normalize_list(rules.whitelist, "whitelist");
        let blacklist = normalize_list(rules.blacklist, "blacklist");

        let overlap = whitelist.intersection(&blacklist).count();
        if overlap > 0 {
            tracing::warn!(overlap, "IPs present in both lists, blacklist takes precedence");
        }

        let mut names = BTreeSet::new();
        let mut patterns = Vec::with_capacity(rules.patterns.len());
        for pattern in rules.patterns {
            if !names.insert(pattern.name.clone()) {
                tracing::warn!(pattern = %pattern.name, "Duplicate pattern name ignored");
                continue;
            }
            patterns.push(CompiledPattern::compile(pattern));
        }

        Self {
            whitelist,
            blacklist,
            patterns,
        }
    }

    pub fn to_rule_set(&self) -> RuleSet {
        RuleSet {
            whitelist: self.whitelist.iter().cloned().collect(),
            blacklist: self.blacklist.iter().cloned().collect(),
            patterns: self.patterns.iter().map(|p| p.pattern.clone()).collect(),
        }
    }

    /// Classify an already normalized address
    pub fn classify(&self, ip: &str) -> IpStatus {
        if self.blacklist.contains(ip) {
            IpStatus::Blacklisted
        } else if self.whitelist.contains(ip) {
            IpStatus::Whitelisted
        } else {
            IpStatus::Neutral
        }
    }

    /// Patterns in evaluation order
    pub fn patterns(&self) -> &[CompiledPattern] {
        &self.patterns
    }

    pub fn whitelist(&self) -> &BTreeSet<String> {
        &self.whitelist
    }

    pub fn blacklist(&self) -> &BTreeSet<String> {
        &self.blacklist
    }

    pub fn ip_rule(&self, ip: &str) -> Option<IpClassification> {
        if self.blacklist.contains(ip) {
            Some(IpClassification::Blacklisted)
        } else if self.whitelist.contains(ip) {
            Some(IpClassification::Whitelisted)
        } else {
            None
        }
    }

    pub fn pattern(&self, name: &str) -> Option<&CompiledPattern> {
        self.patterns.iter().find(|p| p.name() == name)
    }

    pub(super) fn with_ip_rule(&self, ip: String, classification: IpClassification) -> Self {
        let mut next = self.clone();
        match classification {
            IpClassification::Whitelisted => {
                next.blacklist.remove(&ip);
                next.whitelist.insert(ip);
            }
            IpClassification::Blacklisted => {
                next.whitelist.remove(&ip);
                next.blacklist.insert(ip);
            }
        }
        next
    }

    pub(super) fn without_ip_rule(&self, ip: &str) -> Option<Self> {
        if !self.whitelist.contains(ip) && !self.blacklist.contains(ip) {
            return None;
        }
        let mut next = self.clone();
        next.whitelist.remove(ip);
        next.blacklist.remove(ip);
        Some(next)
    }

    pub(super) fn with_pattern(&self, pattern: InterceptionPattern) -> Self {
        let mut next = self.clone();
        next.patterns.push(CompiledPattern::compile(pattern));
        next
    }

    pub(super) fn without_pattern(&self, name: &str) -> Option<Self> {
        let index = self.patterns.iter().position(|p| p.name() == name)?;
        let mut next = self.clone();
        next.patterns.remove(index);
        Some(next)
    }
}

fn normalize_list(entries: Vec<String>, list: &str) -> BTreeSet<String> {
    entries
        .into_iter()
        .filter_map(|entry| match normalize_ip(&entry) {
            Some(ip) => Some(ip),
            None => {
                tracing::warn!(list, entry = %entry, "Ignoring entry that is not an IP address");
                None
            }
        })
        .collect()
}
