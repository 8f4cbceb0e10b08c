//! Stone - inline intercepting HTTP firewall
//!
//! Reverse proxy that decides per request whether to forward or block:
//! - IP reputation (whitelist / blacklist, blacklist wins)
//! - Regex content inspection of path, body and header values
//! - Randomized decoy responses for blocked requests
//! - Daily counters and traffic log records for every decision

pub mod config;
pub mod decoy;
pub mod error;
pub mod filter;
pub mod proxy;
pub mod rules;
pub mod server;
pub mod storage;
pub mod telemetry;
