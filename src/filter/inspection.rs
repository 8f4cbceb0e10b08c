//! Content inspection against interception patterns
//!
//! For each pattern, in snapshot order: skip it when its method scope does not
//! match, then try the URL path, the body (when non-empty) and every header
//! value. The first hit wins.

use std::borrow::Cow;
use std::fmt;

use crate::rules::{CompiledPattern, RuleSnapshot};

use super::InspectedRequest;

/// Part of the request a pattern matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Path,
    Body,
    Header,
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Surface::Path => write!(f, "path"),
            Surface::Body => write!(f, "body"),
            Surface::Header => write!(f, "header"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PatternMatch<'a> {
    pub pattern: &'a CompiledPattern,
    pub surface: Surface,
}

/// First pattern in `snapshot` matching `request`, if any
pub fn first_match<'a>(
    request: &InspectedRequest,
    snapshot: &'a RuleSnapshot,
) -> Option<PatternMatch<'a>> {
    if snapshot.patterns().is_empty() {
        return None;
    }

    let path = percent_decode(request.path());
    let body = String::from_utf8_lossy(request.body());

    snapshot.patterns().iter().find_map(|pattern| {
        match_surface(pattern, request, &path, &body).map(|surface| PatternMatch { pattern, surface })
    })
}

fn match_surface(
    pattern: &CompiledPattern,
    request: &InspectedRequest,
    path: &str,
    body: &str,
) -> Option<Surface> {
    if !pattern.pattern().applies_to(request.method()) {
        return None;
    }

    // malformed regexes are reported once when the snapshot is built
    let regex = pattern.regex()?;

    if regex.is_match(path) || (path != request.path() && regex.is_match(request.path())) {
        return Some(Surface::Path);
    }

    if !body.is_empty() && regex.is_match(body) {
        return Some(Surface::Body);
    }

    request
        .headers()
        .values()
        .any(|value| regex.is_match(&String::from_utf8_lossy(value.as_bytes())))
        .then_some(Surface::Header)
}

/// Decode `%XX` escapes in a URL path, leaving malformed escapes as-is
fn percent_decode(path: &str) -> Cow<'_, str> {
    if !path.contains('%') {
        return Cow::Borrowed(path);
    }

    let bytes = path.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                decoded.push(value);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    Cow::Owned(String::from_utf8_lossy(&decoded).into_owned())
}
