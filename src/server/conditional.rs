//! Conditional GET: deciding whether the client's cached copy is still fresh.
//!
//! `If-None-Match` is checked against the response's `ETag`. When either
//! side lacks an entity tag, `If-Modified-Since` is compared with the
//! response's `Last-Modified` at one-second resolution, the granularity of
//! HTTP dates.

use chrono::{DateTime, Utc};

use crate::http::date::parse_http_date;
use crate::http::{Method, Request, Response};

/// Validators captured from a GET request before it enters the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conditional {
    if_none_match: Option<String>,
    if_modified_since: Option<DateTime<Utc>>,
}

impl Conditional {
    /// Captures the validators of `request`. Returns `None` for anything but
    /// a GET carrying at least one usable validator.
    pub fn from_request(request: &Request) -> Option<Self> {
        if request.method() != &Method::Get {
            return None;
        }
        let if_none_match = request.header("if-none-match").map(str::to_owned);
        let if_modified_since = request.header("if-modified-since").and_then(parse_http_date);
        if if_none_match.is_none() && if_modified_since.is_none() {
            return None;
        }
        Some(Self {
            if_none_match,
            if_modified_since,
        })
    }

    /// Returns `true` when `response` need not be sent because the client's
    /// copy is current.
    pub fn is_fresh(&self, response: &Response) -> bool {
        if let (Some(tags), Some(etag)) = (&self.if_none_match, response.etag()) {
            return etag_matches(tags, etag);
        }
        match (self.if_modified_since, response.last_modified_time()) {
            (Some(since), Some(modified)) => not_modified_since(modified, since),
            _ => false,
        }
    }
}

/// `modified <= since`, both truncated to whole seconds.
pub fn not_modified_since(modified: DateTime<Utc>, since: DateTime<Utc>) -> bool {
    modified.timestamp() <= since.timestamp()
}

// Weak comparison (RFC 9110 §8.8.3.2): the `W/` prefix is ignored.
fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let etag = etag.trim().trim_start_matches("W/");
    if_none_match.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.trim_start_matches("W/") == etag
    })
}
