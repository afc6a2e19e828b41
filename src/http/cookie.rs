//! `Cookie` request header parsing and `Set-Cookie` generation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::Response;
use super::date::fmt_http_date;

/// Parses a `Cookie` request header (`a=1; b=2`) into a name → value map.
///
/// Pairs without `=` are skipped; surrounding double quotes on values are
/// stripped. When a name repeats, the first occurrence wins.
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for pair in header.split(';') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        cookies
            .entry(name.to_owned())
            .or_insert_with(|| value.to_owned());
    }
    cookies
}

/// A cookie to be sent to the client in a `Set-Cookie` header.
///
/// # Examples
///
/// ```
/// use capsela::http::Cookie;
///
/// let cookie = Cookie::new("_sid", "abc").path("/").http_only(true);
/// assert_eq!(cookie.to_header_value(), "_sid=abc; Path=/; HttpOnly");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    expires: Option<DateTime<Utc>>,
    domain: Option<String>,
    path: Option<String>,
    secure: bool,
    http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires: None,
            domain: None,
            path: None,
            secure: false,
            http_only: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn expires(mut self, at: DateTime<Utc>) -> Self {
        self.expires = Some(at);
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// Renders the `Set-Cookie` header value.
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(expires) = self.expires {
            out.push_str("; Expires=");
            out.push_str(&fmt_http_date(expires));
        }
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }

    /// Adds this cookie to `response` as a `Set-Cookie` header.
    pub fn set_in(&self, response: &mut Response) {
        response.add_header("Set-Cookie", self.to_header_value());
    }

    /// Tells the client to drop this cookie by expiring it at the epoch.
    pub fn unset_in(self, response: &mut Response) {
        self.expires(DateTime::UNIX_EPOCH).set_in(response);
    }
}
