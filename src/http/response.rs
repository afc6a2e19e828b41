//! HTTP response builder and head serialization.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;

use super::body::Body;
use super::date::{fmt_http_date, parse_http_date};
use super::{Headers, StatusCode};
use crate::view::View;

/// Errors produced by [`Response::redirect`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RedirectError {
    #[error("can't redirect without location")]
    MissingLocation,

    #[error("the redirect location must be an absolute URL, including scheme")]
    NotAbsolute,
}

/// How the body length is communicated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// No body may follow (204, 304, 1xx).
    None,
    Length(u64),
    Chunked,
    /// The body runs until the connection closes (HTTP/1.0 streams).
    Close,
}

/// An HTTP response produced by a stage.
///
/// # Examples
///
/// ```
/// use capsela::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// assert_eq!(response.status(), StatusCode::OK);
/// assert_eq!(response.headers().get("content-type"), Some("application/json"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
            keep_alive: true,
        }
    }

    /// A redirect to the absolute URL `location`; `status` defaults to 301.
    ///
    /// # Errors
    ///
    /// [`RedirectError`] when `location` is empty or has no `http(s)://` scheme.
    pub fn redirect(
        location: impl Into<String>,
        status: Option<StatusCode>,
    ) -> Result<Self, RedirectError> {
        let location = location.into();
        if location.is_empty() {
            return Err(RedirectError::MissingLocation);
        }
        if !(location.starts_with("http://") || location.starts_with("https://")) {
            return Err(RedirectError::NotAbsolute);
        }
        Ok(Self::new(status.unwrap_or(StatusCode::MOVED_PERMANENTLY)).header("Location", location))
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in place, for stages decorating a downstream response.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Replaces every header named `name` with a single `name: value`.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Sets a text body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(Bytes::from(body.into()));
        self
    }

    /// Sets a binary body.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Streams the body from `reader`. `length` becomes `Content-Length` when known.
    #[must_use]
    pub fn stream<R>(mut self, reader: R, length: Option<u64>) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        self.body = Body::Stream {
            reader: Box::pin(reader),
            length,
        };
        self
    }

    /// Defers the body to `view`, rendered with `model` when the body is written.
    #[must_use]
    pub fn view(mut self, view: Arc<dyn View>, model: serde_json::Value) -> Self {
        self.body = Body::View { view, model };
        self
    }

    /// Stamps `Last-Modified`. HTTP dates have one-second resolution.
    #[must_use]
    pub fn last_modified(mut self, at: DateTime<Utc>) -> Self {
        self.headers.set("Last-Modified", fmt_http_date(at));
        self
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The parsed `Last-Modified` header, if present and well formed.
    pub fn last_modified_time(&self) -> Option<DateTime<Utc>> {
        self.headers.get("last-modified").and_then(parse_http_date)
    }

    /// The `ETag` header, if present.
    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag")
    }

    /// Decides how this response's body is delimited on a connection that
    /// does or does not support chunked encoding.
    pub(crate) fn framing(&self, chunked_ok: bool, head_only: bool) -> Framing {
        if self.status.forbids_body() {
            return Framing::None;
        }
        match &self.body {
            Body::Empty => Framing::Length(0),
            Body::Full(bytes) => Framing::Length(bytes.len() as u64),
            Body::Stream {
                length: Some(length),
                ..
            } => Framing::Length(*length),
            // HEAD carries no body, so there is nothing to delimit
            _ if head_only => Framing::None,
            _ if chunked_ok => Framing::Chunked,
            _ => Framing::Close,
        }
    }

    /// Serializes the status line and headers.
    ///
    /// Adds a default `Content-Type` for bodies that lack one, then the
    /// connection and framing headers, then the stage headers in insertion
    /// order, and finally the blank line.
    pub(crate) fn encode_head(&self, framing: Framing) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        if framing != Framing::None && !self.headers.contains("content-type") {
            let content_type = match &self.body {
                Body::Empty => None,
                Body::View { view, .. } => Some(view.content_type()),
                _ => Some("text/plain; charset=utf-8"),
            };
            if let Some(content_type) = content_type {
                buf.put(format!("Content-Type: {content_type}\r\n").as_bytes());
            }
        }

        let keep_alive = self.keep_alive && framing != Framing::Close;
        let connection = if keep_alive { "keep-alive" } else { "close" };
        buf.put(format!("Connection: {connection}\r\n").as_bytes());

        match framing {
            Framing::Length(length) => {
                buf.put(format!("Content-Length: {length}\r\n").as_bytes());
            }
            Framing::Chunked => buf.put(&b"Transfer-Encoding: chunked\r\n"[..]),
            Framing::None | Framing::Close => {}
        }

        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
                || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        buf.put(&b"\r\n"[..]);
        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}
