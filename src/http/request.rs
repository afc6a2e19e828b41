//! Inbound requests: HTTP/1.x head parsing with [`httparse`] and the
//! per-request state stages read and augment.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;

use super::cookie::parse_cookie_header;
use super::{Headers, Method, Version};
use crate::context::{Extensions, Parameters};
use crate::resolver::ResolverRegistry;

/// Errors that can occur while parsing an HTTP/1.x request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("both Transfer-Encoding and Content-Length are present")]
    AmbiguousLength,

    #[error("unsupported transfer coding: {0}")]
    UnsupportedTransferCoding(String),
}

/// How the body after a request head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// Exactly this many bytes (zero when there is no body).
    Fixed(usize),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

/// The transport a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// A single inbound HTTP request as it travels down the stage chain.
///
/// Stages receive it as `&mut Request`. They fill [`params_mut`](Self::params_mut)
/// and [`extensions_mut`](Self::extensions_mut) as they go; each stage keeps
/// its contribution under its own type in the extensions map.
///
/// # Examples
///
/// ```
/// use capsela::http::{Method, Request};
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\nCookie: _sid=abc\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method(), &Method::Get);
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.url(), "/hello?name=world");
/// assert_eq!(request.params().get("name"), Some("world"));
/// assert_eq!(request.cookie("_sid"), Some("abc"));
/// ```
pub struct Request {
    method: Method,
    url: String,
    path: String,
    query: Option<String>,
    version: Version,
    headers: Headers,
    params: Parameters,
    cookies: OnceLock<HashMap<String, String>>,
    body: Option<Bytes>,
    protocol: Protocol,
    client_identity: Option<String>,
    started: Instant,
    resolver: Arc<ResolverRegistry>,
    extensions: Extensions,
}

impl Request {
    /// Maximum number of headers we accept per request.
    const MAX_HEADERS: usize = 64;

    /// Creates a request for `method` and `url` with no headers and no body.
    ///
    /// The start timestamp used for elapsed-time reporting is taken now.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let url = url.into();
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (url.clone(), None),
        };
        let params = query
            .as_deref()
            .map(Parameters::from_query)
            .unwrap_or_default();

        Self {
            method,
            url,
            path,
            query,
            version: Version::Http11,
            headers: Headers::new(),
            params,
            cookies: OnceLock::new(),
            body: None,
            protocol: Protocol::Http,
            client_identity: None,
            started: Instant::now(),
            resolver: Arc::default(),
            extensions: Extensions::new(),
        }
    }

    /// Parses a request head from `buf`.
    ///
    /// Returns the request and the offset at which its body starts. The body
    /// itself is not attached; the connection reads `Content-Length` bytes
    /// and hands them over with [`with_body`](Self::with_body).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the head has not fully arrived yet.
    /// - [`RequestError::Parse`]: the data is not a valid HTTP/1.x head.
    /// - [`RequestError::MissingField`]: method, path or version is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw_req.method {
            Some(token) => match token.parse() {
                Ok(method) => method,
                Err(never) => match never {},
            },
            None => return Err(RequestError::MissingField { field: "method" }),
        };
        let url = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut request = Self::new(method, url);
        request.version = Version::from_minor(version);
        request.headers = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                request.headers.insert(header.name, value);
            }
        }

        Ok((request, body_offset))
    }

    /// Appends a header. Builder form for requests constructed in code.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self.cookies = OnceLock::new();
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Records the identity the transport authenticated the client as.
    #[must_use]
    pub fn with_client_identity(mut self, identity: impl Into<String>) -> Self {
        self.client_identity = Some(identity.into());
        self
    }

    pub(crate) fn attach_resolver(&mut self, resolver: Arc<ResolverRegistry>) {
        self.resolver = resolver;
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target exactly as received, query string included.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Shorthand for `headers().get(name)`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The `Host` header, if the client sent one.
    pub fn host(&self) -> Option<&str> {
        self.headers.get("host")
    }

    /// Request parameters: the query string, plus whatever stages added.
    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    /// Cookies sent with the request, parsed on first access.
    pub fn cookies(&self) -> &HashMap<String, String> {
        self.cookies.get_or_init(|| {
            self.headers
                .get_all("cookie")
                .flat_map(|header| parse_cookie_header(header))
                .collect()
        })
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies().get(name).map(String::as_str)
    }

    /// The request body, unless a stage has already taken it.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Takes ownership of the request body. Later calls return `None`.
    pub fn take_body(&mut self) -> Option<Bytes> {
        self.body.take()
    }

    /// Discards whatever body no stage consumed. Returns the number of bytes
    /// dropped.
    pub fn drain_body(&mut self) -> usize {
        self.body.take().map_or(0, |body| body.len())
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn client_identity(&self) -> Option<&str> {
        self.client_identity.as_deref()
    }

    /// When the request was created.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Time since the request was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The server's resolver registry, for turning symbolic references into
    /// URLs (see [`ResolverRegistry::resolve_uri`]).
    pub fn resolver(&self) -> &ResolverRegistry {
        &self.resolver
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => !conn.eq_ignore_ascii_case("close")
                && (self.version == Version::Http11 || conn.eq_ignore_ascii_case("keep-alive")),
            None => self.version == Version::Http11,
        }
    }

    /// The `Content-Length` header as a number; `Ok(0)` when absent.
    ///
    /// # Errors
    ///
    /// [`RequestError::InvalidContentLength`] when the header is not a number.
    pub fn content_length(&self) -> Result<usize, RequestError> {
        match self.headers.get("content-length") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| RequestError::InvalidContentLength),
            None => Ok(0),
        }
    }

    /// Works out how the body is framed on the wire.
    ///
    /// Only `chunked` is understood as a transfer coding, and a request may
    /// not carry both `Transfer-Encoding` and `Content-Length`.
    ///
    /// # Errors
    ///
    /// - [`RequestError::AmbiguousLength`]: both framing headers are present.
    /// - [`RequestError::UnsupportedTransferCoding`]: any coding list other
    ///   than a lone `chunked`.
    /// - [`RequestError::InvalidContentLength`]: see [`content_length`](Self::content_length).
    pub fn body_length(&self) -> Result<BodyLength, RequestError> {
        if !self.headers.contains("transfer-encoding") {
            return self.content_length().map(BodyLength::Fixed);
        }
        if self.headers.contains("content-length") {
            return Err(RequestError::AmbiguousLength);
        }
        let codings: Vec<&str> = self
            .headers
            .get_all("transfer-encoding")
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|coding| !coding.is_empty())
            .collect();
        match codings.as_slice() {
            [coding] if coding.eq_ignore_ascii_case("chunked") => Ok(BodyLength::Chunked),
            _ => Err(RequestError::UnsupportedTransferCoding(codings.join(", "))),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}
