//! The accept loop and the per-connection request loop.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::{Shared, tls};
use crate::http::body::Body;
use crate::http::request::{BodyLength, RequestError};
use crate::http::response::Framing;
use crate::http::{Method, Protocol, Request, Response, StatusCode, Version};
use crate::view::ViewError;

/// Largest request head we buffer before answering 413.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest request body we accept (8 MiB).
const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Read size when copying a streamed body into chunks.
const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
enum BodyError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    View(#[from] ViewError),

    #[error("body ended after {copied} of {expected} bytes")]
    Truncated { copied: u64, expected: u64 },
}

#[derive(Debug, Error)]
enum ChunkedError {
    #[error("malformed chunked body")]
    Malformed,

    #[error("chunked body exceeds the size limit")]
    TooLarge,
}

/// Where writing a response failed. Before the head is out the connection
/// error is reported as is; afterwards the client already has a status line
/// and the only remedy is closing the connection.
enum WriteError {
    Head(std::io::Error),
    Body(BodyError),
}

/// Accepts connections until `shutdown` fires (or its sender is dropped),
/// then drops the listener.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };

        debug!(peer = %peer_addr, "connection accepted");
        let shared = Arc::clone(&shared);
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => {
                        let identity = tls::client_identity(stream.get_ref().1);
                        let transport = Transport {
                            protocol: Protocol::Https,
                            client_identity: identity,
                        };
                        serve(stream, peer_addr, transport, shared).await
                    }
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
                        return;
                    }
                },
                None => serve(stream, peer_addr, Transport::plain(), shared).await,
            };
            if let Err(e) = result {
                warn!(peer = %peer_addr, error = %e, "connection closed with error");
            }
        });
    }
    debug!("listener closed");
}

/// What the transport established about a connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct Transport {
    pub protocol: Protocol,
    /// Set when the client presented a verified TLS certificate.
    pub client_identity: Option<String>,
}

impl Transport {
    pub fn plain() -> Self {
        Self::default()
    }
}

/// Serves requests on one connection until either side closes it.
///
/// HTTP/1.1 connections are persistent by default: we loop, answering one
/// request per iteration, until the peer closes the connection or either
/// side signals `Connection: close`.
pub(crate) async fn serve<S>(
    mut stream: S,
    peer_addr: SocketAddr,
    transport: Transport,
    shared: Arc<Shared>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Pipelined requests may already be buffered.
        let parsed = if buf.is_empty() {
            Err(RequestError::Incomplete)
        } else {
            Request::parse(&buf)
        };

        let (request, head_len) = match parsed {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if buf.len() > MAX_HEAD_SIZE {
                    warn!(peer = %peer_addr, "request head too large - sending 413");
                    let status = StatusCode::PAYLOAD_TOO_LARGE;
                    return reject(&mut stream, &shared, status, "Request head too large").await;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    return Ok(());
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request - sending 400");
                let message = format!("Bad Request: {e}");
                return reject(&mut stream, &shared, StatusCode::BAD_REQUEST, message).await;
            }
        };

        let length = match request.body_length() {
            Ok(length) => length,
            Err(e) => {
                let status = match e {
                    RequestError::UnsupportedTransferCoding(_) => StatusCode::NOT_IMPLEMENTED,
                    _ => StatusCode::BAD_REQUEST,
                };
                warn!(peer = %peer_addr, error = %e, status = status.as_u16(), "unusable body framing - rejecting");
                let message = format!("{}: {e}", status.canonical_reason());
                return reject(&mut stream, &shared, status, message).await;
            }
        };

        let body = match length {
            BodyLength::Fixed(content_length) => {
                if content_length > MAX_BODY_SIZE {
                    warn!(peer = %peer_addr, length = content_length, "request body too large - sending 413");
                    let status = StatusCode::PAYLOAD_TOO_LARGE;
                    return reject(&mut stream, &shared, status, "Request entity too large").await;
                }
                while buf.len() < head_len + content_length {
                    if stream.read_buf(&mut buf).await? == 0 {
                        debug!(peer = %peer_addr, "connection closed mid-body");
                        return Ok(());
                    }
                }
                buf.advance(head_len);
                buf.split_to(content_length).freeze()
            }
            BodyLength::Chunked => loop {
                match decode_chunked(&buf[head_len..], MAX_BODY_SIZE) {
                    Ok(Some((body, used))) => {
                        buf.advance(head_len + used);
                        break body.freeze();
                    }
                    Ok(None) => {
                        if buf.len() - head_len > MAX_BODY_SIZE + MAX_HEAD_SIZE {
                            warn!(peer = %peer_addr, "chunked body too large - sending 413");
                            let status = StatusCode::PAYLOAD_TOO_LARGE;
                            return reject(&mut stream, &shared, status, "Request entity too large").await;
                        }
                        if stream.read_buf(&mut buf).await? == 0 {
                            debug!(peer = %peer_addr, "connection closed mid-body");
                            return Ok(());
                        }
                    }
                    Err(ChunkedError::TooLarge) => {
                        warn!(peer = %peer_addr, "chunked body too large - sending 413");
                        let status = StatusCode::PAYLOAD_TOO_LARGE;
                        return reject(&mut stream, &shared, status, "Request entity too large").await;
                    }
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "bad chunked body - sending 400");
                        let message = format!("Bad Request: {e}");
                        return reject(&mut stream, &shared, StatusCode::BAD_REQUEST, message).await;
                    }
                }
            },
        };

        let mut request = request.with_protocol(transport.protocol);
        if let Some(identity) = &transport.client_identity {
            request = request.with_client_identity(identity.as_str());
        }
        if !body.is_empty() {
            request = request.with_body(body);
        }

        let access = AccessLine::new(&request);
        let version = request.version();
        let keep_alive = request.is_keep_alive();
        let head_only = request.method() == &Method::Head;

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = shared.handle(request).await;
        let status = response.status();
        let written = write_response(&mut stream, response, version, keep_alive, head_only).await;
        access.emit(status);

        match written {
            Ok(true) => {}
            Ok(false) => {
                debug!(peer = %peer_addr, "connection close requested, shutting down");
                stream.shutdown().await?;
                return Ok(());
            }
            Err(WriteError::Head(e)) => return Err(e),
            Err(WriteError::Body(e)) => {
                error!(peer = %peer_addr, error = %e, "error while streaming response body");
                let _ = stream.shutdown().await;
                return Ok(());
            }
        }
    }
}

/// Decodes a chunked request body from the start of `buf`.
///
/// Returns the decoded body and the number of bytes it occupied on the
/// wire, trailer section included, or `None` until all of it has arrived.
/// Trailer fields are read past and dropped.
fn decode_chunked(buf: &[u8], limit: usize) -> Result<Option<(BytesMut, usize)>, ChunkedError> {
    let mut body = BytesMut::new();
    let mut pos = 0;
    loop {
        let (size_len, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(pair)) => pair,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(ChunkedError::Malformed),
        };
        pos += size_len;
        if size == 0 {
            break;
        }
        let size = usize::try_from(size).map_err(|_| ChunkedError::TooLarge)?;
        if body.len().saturating_add(size) > limit {
            return Err(ChunkedError::TooLarge);
        }
        if buf.len() < pos + size + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        pos += size;
        if &buf[pos..pos + 2] != b"\r\n" {
            return Err(ChunkedError::Malformed);
        }
        pos += 2;
    }

    loop {
        let Some(line_len) = buf[pos..].windows(2).position(|pair| pair == b"\r\n") else {
            return Ok(None);
        };
        pos += line_len + 2;
        if line_len == 0 {
            return Ok(Some((body, pos)));
        }
    }
}

/// Answers a request that never reached the pipeline, then closes.
async fn reject<S>(
    stream: &mut S,
    shared: &Shared,
    status: StatusCode,
    message: impl Into<String>,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = shared.finalize(Response::new(status).body(message));
    match write_response(stream, response, Version::Http11, false, false).await {
        Ok(_) => stream.shutdown().await,
        Err(WriteError::Head(e)) => Err(e),
        Err(WriteError::Body(e)) => Err(std::io::Error::other(e)),
    }
}

/// Writes `response` and reports whether the connection may be reused.
async fn write_response<S>(
    stream: &mut S,
    response: Response,
    version: Version,
    keep_alive: bool,
    head_only: bool,
) -> Result<bool, WriteError>
where
    S: AsyncWrite + Unpin,
{
    let keep_alive = keep_alive && response.is_keep_alive();
    let response = response.keep_alive(keep_alive);
    let framing = response.framing(version == Version::Http11, head_only);

    stream
        .write_all(&response.encode_head(framing))
        .await
        .map_err(WriteError::Head)?;

    if !head_only && framing != Framing::None {
        write_body(stream, response.into_body(), framing)
            .await
            .map_err(WriteError::Body)?;
    }
    stream
        .flush()
        .await
        .map_err(|e| WriteError::Body(e.into()))?;

    Ok(keep_alive && framing != Framing::Close)
}

async fn write_body<S>(stream: &mut S, body: Body, framing: Framing) -> Result<(), BodyError>
where
    S: AsyncWrite + Unpin,
{
    match body {
        Body::Empty => {}
        Body::Full(bytes) => stream.write_all(&bytes).await?,
        Body::Stream { mut reader, .. } => match framing {
            Framing::Length(expected) => {
                let mut limited = reader.take(expected);
                let copied = tokio::io::copy(&mut limited, stream).await?;
                if copied != expected {
                    return Err(BodyError::Truncated { copied, expected });
                }
            }
            Framing::Chunked => copy_chunked(&mut reader, stream).await?,
            Framing::Close => {
                tokio::io::copy(&mut reader, stream).await?;
            }
            Framing::None => {}
        },
        Body::View { view, model } => {
            let rendered = view.render(&model)?;
            if framing == Framing::Chunked {
                if !rendered.is_empty() {
                    write_chunk(stream, rendered.as_bytes()).await?;
                }
                stream.write_all(b"0\r\n\r\n").await?;
            } else {
                stream.write_all(rendered.as_bytes()).await?;
            }
        }
    }
    Ok(())
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        write_chunk(writer, &chunk[..n]).await?;
    }
    writer.write_all(b"0\r\n\r\n").await
}

async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await
}

/// What the access log needs, captured before the request is consumed.
struct AccessLine {
    host: String,
    method: Method,
    url: String,
    version: Version,
    started: Instant,
}

impl AccessLine {
    fn new(request: &Request) -> Self {
        Self {
            host: request.host().unwrap_or("-").to_owned(),
            method: request.method().clone(),
            url: request.url().to_owned(),
            version: request.version(),
            started: request.started(),
        }
    }

    /// `<host|-> <METHOD> <url> HTTP/<version> <status> <elapsed ms>`
    fn line(&self, status: StatusCode) -> String {
        format!(
            "{} {} {} HTTP/{} {} {}",
            self.host,
            self.method,
            self.url,
            self.version.as_str(),
            status.as_u16(),
            self.started.elapsed().as_millis()
        )
    }

    fn emit(&self, status: StatusCode) {
        info!(target: "capsela::access", "{}", self.line(status));
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::resolver::ResolverRegistry;
    use crate::stage::{BoxFuture, Next, Pipeline, Stage, StageResult};
    use crate::view::JsonView;

    struct Echo;

    impl Stage for Echo {
        fn service<'a>(
            &'a self,
            request: &'a mut Request,
            _: Next<'a>,
        ) -> BoxFuture<'a, StageResult> {
            Box::pin(async move {
                let response = match request.path() {
                    "/stream" => Response::new(StatusCode::OK).stream(&b"streamed"[..], None),
                    "/sized" => Response::new(StatusCode::OK).stream(&b"sized"[..], Some(5)),
                    "/short" => Response::new(StatusCode::OK).stream(&b"abc"[..], Some(10)),
                    "/view" => Response::new(StatusCode::OK)
                        .view(Arc::new(JsonView::new()), serde_json::json!({"ok": true})),
                    "/missing" => return Ok(None),
                    "/whoami" => {
                        let who = format!(
                            "{} {}",
                            request.protocol().as_str(),
                            request.client_identity().unwrap_or("anonymous")
                        );
                        Response::new(StatusCode::OK).body(who)
                    }
                    _ => {
                        let body = request.take_body().unwrap_or_default();
                        Response::new(StatusCode::OK).body_bytes(body)
                    }
                };
                Ok(Some(response))
            })
        }
    }

    fn shared() -> Arc<Shared> {
        Arc::new(Shared {
            pipeline: Arc::new(Pipeline::new().stage(Echo)),
            resolver: Arc::new(ResolverRegistry::new()),
            name: "Capsela".into(),
        })
    }

    /// Feeds `raw` to a connection and returns everything it wrote back.
    async fn exchange(raw: &[u8]) -> String {
        exchange_over(raw, Transport::plain()).await
    }

    async fn exchange_over(raw: &[u8], transport: Transport) -> String {
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(serve(
            server,
            "127.0.0.1:9".parse().unwrap(),
            transport,
            shared(),
        ));
        client.write_all(raw).await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let _ = task.await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn echoes_a_posted_body() {
        let out = exchange(
            b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.contains("Server: Capsela\r\n"));
        assert!(out.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let out = exchange(
            b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\nGET /echo HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        let not_found = out.find("HTTP/1.1 404 Not Found").unwrap();
        let ok = out.find("HTTP/1.1 200 OK").unwrap();
        assert!(not_found < ok);
        assert!(out.contains("not found"));
    }

    #[tokio::test]
    async fn unknown_length_stream_is_chunked() {
        let out = exchange(b"GET /stream HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(out.contains("Transfer-Encoding: chunked\r\n"));
        assert!(out.ends_with("\r\n\r\n8\r\nstreamed\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn http10_stream_is_close_delimited() {
        let out = exchange(b"GET /stream HTTP/1.0\r\n\r\n").await;
        assert!(out.contains("Connection: close\r\n"));
        assert!(!out.contains("Transfer-Encoding"));
        assert!(out.ends_with("\r\n\r\nstreamed"));
    }

    #[tokio::test]
    async fn known_length_stream_gets_content_length() {
        let out = exchange(b"GET /sized HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\nsized"));
    }

    #[tokio::test]
    async fn short_stream_closes_the_connection() {
        let out = exchange(b"GET /short HTTP/1.1\r\n\r\nGET /echo HTTP/1.1\r\n\r\n").await;
        // the second request is never answered
        assert_eq!(out.matches("HTTP/1.1 ").count(), 1);
        assert!(out.ends_with("abc"));
    }

    #[tokio::test]
    async fn views_render_after_the_head() {
        let out = exchange(b"GET /view HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(out.contains("Content-Type: application/json\r\n"));
        assert!(out.contains("Transfer-Encoding: chunked\r\n"));
        assert!(out.contains("{\"ok\":true}"));
    }

    #[tokio::test]
    async fn head_sends_no_body() {
        let out = exchange(b"HEAD /echo HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn malformed_request_is_400() {
        let out = exchange(b"GARBAGE\x01 / HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.contains("Date: "));
        assert!(out.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn bad_content_length_is_400() {
        let out = exchange(b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn transport_identity_reaches_every_request() {
        let raw = b"GET /whoami HTTP/1.1\r\n\r\nGET /whoami HTTP/1.1\r\nConnection: close\r\n\r\n";
        let transport = Transport {
            protocol: Protocol::Https,
            client_identity: Some("sha256:abcd".into()),
        };
        let out = exchange_over(raw, transport).await;
        assert_eq!(out.matches("https sha256:abcd").count(), 2);

        let out = exchange(b"GET /whoami HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(out.ends_with("http anonymous"));
    }

    #[test]
    fn access_line_format() {
        let (request, _) = Request::parse(b"get /a?b=1 HTTP/1.0\r\n\r\n").unwrap();
        let line = AccessLine::new(&request).line(StatusCode::NOT_FOUND);
        assert!(line.starts_with("- GET /a?b=1 HTTP/1.0 404 "), "{line}");
        assert!(line.rsplit(' ').next().unwrap().parse::<u128>().is_ok());

        let request = Request::new(Method::Post, "/upload").with_header("Host", "example.com");
        let line = AccessLine::new(&request).line(StatusCode::OK);
        assert!(line.starts_with("example.com POST /upload HTTP/1.1 200 "), "{line}");
    }

    #[test]
    fn chunked_bodies_decode() {
        let wire = b"5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\nGET";
        let (body, used) = decode_chunked(wire, 1024).unwrap().unwrap();
        assert_eq!(&body[..], b"hello world");
        assert_eq!(&wire[used..], b"GET");

        assert!(decode_chunked(b"5\r\nhel", 1024).unwrap().is_none());
        assert!(decode_chunked(b"0\r\n", 1024).unwrap().is_none());
        assert!(matches!(decode_chunked(b"zz\r\n", 1024), Err(ChunkedError::Malformed)));
        assert!(matches!(decode_chunked(b"5\r\nhelloXX0\r\n\r\n", 1024), Err(ChunkedError::Malformed)));
        assert!(matches!(decode_chunked(b"400\r\n", 16), Err(ChunkedError::TooLarge)));
    }

    #[tokio::test]
    async fn chunked_request_body_reaches_the_stage() {
        let out = exchange(
            b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n0\r\n\r\n\
              GET /echo HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.contains("\r\n\r\nhello"));
        assert!(!out.contains("400 Bad Request"));
    }

    #[tokio::test]
    async fn conflicting_framing_is_rejected() {
        let out = exchange(
            b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(out.matches("HTTP/1.1 ").count(), 1);

        let out = exchange(b"POST /echo HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 501 Not Implemented\r\n"));
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let raw = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_BODY_SIZE + 1);
        let out = exchange(raw.as_bytes()).await;
        assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }
}
