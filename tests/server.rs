//! End-to-end tests over a real socket.

use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;

use capsela::config::ServerConfig;
use capsela::http::date::fmt_http_date;
use capsela::stage::{BoxFuture, Next, Pipeline, Stage, StageError, StageResult};
use capsela::stages::{FileServer, MemorySessionStore, SessionManager};
use capsela::{Request, Response, Server, StatusCode};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Routes;

impl Stage for Routes {
    fn service<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            match request.path() {
                "/ok" => Ok(Some(Response::new(StatusCode::OK).body("ok"))),
                "/boom" => Err(StageError::msg("boom")),
                "/echo" => {
                    let body = request.take_body().unwrap_or_default();
                    Ok(Some(Response::new(StatusCode::OK).body_bytes(body)))
                }
                _ => next.pass(request).await,
            }
        })
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start(pipeline: Pipeline) -> (Server, SocketAddr) {
    init_tracing();
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        name: "capsela-test".into(),
        ..ServerConfig::default()
    };
    let mut server = Server::new(config, pipeline);
    let addr = server.start().await.unwrap();
    (server, addr)
}

/// Sends `raw` on a fresh connection and reads until the server closes it.
async fn roundtrip(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
}

#[tokio::test]
async fn answers_and_stamps_headers() {
    let (mut server, addr) = start(Pipeline::new().stage(Routes)).await;

    let out = roundtrip(addr, &get("/ok")).await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Server: capsela-test\r\n"));
    assert!(out.contains("Date: "));
    assert!(out.ends_with("\r\n\r\nok"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn not_found_and_failures() {
    let (mut server, addr) = start(Pipeline::new().stage(Routes)).await;

    let out = roundtrip(addr, &get("/nothing-here")).await;
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(out.ends_with("not found"));

    let out = roundtrip(addr, &get("/boom")).await;
    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(out.ends_with("\r\n\r\nboom"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn keep_alive_serves_several_requests() {
    let (mut server, addr) = start(Pipeline::new().stage(Routes)).await;

    let raw = "POST /echo HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nping\
               GET /ok HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n";
    let out = roundtrip(addr, raw).await;
    assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
    let ping = out.find("ping").unwrap();
    let ok = out.rfind("ok").unwrap();
    assert!(ping < ok);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn static_files_and_conditional_get() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("site.css"), "body { margin: 0 }").unwrap();
    let modified: DateTime<Utc> = fs::metadata(dir.path().join("site.css"))
        .unwrap()
        .modified()
        .unwrap()
        .into();

    let pipeline = Pipeline::new().stage(FileServer::new("/assets", dir.path()));
    let (mut server, addr) = start(pipeline).await;

    let out = roundtrip(addr, &get("/assets/site.css")).await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Content-Type: text/css\r\n"));
    assert!(out.contains("Content-Length: 18\r\n"));
    assert!(out.contains(&format!("Last-Modified: {}\r\n", fmt_http_date(modified))));
    assert!(out.ends_with("body { margin: 0 }"));

    let conditional = format!(
        "GET /assets/site.css HTTP/1.1\r\nHost: x\r\nIf-Modified-Since: {}\r\nConnection: close\r\n\r\n",
        fmt_http_date(modified)
    );
    let out = roundtrip(addr, &conditional).await;
    assert!(out.starts_with("HTTP/1.1 304 Not Modified\r\n"));
    assert!(!out.contains("Content-Length"));
    assert!(out.ends_with("\r\n\r\n"));

    let out = roundtrip(addr, &get("/assets/../etc/passwd")).await;
    assert!(out.starts_with("HTTP/1.1 403 Forbidden\r\n"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn session_cookie_is_issued() {
    let pipeline = Pipeline::new()
        .stage(SessionManager::new(Arc::new(MemorySessionStore::new())))
        .stage(Routes);
    let (mut server, addr) = start(pipeline).await;

    let out = roundtrip(addr, &get("/ok")).await;
    assert!(out.contains("Set-Cookie: _sid="));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_requests_get_400() {
    let (mut server, addr) = start(Pipeline::new().stage(Routes)).await;
    let out = roundtrip(addr, "NOT A REQUEST\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_closes_the_listener() {
    let (mut server, addr) = start(Pipeline::new().stage(Routes)).await;
    server.stop().await.unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}
