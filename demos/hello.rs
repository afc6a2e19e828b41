//! A small site: sessions, a controller, static files and error pages.
//!
//! ```text
//! cargo run --example hello [config.toml]
//! curl -i http://127.0.0.1:8080/
//! curl -i http://127.0.0.1:8080/greet/say-hello/name/Ferris
//! ```

use std::sync::Arc;

use capsela::config::ServerConfig;
use capsela::stage::{BoxFuture, Pipeline, StageResult};
use capsela::stages::{
    Controller, Dispatcher, ErrorHandler, FileServer, MemorySessionStore, Session,
    SessionManager,
};
use capsela::view::StaticView;
use capsela::{Request, Response, Server, StatusCode};
use serde_json::json;
use tracing_subscriber::EnvFilter;

struct Greet;

impl Controller for Greet {
    fn actions(&self) -> &[&str] {
        &["default", "sayHello"]
    }

    fn call<'a>(&'a self, action: &'a str, request: &'a mut Request) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            let name = request.params().get("name").unwrap_or("stranger").to_owned();
            let visits = match request.extensions_mut().get_mut::<Session>() {
                Some(session) => {
                    let visits = session.get("visits").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
                    session.insert("visits", json!(visits));
                    visits
                }
                None => 1,
            };

            let link = request
                .resolver()
                .resolve_uri("ref:action_link:/greet/sayHello/name=Ferris")?
                .unwrap_or_default();

            let body = match action {
                "sayHello" => format!("Hello, {name}! (visit {visits})\n"),
                _ => format!("Try {link}\n"),
            };
            Ok(Some(Response::new(StatusCode::OK).body(body)))
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "capsela=debug".into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig {
            host: "127.0.0.1".into(),
            port: 8080,
            ..ServerConfig::default()
        },
    };

    let pipeline = Pipeline::new()
        .stage(ErrorHandler::new(StaticView::new(
            "<!doctype html><title>Error</title><h1>Something went wrong</h1>",
        )))
        .stage(SessionManager::new(Arc::new(MemorySessionStore::new())))
        .stage(Dispatcher::new().controller("greet", Greet))
        .stage(FileServer::new("/", "./public").default_file("index.html"));

    let mut server = Server::new(config, pipeline);
    let addr = server.start().await?;
    tracing::info!("try http://{addr}/greet/");

    tokio::signal::ctrl_c().await?;
    server.stop().await?;
    Ok(())
}
