//! # capsela
//!
//! An async HTTP/1.1 server framework built around a chain of stages.
//!
//! A request travels down a [`Pipeline`] until some [`Stage`] answers it.
//! Stages can short-circuit, fall through, decorate the response of the rest
//! of the chain, or fail; the [`Server`] reconciles whatever comes back into
//! one response, answering 404 when nothing did, 500 on failure, and 304
//! when the client's cached copy is still current.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capsela::config::ServerConfig;
//! use capsela::stage::{BoxFuture, Next, Pipeline, Stage, StageResult};
//! use capsela::stages::FileServer;
//! use capsela::{Request, Response, Server, StatusCode};
//!
//! struct Hello;
//!
//! impl Stage for Hello {
//!     fn service<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, StageResult> {
//!         Box::pin(async move {
//!             if request.path() == "/hello" {
//!                 return Ok(Some(Response::new(StatusCode::OK).body("Hello, World!")));
//!             }
//!             next.pass(request).await
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::new()
//!         .stage(Hello)
//!         .stage(FileServer::new("/", "./public"));
//!
//!     let mut server = Server::new(ServerConfig::with_port(8080), pipeline);
//!     let addr = server.start().await?;
//!     println!("Listening on http://{addr}");
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod http;
pub mod resolver;
pub mod server;
pub mod stage;
pub mod stages;
pub mod view;

pub use config::ServerConfig;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError, ServerState};
pub use stage::{Next, Pipeline, Stage, StageError, StageResult};
