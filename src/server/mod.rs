//! The server: lifecycle, response reconciliation, and the accept loop.
//!
//! [`Server::handle`] is the heart of request processing. It runs a request
//! through the pipeline and turns whatever the stages produced (a response,
//! nothing, an error, even a panic) into exactly one well-formed response
//! carrying `Date` and `Server` headers. The connection loop in
//! [`connection`] is a thin adapter that parses wire requests, calls
//! `handle`, and writes the result back.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::http::date::fmt_http_date;
use crate::http::{Request, Response, StatusCode};
use crate::resolver::ResolverRegistry;
use crate::stage::{Pipeline, StageError, StageResult};

pub mod conditional;
mod connection;
pub mod tls;

pub use conditional::Conditional;

/// Body of the response sent when no stage answered.
pub const NOT_FOUND_BODY: &str = "not found";

/// Body of the response sent when the stages produced a non-final response.
pub const INVALID_RESPONSE_BODY: &str = "stages produced an invalid response";

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),

    #[error("stages not ready: {0}")]
    NotReady(#[source] StageError),

    #[error("cannot {operation} a server that is {state}")]
    InvalidState {
        operation: &'static str,
        state: ServerState,
    },

    #[error("accept loop failed: {0}")]
    Task(#[from] JoinError),
}

/// Where a [`Server`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// State shared by the server handle and every connection task.
pub(crate) struct Shared {
    pipeline: Arc<Pipeline>,
    resolver: Arc<ResolverRegistry>,
    name: String,
}

impl Shared {
    pub(crate) async fn handle(&self, mut request: Request) -> Response {
        request.attach_resolver(Arc::clone(&self.resolver));
        self.pipeline.echo(&request);

        let conditional = Conditional::from_request(&request);

        // A panicking stage takes down only this task; the join error
        // carries the panic payload back here.
        let pipeline = Arc::clone(&self.pipeline);
        let outcome = tokio::spawn(async move {
            let result = pipeline.service(&mut request).await;
            let drained = request.drain_body();
            if drained > 0 {
                debug!(bytes = drained, "discarded unread request body");
            }
            result
        })
        .await;

        let response = reconcile(outcome);
        let response = match conditional {
            Some(conditional) if conditional.is_fresh(&response) => {
                Response::new(StatusCode::NOT_MODIFIED)
            }
            _ => response,
        };
        self.finalize(response)
    }

    /// Stamps the headers every response carries. They replace any the
    /// stages set and land after all other headers.
    pub(crate) fn finalize(&self, mut response: Response) -> Response {
        response.set_header("Date", fmt_http_date(Utc::now()));
        response.set_header("Server", self.name.as_str());
        response
    }
}

/// Turns the outcome of a pipeline run into a response.
fn reconcile(outcome: Result<StageResult, JoinError>) -> Response {
    match outcome {
        Ok(Ok(None)) => Response::new(StatusCode::NOT_FOUND).body(NOT_FOUND_BODY),
        Ok(Ok(Some(response))) if response.status().is_informational() => {
            warn!(status = %response.status(), "stages produced a non-final response");
            Response::new(StatusCode::INTERNAL_SERVER_ERROR).body(INVALID_RESPONSE_BODY)
        }
        Ok(Ok(Some(response))) => response,
        Ok(Err(e)) => {
            warn!(error = %e, "stage chain failed");
            Response::new(StatusCode::INTERNAL_SERVER_ERROR).body(e.to_string())
        }
        Err(e) => {
            let message = panic_message(e);
            error!(panic = %message, "stage chain panicked");
            Response::new(StatusCode::INTERNAL_SERVER_ERROR).body(message)
        }
    }
}

fn panic_message(e: JoinError) -> String {
    match e.try_into_panic() {
        Ok(payload) => match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_owned(),
                Err(_) => "stage panicked".to_owned(),
            },
        },
        Err(e) => e.to_string(),
    }
}

/// A stage-pipeline HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use capsela::config::ServerConfig;
/// use capsela::server::Server;
/// use capsela::stage::Pipeline;
/// use capsela::stages::FileServer;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = Pipeline::new().stage(FileServer::new("/", "./public"));
///     let mut server = Server::new(ServerConfig::with_port(8080), pipeline);
///     let addr = server.start().await?;
///     println!("listening on {addr}");
///     tokio::signal::ctrl_c().await?;
///     server.stop().await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
    state: ServerState,
    local_addr: Option<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Creates a server for `pipeline`. Every stage gets to register its
    /// resolvers now; the registry is read-only afterwards.
    pub fn new(config: ServerConfig, pipeline: Pipeline) -> Self {
        let mut registry = ResolverRegistry::new();
        pipeline.set_resolver(&mut registry);

        let shared = Arc::new(Shared {
            pipeline: Arc::new(pipeline),
            resolver: Arc::new(registry),
            name: config.name.clone(),
        });

        Self {
            config,
            shared,
            state: ServerState::Created,
            local_addr: None,
            shutdown: None,
            accept_task: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The resolvers the stages registered.
    pub fn resolver(&self) -> &ResolverRegistry {
        &self.shared.resolver
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Runs `request` through the pipeline and returns the final response,
    /// exactly as the connection loop would write it.
    pub async fn handle(&self, request: Request) -> Response {
        self.shared.handle(request).await
    }

    /// Waits for every stage to become ready, binds the listener, and starts
    /// accepting connections. Resolves with the bound address.
    ///
    /// # Errors
    ///
    /// - [`ServerError::InvalidState`] unless the server is created or stopped.
    /// - [`ServerError::NotReady`] if a stage fails its readiness check.
    /// - [`ServerError::Config`], [`ServerError::Tls`] or
    ///   [`ServerError::Rustls`] for an unusable TLS setup.
    /// - [`ServerError::Bind`] if the address cannot be bound.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if !matches!(self.state, ServerState::Created | ServerState::Stopped) {
            return Err(ServerError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        let previous = self.state;
        self.state = ServerState::Starting;

        match self.listen().await {
            Ok(addr) => {
                self.state = ServerState::Running;
                Ok(addr)
            }
            Err(e) => {
                self.state = previous;
                Err(e)
            }
        }
    }

    async fn listen(&mut self) -> Result<SocketAddr, ServerError> {
        self.shared
            .pipeline
            .is_ready()
            .await
            .map_err(ServerError::NotReady)?;

        let acceptor = if self.config.secure {
            let tls = self.config.tls.as_ref().ok_or(ConfigError::MissingTls)?;
            Some(tls::load_acceptor(tls)?)
        } else {
            None
        };

        let host = self.config.host.as_str();
        let listener = TcpListener::bind((host, self.config.port))
            .await
            .map_err(|e| ServerError::Bind {
                addr: format!("{host}:{}", self.config.port),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        info!(
            address = %local_addr,
            "{} server listening on port {}",
            self.config.scheme(),
            local_addr.port()
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        self.accept_task = Some(tokio::spawn(connection::accept_loop(
            listener,
            acceptor,
            shared,
            shutdown_rx,
        )));
        self.shutdown = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stops accepting connections and closes the listener. Connections
    /// already accepted run to completion.
    ///
    /// # Errors
    ///
    /// [`ServerError::InvalidState`] unless the server is running, or
    /// [`ServerError::Task`] if the accept loop panicked.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        if self.state != ServerState::Running {
            return Err(ServerError::InvalidState {
                operation: "stop",
                state: self.state,
            });
        }
        self.state = ServerState::Stopping;
        info!(
            "stopping {} server on port {}",
            self.config.scheme(),
            self.local_addr.map_or(self.config.port, |addr| addr.port())
        );

        if let Some(shutdown) = self.shutdown.take() {
            // the loop may already be gone; either way it is not accepting
            let _ = shutdown.send(());
        }
        let joined = match self.accept_task.take() {
            Some(task) => task.await,
            None => Ok(()),
        };

        self.local_addr = None;
        self.state = ServerState::Stopped;
        joined?;
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("local_addr", &self.local_addr)
            .field("resolver", &self.shared.resolver)
            .finish_non_exhaustive()
    }
}
