//! Ready-made stages.
//!
//! None of these are required by the server; each plugs into a
//! [`Pipeline`](crate::stage::Pipeline) like any user-written stage.

pub mod dispatcher;
pub mod error_handler;
pub mod file_server;
pub mod session;

pub use dispatcher::{Controller, Dispatch, Dispatcher};
pub use error_handler::ErrorHandler;
pub use file_server::FileServer;
pub use session::{CookiePath, MemorySessionStore, Session, SessionManager, SessionStore};
