//! # portico
//!
//! The request-handling spine of a pluggable web-application server. It sits
//! between "a transport delivered bytes" and "an application produced a
//! result".
//!
//! ## The contract
//!
//! The transport (hyper, behind nginx or an ingress) owns sockets, TLS and
//! keep-alive. portico owns what happens to one transaction:
//!
//! - **Request view**: a proxy-aware picture of the request. Scheme, host
//!   and port are rebuilt from `X-Forwarded-*` headers, and the view also
//!   detects XHR and builds redirect URLs.
//! - **Exception pipeline**: an ordered chain of handlers every escaping
//!   fault is folded through, a commit-or-rollback decision, and error
//!   bodies found by a fixed search over per-status files.
//! - **Upgrade trampoline**: a WebSocket handshake runs through the
//!   application like any request, then the socket is handed to whoever
//!   asked for it.
//!
//! Out of scope: listening, routing tables, static files.
//!
//! ## Quick start
//!
//! ```rust
//! use portico::{
//!     App, Body, Dispatch, DispatchContext, ErrorPages, ExceptionsService, Fault, MountTable,
//!     Publisher, Request, RestApp, Router,
//! };
//!
//! struct Hello;
//!
//! impl Router for Hello {
//!     type Args = String;
//!
//!     fn create_dispatch_args(&self, _request: &Request, path: &str) -> String {
//!         path.to_owned()
//!     }
//!
//!     fn dispatch(&self, _cx: &mut DispatchContext<'_>, path: String) -> Result<Dispatch<String>, Fault> {
//!         Ok(Dispatch::done(serde_json::json!({ "path": path })))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut statics = MountTable::new();
//! let exceptions = ExceptionsService::new(ErrorPages::new("data/http_errors"));
//! let app = RestApp::new(App::new("hello", None), Hello);
//! let publisher = Publisher::start(app, exceptions, &mut statics);
//!
//! let req = http::Request::get("/hello/world")
//!     .body(http_body_util::Full::new(bytes::Bytes::new()))
//!     .unwrap();
//! let res = publisher.handle(req).await.unwrap();
//! assert_eq!(res.status(), http::StatusCode::OK);
//! # }
//! ```

mod application;
mod error;
mod error_pages;
mod fault;
mod handler;
mod publisher;
mod request;
mod response;
mod rest;

pub mod config;
pub mod exceptions;
pub mod upgrade;

pub use application::{App, Application, MountTable, Statics};
pub use config::{Config, load_config};
pub use error::{DecodeError, Error, Result};
pub use error_pages::ErrorPages;
pub use exceptions::{ExceptionContext, ExceptionLogger, ExceptionsService, TracingLogger};
pub use fault::{Fault, FaultShape, HttpFault};
pub use handler::{ExceptionHandler, HandlerRegistry};
pub use publisher::{NoTransaction, Publisher, Transaction};
pub use request::{Environ, Origin, Redirect, Request, Transport, XHR_PARAM};
pub use response::{ContentType, IntoResponse, Response};
pub use rest::{Body, Dispatch, DispatchContext, JSON, RestApp, Router};
pub use upgrade::{Handshake, ProtocolHandler, Socket};
pub use tokio_tungstenite::tungstenite::Message;
