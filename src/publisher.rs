//! Transaction driver.
//!
//! [`Publisher::handle`] is the whole life of one transaction:
//!
//! 1. Inspect the request once for a WebSocket handshake.
//! 2. Read the body and build the [`Request`]/[`Response`] pair. Input that
//!    cannot be decoded is answered with `400 Bad Request` right here.
//! 3. Run the application. A fault goes through the exception pipeline,
//!    which either turns it into the response (commit) or re-raises it
//!    (rollback). A panic in the application is caught and enters the
//!    pipeline as an unshaped fault. Exception handlers are trusted and run
//!    outside that guard.
//! 4. If the client asked for a WebSocket, the application accepted it and
//!    the transaction succeeded, answer `101` and hand the socket over.
//!
//! The publisher does not listen on sockets. Plug [`Publisher::handle`] into
//! a hyper connection with `service_fn`:
//!
//! ```rust,no_run
//! use std::convert::Infallible;
//!
//! use hyper::service::service_fn;
//! use hyper_util::rt::TokioIo;
//! use portico::{App, ErrorPages, ExceptionsService, MountTable, Publisher};
//!
//! # async fn run(stream: tokio::net::TcpStream) {
//! let mut statics = MountTable::new();
//! let exceptions = ExceptionsService::new(ErrorPages::new("data/http_errors"));
//! let publisher = Publisher::start(App::new("shop", None), exceptions, &mut statics);
//!
//! let svc = service_fn(move |req| {
//!     let publisher = publisher.clone();
//!     async move { publisher.handle(req).await }
//! });
//! let _ = hyper::server::conn::http1::Builder::new()
//!     .serve_connection(TokioIo::new(stream), svc)
//!     .with_upgrades()
//!     .await;
//! # }
//! ```

use std::convert::Infallible;
use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use http_body::Body as HttpBody;
use http_body_util::{BodyExt, Full};
use tracing::{debug, error, info};

use crate::application::{Application, Statics};
use crate::config::Config;
use crate::error::Result;
use crate::exceptions::ExceptionsService;
use crate::fault::{Fault, HttpFault};
use crate::handler::HandlerRegistry;
use crate::request::Environ;
use crate::response::{IntoResponse, Response};
use crate::upgrade;

// ── Unit of work ─────────────────────────────────────────────────────────────

/// Told how every transaction ended.
///
/// `commit` follows a successful response or a committable fault.
/// `rollback` follows a fault the pipeline re-raised.
pub trait Transaction: Send + Sync + 'static {
    fn commit(&self) {}

    fn rollback(&self, _fault: &Fault) {}
}

/// Ignores both outcomes.
#[derive(Debug, Default)]
pub struct NoTransaction;

impl Transaction for NoTransaction {}

// ── Publisher ────────────────────────────────────────────────────────────────

pub struct Publisher<A> {
    app: Arc<A>,
    exceptions: Arc<ExceptionsService>,
    transaction: Arc<dyn Transaction>,
    websocket_protocols: Arc<[String]>,
}

impl<A> Clone for Publisher<A> {
    fn clone(&self) -> Self {
        Self {
            app: Arc::clone(&self.app),
            exceptions: Arc::clone(&self.exceptions),
            transaction: Arc::clone(&self.transaction),
            websocket_protocols: Arc::clone(&self.websocket_protocols),
        }
    }
}

impl<A: Application> Publisher<A> {
    /// Deploys `app`: registers its mount point with `statics` and seals the
    /// exception chain. Nothing is served before this returns.
    pub fn start(app: A, exceptions: ExceptionsService, statics: &mut dyn Statics) -> Self {
        app.handle_start(statics);
        exceptions.seal();
        info!(
            app = app.app().name(),
            handlers = ?exceptions.handler_names(),
            "publisher started",
        );
        Self {
            app: Arc::new(app),
            exceptions: Arc::new(exceptions),
            transaction: Arc::new(NoTransaction),
            websocket_protocols: Arc::from(["binary".to_owned()]),
        }
    }

    /// [`start`](Self::start) with the exception chain and WebSocket
    /// protocols taken from `config`.
    pub fn from_config(
        config: &Config,
        app: A,
        registry: &HandlerRegistry,
        statics: &mut dyn Statics,
    ) -> Result<Self> {
        let exceptions = ExceptionsService::from_config(&config.exceptions, &config.application.data, registry)?;
        Ok(Self::start(app, exceptions, statics).with_websocket_protocols(config.websocket.protocols.clone()))
    }

    pub fn with_transaction(mut self, transaction: impl Transaction) -> Self {
        self.transaction = Arc::new(transaction);
        self
    }

    /// Subprotocols offered back to WebSocket clients, in preference order.
    pub fn with_websocket_protocols(mut self, protocols: Vec<String>) -> Self {
        self.websocket_protocols = protocols.into();
        self
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn exceptions(&self) -> &ExceptionsService {
        &self.exceptions
    }

    /// Runs one transaction to completion.
    ///
    /// Never fails: every outcome, including faults nobody handled, is a
    /// well-formed response.
    pub async fn handle<B>(&self, mut req: http::Request<B>) -> Result<http::Response<Full<Bytes>>, Infallible>
    where
        B: HttpBody,
        B::Error: Display,
    {
        let on_upgrade = upgrade::negotiate(&req).map(|_| hyper::upgrade::on(&mut req));

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("cannot read request body: {e}");
                return Ok(HttpFault::bad_request().into_response().into_inner());
            }
        };

        let environ = Environ::new(http::Request::from_parts(parts, body));
        let handshake = environ.handshake.clone();
        let mut response = self.process(environ);

        if let (Some(handshake), Some(on_upgrade)) = (handshake, on_upgrade) {
            if response.status().is_success() {
                if let Some(handler) = response.take_protocol_handler() {
                    upgrade::hand_off(on_upgrade, handler);
                    let switching = upgrade::switching_protocols(&handshake, &self.websocket_protocols);
                    return Ok(switching.into_inner());
                }
            }
        }

        Ok(response.into_inner())
    }

    /// The synchronous part of a transaction, from environment to response.
    fn process(&self, environ: Environ) -> Response {
        let request = match self.app.create_request(environ) {
            Ok(request) => request,
            Err(e) => {
                debug!(part = e.part(), "malformed request: {e}");
                return HttpFault::bad_request().into_response();
            }
        };

        let mut response = self.app.create_response(&request);
        let handled = panic::catch_unwind(AssertUnwindSafe(|| self.app.handle_request(&request, &mut response)))
            .unwrap_or_else(|payload| Err(Fault::other(format!("panic in application code: {}", panic_message(&*payload)))));
        let outcome = match handled {
            Ok(()) => Ok(response),
            Err(fault) => {
                let cx = self
                    .exceptions
                    .context(self.app.app())
                    .with_request(&request)
                    .with_response(&response);
                self.exceptions.default_exception_handler(fault, &cx)
            }
        };

        match outcome {
            Ok(response) => {
                self.transaction.commit();
                response
            }
            Err(fault) => {
                self.transaction.rollback(&fault);
                match fault {
                    Fault::Http(http) => http.into_response(),
                    Fault::Other(e) => {
                        error!(exception = %e, "unhandled exception");
                        HttpFault::internal_server_error().into_response()
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
