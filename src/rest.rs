//! REST application: dispatch through a router, serialise what comes back.
//!
//! # The routing trampoline
//!
//! A router either produces a final [`Body`] or asks to be called again with
//! different arguments. [`RestApp::route`] keeps calling it until it stops
//! asking:
//!
//! ```text
//! args ──► router.dispatch ──► Continue(next) ──┐
//!   ▲                                           │
//!   └───────────────────────────────────────────┘
//!                          └──► Done(body) ──► set_response_body
//! ```
//!
//! No recursion, no continuation objects, and a hard bound on the number of
//! hops so a router that never settles fails the transaction instead of
//! spinning forever.

use bytes::Bytes;
use serde_json::Value;

use crate::application::{App, Application};
use crate::config::ApplicationConfig;
use crate::error::Error;
use crate::fault::Fault;
use crate::request::Request;
use crate::response::Response;

/// Content type the REST body rules compare against.
pub const JSON: &str = "application/json";

/// Default bound on trampoline iterations.
pub const DEFAULT_MAX_DISPATCH: usize = 32;

// ── Body ─────────────────────────────────────────────────────────────────────

/// Final value produced by a router.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    /// Nothing to write; the response body is left as it is.
    Empty,
    Json(Value),
    Text(String),
    Bytes(Bytes),
}

impl From<Value> for Body {
    fn from(v: Value) -> Self { Self::Json(v) }
}

impl From<()> for Body {
    fn from(_: ()) -> Self { Self::Empty }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self { Self::Text(s.to_owned()) }
}

impl From<String> for Body {
    fn from(s: String) -> Self { Self::Text(s) }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self { Self::Bytes(b.into()) }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self { Self::Bytes(b) }
}

impl<T: Into<Body>> From<Option<T>> for Body {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Empty, Into::into)
    }
}

// ── Router collaborator ──────────────────────────────────────────────────────

/// One trampoline step.
#[derive(Debug)]
pub enum Dispatch<A> {
    /// Dispatch again with these arguments.
    Continue(A),
    Done(Body),
}

impl<A> Dispatch<A> {
    pub fn done(body: impl Into<Body>) -> Self {
        Self::Done(body.into())
    }
}

/// What the router sees on every hop: the application first, then the
/// transaction's request and response.
pub struct DispatchContext<'a> {
    pub app: &'a App,
    pub request: &'a Request,
    pub response: &'a mut Response,
}

/// Maps a request to application code.
pub trait Router: Send + Sync + 'static {
    type Args: Send;

    /// Initial arguments for `request`. `path` is relative to the mount point.
    fn create_dispatch_args(&self, request: &Request, path: &str) -> Self::Args;

    fn dispatch(&self, cx: &mut DispatchContext<'_>, args: Self::Args) -> Result<Dispatch<Self::Args>, Fault>;
}

// ── RestApp ──────────────────────────────────────────────────────────────────

/// An [`Application`] answering with whatever its router returns.
pub struct RestApp<R> {
    app: App,
    default_content_type: String,
    max_dispatch: usize,
    router: R,
}

impl<R: Router> RestApp<R> {
    pub fn new(app: App, router: R) -> Self {
        Self {
            app,
            default_content_type: JSON.to_owned(),
            max_dispatch: DEFAULT_MAX_DISPATCH,
            router,
        }
    }

    pub fn from_config(config: &ApplicationConfig, router: R) -> Self {
        Self::new(App::from_config(config), router)
            .with_default_content_type(config.default_content_type.clone())
            .with_max_dispatch(config.max_dispatch)
    }

    /// Content type applied when application code set none. `""` means
    /// `application/octet-stream`.
    pub fn with_default_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.default_content_type = content_type.into();
        self
    }

    pub fn with_max_dispatch(mut self, max: usize) -> Self {
        self.max_dispatch = max.max(1);
        self
    }

    pub fn router(&self) -> &R { &self.router }

    /// Prepends the application to the router's own arguments.
    pub fn create_dispatch_args<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response,
    ) -> (DispatchContext<'a>, R::Args) {
        let path = request.path();
        let path = match path.strip_prefix(self.app.url()) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => path,
        };
        let args = self.router.create_dispatch_args(request, path);
        (DispatchContext { app: &self.app, request, response }, args)
    }

    /// Runs the trampoline until the router produces a final value.
    pub fn route(&self, cx: &mut DispatchContext<'_>, mut args: R::Args) -> Result<Body, Fault> {
        for _ in 0..self.max_dispatch {
            match self.router.dispatch(cx, args)? {
                Dispatch::Continue(next) => args = next,
                Dispatch::Done(body) => return Ok(body),
            }
        }
        Err(Error::DispatchLimit(self.max_dispatch).into())
    }

    /// Writes `body` according to the response's content type.
    ///
    /// Under `application/json` structured values and text are serialised as
    /// JSON and bytes are assumed to be JSON already. Under any other type
    /// text and bytes are written unchanged and structured values as their
    /// JSON text.
    pub fn set_response_body(&self, response: &mut Response, body: Body) -> Result<(), Fault> {
        if response.content_type().is_empty() {
            let default = match self.default_content_type.as_str() {
                "" => "application/octet-stream",
                ct => ct,
            };
            response.set_content_type(default);
        }

        let json = mimetype(response.content_type()) == JSON;
        match body {
            Body::Empty => {}
            Body::Json(value) => response.set_json_body(&value)?,
            Body::Text(text) if json => response.set_json_body(&text)?,
            Body::Text(text) => response.set_body(text),
            Body::Bytes(bytes) => response.set_body(bytes),
        }
        Ok(())
    }
}

/// The `type/subtype` part of a content type, without parameters.
fn mimetype(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or_default().trim()
}

impl<R: Router> Application for RestApp<R> {
    fn app(&self) -> &App { &self.app }

    fn handle_request(&self, request: &Request, response: &mut Response) -> Result<(), Fault> {
        let body = {
            let (mut cx, args) = self.create_dispatch_args(request, response);
            self.route(&mut cx, args)?
        };
        self.set_response_body(response, body)
    }
}
