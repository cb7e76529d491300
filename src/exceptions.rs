//! Exception-recovery pipeline.
//!
//! A fault escaping application code is folded through an ordered chain of
//! handlers, each receiving the previous one's output:
//!
//! ```text
//! fault ──► exception_handler ──► http_exception_handler ──► … ──► fault'
//!           (log + 500 unless       (error page body for
//!            already HTTP-shaped)    4xx / 5xx)
//! ```
//!
//! [`ExceptionsService::default_exception_handler`] then makes the binary
//! decision: a committable fault becomes the response, anything else is
//! handed back to the caller to abort (and roll back) the transaction.
//!
//! Handlers are trusted. A panicking handler is not caught here.

use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::{debug, error};

use crate::application::App;
use crate::config::ExceptionsConfig;
use crate::error::{Error, Result};
use crate::error_pages::ErrorPages;
use crate::fault::{Fault, FaultShape, HttpFault};
use crate::handler::{BoxedExceptionHandler, ExceptionHandler, HandlerRegistry};
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// Reference of [`exception_handler`].
pub const EXCEPTION_HANDLER: &str = "portico::exceptions::exception_handler";
/// Reference of [`http_exception_handler`].
pub const HTTP_EXCEPTION_HANDLER: &str = "portico::exceptions::http_exception_handler";

// ── Canonical handlers ───────────────────────────────────────────────────────

/// Classifier: logs any fault that is not HTTP-shaped and replaces it with
/// `500 Internal Server Error`. HTTP faults pass through.
pub fn exception_handler(fault: Fault, cx: &ExceptionContext<'_>) -> Fault {
    match fault {
        Fault::Http(_) => fault,
        Fault::Other(_) => {
            cx.exceptions.log_exception(&fault);
            HttpFault::internal_server_error().into()
        }
    }
}

/// Error-page resolver: gives 4xx and 5xx faults the body of their error
/// page. Every other fault is returned untouched, without any lookup.
pub fn http_exception_handler(fault: Fault, cx: &ExceptionContext<'_>) -> Fault {
    match fault {
        Fault::Http(http) if http.is_error() => cx.exceptions.http_exception_handler(http).into(),
        other => other,
    }
}

// ── Logging collaborator ─────────────────────────────────────────────────────

/// Records faults that will never reach the client.
pub trait ExceptionLogger: Send + Sync + 'static {
    fn log_exception(&self, fault: &Fault);
}

/// Logs through `tracing` at `ERROR`, with the source chain and a backtrace
/// when `RUST_BACKTRACE` asks for one.
#[derive(Debug, Default)]
pub struct TracingLogger;

impl ExceptionLogger for TracingLogger {
    fn log_exception(&self, fault: &Fault) {
        let mut causes = String::new();
        let mut source = fault.source().and_then(|e| e.source());
        while let Some(cause) = source {
            let _ = write!(causes, "{cause}; ");
            source = cause.source();
        }
        error!(
            exception = %fault,
            causes = causes.trim_end_matches("; "),
            backtrace = %Backtrace::capture(),
            "unhandled exception",
        );
    }
}

// ── Context ──────────────────────────────────────────────────────────────────

/// What every handler can see besides the fault itself.
pub struct ExceptionContext<'a> {
    pub exceptions: &'a ExceptionsService,
    pub app: &'a App,
    pub request: Option<&'a Request>,
    pub response: Option<&'a Response>,
}

impl<'a> ExceptionContext<'a> {
    pub fn with_request(mut self, request: &'a Request) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_response(mut self, response: &'a Response) -> Self {
        self.response = Some(response);
        self
    }
}

// ── Service ──────────────────────────────────────────────────────────────────

type Entry = (String, BoxedExceptionHandler);

/// The configured chain plus everything its handlers need.
///
/// Other services may [`append_handler`](Self::append_handler) while the
/// application starts. [`seal`](Self::seal) freezes the chain for serving;
/// from then on it is read without locking and appends are refused.
pub struct ExceptionsService {
    pending: Mutex<Vec<Entry>>,
    chain: OnceLock<Arc<[Entry]>>,
    commit_exceptions: Vec<FaultShape>,
    error_pages: ErrorPages,
    logger: Arc<dyn ExceptionLogger>,
}

impl ExceptionsService {
    /// The canonical chain, committing the `2xx` family.
    pub fn new(error_pages: ErrorPages) -> Self {
        let registry = HandlerRegistry::new();
        let chain = [EXCEPTION_HANDLER, HTTP_EXCEPTION_HANDLER]
            .into_iter()
            .filter_map(|name| Some((name.to_owned(), registry.resolve(name).ok()?)))
            .collect();
        Self::with_chain(chain, error_pages)
    }

    fn with_chain(chain: Vec<Entry>, error_pages: ErrorPages) -> Self {
        Self {
            pending: Mutex::new(chain),
            chain: OnceLock::new(),
            commit_exceptions: vec![FaultShape::OK],
            error_pages,
            logger: Arc::new(TracingLogger),
        }
    }

    /// Resolves every configured reference against `registry`.
    ///
    /// `data` replaces `$data` in the error pages path.
    pub fn from_config(config: &ExceptionsConfig, data: &str, registry: &HandlerRegistry) -> Result<Self> {
        let service = Self::with_chain(Vec::new(), ErrorPages::new(config.http_errors_dir(data)))
            .with_commit_exceptions(config.commit_shapes()?);
        for name in &config.exception_handlers {
            service.push(name, registry.resolve(name)?)?;
        }
        Ok(service)
    }

    pub fn with_logger(mut self, logger: impl ExceptionLogger) -> Self {
        self.logger = Arc::new(logger);
        self
    }

    pub fn with_commit_exceptions(mut self, shapes: Vec<FaultShape>) -> Self {
        self.commit_exceptions = shapes;
        self
    }

    pub fn error_pages(&self) -> &ErrorPages {
        &self.error_pages
    }

    pub fn error_pages_dir(&self) -> &Path {
        self.error_pages.dir()
    }

    /// Appends `handler` at the end of the chain.
    ///
    /// A name already in the chain is left where it is. Fails with
    /// [`Error::ChainSealed`] once serving has started.
    pub fn append_handler(&self, name: &str, handler: impl ExceptionHandler) -> Result<()> {
        self.push(name, handler.into_boxed_handler())
    }

    fn push(&self, name: &str, handler: BoxedExceptionHandler) -> Result<()> {
        if self.chain.get().is_some() {
            return Err(Error::ChainSealed);
        }
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.iter().any(|(n, _)| n == name) {
            debug!(handler = name, "exception handler already registered");
        } else {
            pending.push((name.to_owned(), handler));
        }
        Ok(())
    }

    /// Freezes the chain. Idempotent.
    pub fn seal(&self) {
        self.chain.get_or_init(|| {
            let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::from(pending.clone())
        });
    }

    pub fn is_sealed(&self) -> bool {
        self.chain.get().is_some()
    }

    /// Handler references, in chain order.
    pub fn handler_names(&self) -> Vec<String> {
        self.handlers().iter().map(|(n, _)| n.clone()).collect()
    }

    fn handlers(&self) -> Arc<[Entry]> {
        match self.chain.get() {
            Some(chain) => Arc::clone(chain),
            None => {
                let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                Arc::from(pending.clone())
            }
        }
    }

    pub fn context<'a>(&'a self, app: &'a App) -> ExceptionContext<'a> {
        ExceptionContext { exceptions: self, app, request: None, response: None }
    }

    pub fn log_exception(&self, fault: &Fault) {
        self.logger.log_exception(fault);
    }

    /// Sets the error page matching the fault's status as its body, if any.
    pub fn http_exception_handler(&self, mut fault: HttpFault) -> HttpFault {
        if let Some(text) = self.error_pages.resolve(fault.status()) {
            fault.set_text(text);
        }
        fault
    }

    /// Folds `fault` through the chain, in registration order.
    pub fn handle_exception(&self, fault: Fault, cx: &ExceptionContext<'_>) -> Fault {
        self.handlers()
            .iter()
            .fold(fault, |fault, (_, handler)| handler.call(fault, cx))
    }

    /// Runs the chain, then decides: `Ok` means deliver the response and
    /// commit, `Err` means re-raise so the unit of work is rolled back.
    pub fn default_exception_handler(&self, fault: Fault, cx: &ExceptionContext<'_>) -> Result<Response, Fault> {
        match self.handle_exception(fault, cx) {
            Fault::Http(http) if self.is_committable(&http) => Ok(http.into_response()),
            fault => Err(fault),
        }
    }

    fn is_committable(&self, fault: &HttpFault) -> bool {
        fault.commit_transaction || self.commit_exceptions.iter().any(|s| s.matches(fault.status()))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::StatusCode;

    use super::*;

    #[derive(Clone, Default)]
    struct Counting(Arc<AtomicUsize>);

    impl ExceptionLogger for Counting {
        fn log_exception(&self, _fault: &Fault) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn service(dir: &Path) -> (ExceptionsService, Counting) {
        let counter = Counting::default();
        let service = ExceptionsService::new(ErrorPages::new(dir)).with_logger(counter.clone());
        (service, counter)
    }

    #[test]
    fn unshaped_faults_are_logged_once_and_become_500() {
        let dir = tempfile::tempdir().unwrap();
        let (service, logged) = service(dir.path());
        let app = App::new("app", None);

        let err = service
            .default_exception_handler(Fault::other("database gone"), &service.context(&app))
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(logged.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_pages_fill_4xx_bodies() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("4xx"), "<h1>client error</h1>").unwrap();
        let (service, logged) = service(dir.path());
        let app = App::new("app", None);

        let fault = service.handle_exception(HttpFault::not_found().into(), &service.context(&app));
        assert_eq!(fault.as_http().and_then(HttpFault::text), Some("<h1>client error</h1>"));
        assert_eq!(logged.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_error_page_keeps_the_default_body() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(dir.path());
        let app = App::new("app", None);

        let fault = service.handle_exception(HttpFault::not_found().into(), &service.context(&app));
        assert_eq!(fault.as_http().and_then(HttpFault::text), None);
    }

    #[test]
    fn ok_family_skips_error_pages_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("xxx"), "catch all").unwrap();
        fs::write(dir.path().join("default"), "default").unwrap();
        let (service, _) = service(dir.path());
        let app = App::new("app", None);

        let response = service
            .default_exception_handler(HttpFault::new(StatusCode::OK).into(), &service.context(&app))
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), b"200 OK\n");
    }

    #[test]
    fn commit_marker_decides_between_response_and_reraise() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(dir.path());
        let app = App::new("app", None);
        let cx = service.context(&app);

        let committed = service.default_exception_handler(HttpFault::see_other("/next/").commit().into(), &cx);
        assert_eq!(committed.unwrap().status(), StatusCode::SEE_OTHER);

        let reraised = service.default_exception_handler(HttpFault::see_other("/next/").into(), &cx);
        assert_eq!(reraised.unwrap_err().status(), Some(StatusCode::SEE_OTHER));
    }

    #[test]
    fn commit_allow_list_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(dir.path());
        let service = service.with_commit_exceptions(vec!["2xx".parse().unwrap(), "3xx".parse().unwrap()]);
        let app = App::new("app", None);

        let response = service.default_exception_handler(HttpFault::see_other("/").into(), &service.context(&app));
        assert!(response.is_ok());
    }

    #[test]
    fn chain_runs_in_order_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(dir.path());

        fn teapot(_fault: Fault, _cx: &ExceptionContext<'_>) -> Fault {
            HttpFault::new(StatusCode::IM_A_TEAPOT).into()
        }
        service.append_handler("test::teapot", teapot).unwrap();
        service.append_handler("test::teapot", teapot).unwrap();
        service.append_handler(EXCEPTION_HANDLER, exception_handler).unwrap();

        assert_eq!(service.handler_names(), [EXCEPTION_HANDLER, HTTP_EXCEPTION_HANDLER, "test::teapot"]);

        let app = App::new("app", None);
        let fault = service.handle_exception(Fault::other("x"), &service.context(&app));
        assert_eq!(fault.status(), Some(StatusCode::IM_A_TEAPOT));
    }

    #[test]
    fn sealed_chain_refuses_appends() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(dir.path());
        service.seal();
        service.seal();

        fn passthrough(fault: Fault, _cx: &ExceptionContext<'_>) -> Fault {
            fault
        }
        let result = service.append_handler("late", passthrough);
        assert!(matches!(result, Err(Error::ChainSealed)));
        assert_eq!(service.handler_names().len(), 2);
    }

    #[test]
    fn configured_references_resolve_at_startup() {
        let mut config = ExceptionsConfig {
            exception_handlers: vec![HTTP_EXCEPTION_HANDLER.to_owned()],
            ..ExceptionsConfig::default()
        };
        let service = ExceptionsService::from_config(&config, "data", &HandlerRegistry::new()).unwrap();
        assert_eq!(service.handler_names(), [HTTP_EXCEPTION_HANDLER]);
        assert_eq!(service.error_pages_dir(), Path::new("data/http_errors"));

        config.exception_handlers.push("nowhere::handler".to_owned());
        let err = ExceptionsService::from_config(&config, "data", &HandlerRegistry::new()).err();
        assert!(matches!(err, Some(Error::UnknownHandler(_))));
    }
}
