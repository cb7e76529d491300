//! Exception-handler functions and their registry.
//!
//! # How handlers are stored
//!
//! The exception chain holds handlers of *different* types in one ordered
//! list, so each is erased behind [`ErasedExceptionHandler`]:
//!
//! ```text
//! fn classify(fault: Fault, cx: &ExceptionContext) -> Fault { … }   ← user writes this
//!        ↓ registry.register("app::classify", classify)
//! classify.into_boxed_handler()                                    ← blanket impl
//!        ↓
//! Arc::new(FnHandler(classify))        stored as BoxedExceptionHandler
//!        ↓
//! handler.call(fault, &cx)  when a fault escapes application code
//! ```
//!
//! Configuration names handlers by reference string. Every reference is
//! resolved against a [`HandlerRegistry`] once, at startup; an unknown name
//! fails there, never mid-request.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::exceptions::{self, ExceptionContext};
use crate::fault::Fault;

/// Object-safe form of [`ExceptionHandler`].
#[doc(hidden)]
pub trait ErasedExceptionHandler {
    fn call(&self, fault: Fault, cx: &ExceptionContext<'_>) -> Fault;
}

/// A type-erased handler, shared by every transaction.
#[doc(hidden)]
pub type BoxedExceptionHandler = Arc<dyn ErasedExceptionHandler + Send + Sync + 'static>;

/// Implemented for every function with the signature
///
/// ```text
/// fn name(fault: Fault, cx: &ExceptionContext<'_>) -> Fault
/// ```
///
/// Sealed: the blanket impl below is the only one.
pub trait ExceptionHandler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedExceptionHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F> private::Sealed for F where F: Fn(Fault, &ExceptionContext<'_>) -> Fault + Send + Sync + 'static {}

impl<F> ExceptionHandler for F
where
    F: Fn(Fault, &ExceptionContext<'_>) -> Fault + Send + Sync + 'static,
{
    fn into_boxed_handler(self) -> BoxedExceptionHandler {
        Arc::new(FnHandler(self))
    }
}

struct FnHandler<F>(F);

impl<F> ErasedExceptionHandler for FnHandler<F>
where
    F: Fn(Fault, &ExceptionContext<'_>) -> Fault,
{
    fn call(&self, fault: Fault, cx: &ExceptionContext<'_>) -> Fault {
        (self.0)(fault, cx)
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Reference name → handler, consulted when the chain is configured.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxedExceptionHandler>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// The registry with the two canonical handlers: the classifier
    /// ([`exceptions::EXCEPTION_HANDLER`]) and the error-page resolver
    /// ([`exceptions::HTTP_EXCEPTION_HANDLER`]).
    pub fn new() -> Self {
        Self::empty()
            .with(exceptions::EXCEPTION_HANDLER, exceptions::exception_handler)
            .with(exceptions::HTTP_EXCEPTION_HANDLER, exceptions::http_exception_handler)
    }

    pub fn with(mut self, name: &str, handler: impl ExceptionHandler) -> Self {
        self.register(name, handler);
        self
    }

    /// Registers `handler` under `name`, replacing any previous one.
    pub fn register(&mut self, name: &str, handler: impl ExceptionHandler) {
        self.handlers.insert(name.to_owned(), handler.into_boxed_handler());
    }

    pub fn resolve(&self, name: &str) -> Result<BoxedExceptionHandler> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownHandler(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self { Self::new() }
}
