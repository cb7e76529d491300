//! Unified error type.

use std::path::PathBuf;

/// The error type returned by portico's fallible infrastructure operations.
///
/// Application-level failures (404, 422, a database error inside a view)
/// travel as [`Fault`](crate::Fault) values through the exception pipeline.
/// This type surfaces everything around them: configuration, startup wiring,
/// and the routing trampoline running away.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config: {0}")]
    ConfigInvalid(String),

    #[error("unknown exception handler `{0}`")]
    UnknownHandler(String),

    #[error("exception handler chain is sealed, serving already started")]
    ChainSealed,

    #[error("invalid fault shape `{0}`, expected a status code such as `404`, `40x`, `4xx` or `xxx`")]
    InvalidFaultShape(String),

    #[error("router still dispatching after {0} iterations")]
    DispatchLimit(usize),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Shorthand used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A request whose path or parameters are not valid percent-encoded UTF-8.
///
/// Raised while building a [`Request`](crate::Request), before any
/// application code runs. The publisher answers it with `400 Bad Request`.
#[derive(Debug, thiserror::Error)]
#[error("malformed {part}: {reason}")]
pub struct DecodeError {
    pub(crate) part: &'static str,
    pub(crate) reason: String,
}

impl DecodeError {
    pub(crate) fn new(part: &'static str, reason: impl Into<String>) -> Self {
        Self { part, reason: reason.into() }
    }

    /// Which piece of the request failed to decode (`"path"`, `"query"`, `"body"`).
    pub fn part(&self) -> &'static str {
        self.part
    }
}
