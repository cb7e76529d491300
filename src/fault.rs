//! Faults escaping application code.
//!
//! Everything that leaves a handler other than a [`Response`] is a [`Fault`]:
//! either an [`HttpFault`], which already knows which status it wants to be
//! answered with, or an arbitrary error that the exception pipeline will log
//! and normalise to `500 Internal Server Error`.

use std::fmt;
use std::str::FromStr;

use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue, LOCATION};
use http::StatusCode;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

use crate::error::{DecodeError, Error};
use crate::response::{IntoResponse, Response};

// Anything a header value cannot carry verbatim.
const LOCATION_UNSAFE: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');

// ── HttpFault ────────────────────────────────────────────────────────────────

/// A fault that carries the status it should be answered with.
///
/// ```rust
/// use portico::HttpFault;
/// use http::StatusCode;
///
/// let fault = HttpFault::see_other("/login/").commit();
/// assert_eq!(fault.status(), StatusCode::SEE_OTHER);
/// assert!(fault.commit_transaction);
/// ```
#[derive(Debug, Clone)]
pub struct HttpFault {
    status: StatusCode,
    headers: HeaderMap,
    text: Option<String>,
    /// Deliver this fault as a response *and* commit the pending unit of work.
    pub commit_transaction: bool,
}

impl HttpFault {
    pub fn new(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new(), text: None, commit_transaction: false }
    }

    /// A redirection with the given status and `Location`.
    pub fn redirect(status: StatusCode, location: &str) -> Self {
        Self::new(status).with_location(location)
    }

    /// `303 See Other`.
    pub fn see_other(location: &str) -> Self {
        Self::redirect(StatusCode::SEE_OTHER, location)
    }

    /// `400 Bad Request`: the generic client error.
    pub fn bad_request() -> Self {
        Self::new(StatusCode::BAD_REQUEST)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND)
    }

    pub fn internal_server_error() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn service_unavailable() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE)
    }

    pub fn with_location(mut self, location: &str) -> Self {
        let value = utf8_percent_encode(location, LOCATION_UNSAFE).to_string();
        if let Ok(value) = HeaderValue::from_str(&value) {
            self.headers.insert(LOCATION, value);
        }
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Marks the fault as committable.
    pub fn commit(mut self) -> Self {
        self.commit_transaction = true;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn location(&self) -> Option<&str> {
        self.headers.get(LOCATION).and_then(|v| v.to_str().ok())
    }

    /// The body text set by application code or an error page, if any.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = Some(text.into());
    }

    /// True for the 4xx and 5xx families.
    pub fn is_error(&self) -> bool {
        self.status.is_client_error() || self.status.is_server_error()
    }

    /// The text the client receives: the explicit text, or `"<code> <reason>"`.
    pub fn body_text(&self) -> String {
        match &self.text {
            Some(text) => text.clone(),
            None => format!(
                "{} {}\n",
                self.status.as_u16(),
                self.status.canonical_reason().unwrap_or(""),
            ),
        }
    }
}

impl fmt::Display for HttpFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)
    }
}

impl IntoResponse for HttpFault {
    fn into_response(self) -> Response {
        let content_type = if self.text.is_some() {
            "text/html; charset=utf-8"
        } else {
            "text/plain; charset=utf-8"
        };

        let body = self.body_text();
        let mut response = Response::new();
        response.set_status(self.status);
        if self.status != StatusCode::NO_CONTENT && self.status != StatusCode::NOT_MODIFIED {
            response.set_content_type(content_type);
            response.set_body(body.into_bytes());
        }
        for (name, value) in &self.headers {
            if name != CONTENT_TYPE {
                response.headers_mut().append(name, value.clone());
            }
        }
        response
    }
}

// ── Fault ────────────────────────────────────────────────────────────────────

/// Anything escaping application code.
pub enum Fault {
    /// An intentional, status-carrying fault.
    Http(HttpFault),
    /// Any other error. Never shown to the client.
    Other(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Fault {
    pub fn other<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self::Other(err.into())
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Http(f) => Some(f.status()),
            Self::Other(_) => None,
        }
    }

    pub fn as_http(&self) -> Option<&HttpFault> {
        match self {
            Self::Http(f) => Some(f),
            Self::Other(_) => None,
        }
    }

    pub fn commit_transaction(&self) -> bool {
        self.as_http().is_some_and(|f| f.commit_transaction)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(h) => f.debug_tuple("Http").field(h).finish(),
            Self::Other(e) => f.debug_tuple("Other").field(e).finish(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(h) => write!(f, "http fault {h}"),
            Self::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(_) => None,
            Self::Other(e) => Some(e.as_ref()),
        }
    }
}

impl From<HttpFault> for Fault {
    fn from(f: HttpFault) -> Self {
        Self::Http(f)
    }
}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        Self::other(e)
    }
}

impl From<std::io::Error> for Fault {
    fn from(e: std::io::Error) -> Self {
        Self::other(e)
    }
}

impl From<serde_json::Error> for Fault {
    fn from(e: serde_json::Error) -> Self {
        Self::other(e)
    }
}

impl From<DecodeError> for Fault {
    fn from(e: DecodeError) -> Self {
        Self::other(e)
    }
}

// ── FaultShape ───────────────────────────────────────────────────────────────

/// A status-code pattern: `404`, `40x`, `4xx` or `xxx`.
///
/// Used for the list of faults that are always committed, whatever their
/// marker says.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FaultShape {
    digits: [Option<u8>; 3],
}

impl FaultShape {
    /// The `2xx` family.
    pub const OK: Self = Self { digits: [Some(2), None, None] };

    pub fn matches(&self, status: StatusCode) -> bool {
        let code = status.as_u16();
        let actual = [(code / 100) as u8, (code / 10 % 10) as u8, (code % 10) as u8];
        self.digits
            .iter()
            .zip(actual)
            .all(|(want, got)| want.is_none_or(|w| w == got))
    }
}

impl FromStr for FaultShape {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidFaultShape(s.to_owned());
        let bytes = s.trim().as_bytes();
        if bytes.len() != 3 {
            return Err(invalid());
        }

        let mut digits = [None; 3];
        let mut wildcard = false;
        for (slot, &b) in digits.iter_mut().zip(bytes) {
            match b {
                b'x' | b'X' => wildcard = true,
                b'0'..=b'9' if !wildcard => *slot = Some(b - b'0'),
                _ => return Err(invalid()),
            }
        }
        if matches!(digits[0], Some(d) if !(1..=5).contains(&d)) {
            return Err(invalid());
        }
        Ok(Self { digits })
    }
}

impl fmt::Display for FaultShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in self.digits {
            match d {
                Some(d) => write!(f, "{d}")?,
                None => f.write_str("x")?,
            }
        }
        Ok(())
    }
}
