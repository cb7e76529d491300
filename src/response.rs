//! Outgoing HTTP response container and the [`IntoResponse`] conversion trait.
//!
//! A [`Response`] is created empty, next to its [`Request`](crate::Request),
//! mutated by application code, and turned into wire format exactly once at
//! the end of the transaction.
//!
//! It never guesses a content type. Either the application sets one, or the
//! REST layer applies its configured default when writing the dispatch result.

use std::fmt;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue, SET_COOKIE};
use http::StatusCode;
use http_body_util::Full;
use serde::Serialize;

use crate::fault::HttpFault;
use crate::upgrade::{BoxedProtocolHandler, ProtocolHandler};

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for use with [`Response::set_content_type`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml",
        }
    }
}

impl From<ContentType> for String {
    fn from(ct: ContentType) -> String {
        ct.as_str().to_owned()
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// The mutable response paired with each request.
///
/// ```rust
/// use portico::{ContentType, Response};
///
/// let mut response = Response::new();
/// assert_eq!(response.content_type(), "");
///
/// response.set_content_type(ContentType::Json);
/// response.set_json_body(&[1, 2, 3]).unwrap();
/// assert_eq!(response.body(), b"[1,2,3]");
/// ```
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    content_type: String,
    body: Bytes,
    protocol_handler: Option<BoxedProtocolHandler>,
}

impl Response {
    /// `200 OK`, no content type, empty body.
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            content_type: String::new(),
            body: Bytes::new(),
            protocol_handler: None,
        }
    }

    /// Response with no body.
    pub fn status_only(status: StatusCode) -> Self {
        let mut response = Self::new();
        response.status = status;
        response
    }

    pub fn status(&self) -> StatusCode { self.status }
    pub fn set_status(&mut self, status: StatusCode) { self.status = status; }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }
    pub fn body(&self) -> &[u8] { &self.body }

    /// The content type, or `""` if nobody set one.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
    }

    /// Writes raw bytes, whatever the content type.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Serialises `value` as the body. The content type is left alone.
    pub fn set_json_body<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        self.body = Bytes::from(serde_json::to_vec(value)?);
        Ok(())
    }

    /// Appends a `Set-Cookie: name=value; Path=/` header.
    ///
    /// Cookies that need more attributes can be appended as raw
    /// `Set-Cookie` headers through [`headers_mut`](Self::headers_mut).
    pub fn set_cookie(&mut self, name: &str, value: &str) {
        if let Ok(v) = HeaderValue::from_str(&format!("{name}={value}; Path=/")) {
            self.headers.append(SET_COOKIE, v);
        }
    }

    /// Copies every cookie set on this response onto `fault`.
    pub fn merge_cookies(&self, fault: &mut HttpFault) {
        for cookie in self.headers.get_all(SET_COOKIE) {
            fault.headers_mut().append(SET_COOKIE, cookie.clone());
        }
    }

    /// Accepts a pending WebSocket handshake: once the transaction completes
    /// successfully, `handler` takes over the connection.
    ///
    /// Ignored when the request was not a WebSocket handshake.
    pub fn switch_protocols(&mut self, handler: impl ProtocolHandler) {
        self.protocol_handler = Some(handler.into_boxed_handler());
    }

    pub fn has_protocol_handler(&self) -> bool {
        self.protocol_handler.is_some()
    }

    pub(crate) fn take_protocol_handler(&mut self) -> Option<BoxedProtocolHandler> {
        self.protocol_handler.take()
    }

    /// Serialises into the hyper/http response type.
    pub fn into_inner(self) -> http::Response<Full<Bytes>> {
        let mut response = http::Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        if !self.content_type.is_empty() {
            if let Ok(ct) = HeaderValue::from_str(&self.content_type) {
                response.headers_mut().insert(CONTENT_TYPE, ct);
            }
        }
        response
    }
}

impl Default for Response {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_type", &self.content_type)
            .field("body", &self.body.len())
            .field("protocol_handler", &self.protocol_handler.is_some())
            .finish()
    }
}

// ── IntoResponse ──────────────────────────────────────────────────────────────

/// Conversion into an HTTP [`Response`].
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response { self }
}

impl IntoResponse for StatusCode {
    fn into_response(self) -> Response { Response::status_only(self) }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response {
        let mut response = Response::new();
        response.set_content_type(ContentType::Text);
        response.set_body(self);
        response
    }
}

impl IntoResponse for String {
    fn into_response(self) -> Response {
        let mut response = Response::new();
        response.set_content_type(ContentType::Text);
        response.set_body(self);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_content_type_by_default() {
        let response = Response::new();
        assert_eq!(response.content_type(), "");
        assert!(response.into_inner().headers().get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn cookies_survive_onto_a_fault() {
        let mut response = Response::new();
        response.set_cookie("session", "abc");
        response.set_cookie("theme", "dark");

        let mut fault = HttpFault::see_other("/");
        response.merge_cookies(&mut fault);

        let cookies: Vec<_> = fault.headers().get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies, ["session=abc; Path=/", "theme=dark; Path=/"]);
    }

    #[test]
    fn into_inner_carries_status_headers_and_body() {
        let mut response = Response::status_only(StatusCode::CREATED);
        response.set_content_type(ContentType::Xml);
        response.set_body(&b"<ok/>"[..]);

        let inner = response.into_inner();
        assert_eq!(inner.status(), StatusCode::CREATED);
        assert_eq!(inner.headers()[CONTENT_TYPE], "application/xml");
    }
}
