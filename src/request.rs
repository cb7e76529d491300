//! Incoming request view.
//!
//! A [`Request`] is built once per transaction from the transport's
//! [`Environ`] and answers the questions downstream code keeps asking: which
//! scheme, host and port did the *client* use (through however many reverse
//! proxies), is this an XHR, where should a redirect point.

use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, HeaderMap, HeaderName};
use http::{Extensions, Method, StatusCode, Uri};
use percent_encoding::{percent_decode, percent_decode_str};

use crate::error::DecodeError;
use crate::fault::HttpFault;
use crate::response::Response;
use crate::upgrade::{self, Handshake};

static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
static X_REQUESTED_WITH: HeaderName = HeaderName::from_static("x-requested-with");

/// Parameter that flags a request as XHR when the client cannot set headers.
pub const XHR_PARAM: &str = "_a";

// ── Environ ──────────────────────────────────────────────────────────────────

/// What the server itself knows about the connection a request arrived on.
///
/// Transports attach it as a request extension; when absent, plain `http`
/// with no known address is assumed.
#[derive(Clone, Debug)]
pub struct Transport {
    pub scheme: String,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

impl Default for Transport {
    fn default() -> Self {
        Self { scheme: "http".to_owned(), local_addr: None, remote_addr: None }
    }
}

/// The raw transaction as delivered by the transport, body fully read.
#[derive(Debug)]
pub struct Environ {
    pub(crate) parts: http::request::Parts,
    pub(crate) body: Bytes,
    pub(crate) transport: Transport,
    pub(crate) handshake: Option<Handshake>,
}

impl Environ {
    pub fn new(req: http::Request<Bytes>) -> Self {
        let handshake = upgrade::negotiate(&req);
        let (parts, body) = req.into_parts();
        let transport = parts.extensions.get::<Transport>().cloned().unwrap_or_default();
        Self { parts, body, transport, handshake }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }
}

// ── Origin ───────────────────────────────────────────────────────────────────

/// Scheme, hostname and port as seen by the client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Origin {
    pub scheme: String,
    pub hostname: String,
    pub port: Option<u16>,
}

impl Origin {
    /// `scheme://hostname[:port]`, port omitted when it is the scheme's default.
    pub fn url(&self) -> String {
        let default_port = match self.scheme.as_str() {
            "http" => Some(80),
            "https" => Some(443),
            _ => None,
        };
        match self.port {
            Some(port) if Some(port) != default_port => {
                format!("{}://{}:{}", self.scheme, self.hostname, port)
            }
            _ => format!("{}://{}", self.scheme, self.hostname),
        }
    }
}

// ── Request ──────────────────────────────────────────────────────────────────

/// An incoming HTTP request.
pub struct Request {
    method: Method,
    uri: Uri,
    path: String,
    headers: HeaderMap,
    body: Bytes,
    params: Vec<(String, String)>,
    transport: Transport,
    handshake: Option<Handshake>,
    extensions: Extensions,
    is_authenticated: bool,
}

impl Request {
    /// Decodes the path and the query/form parameters.
    ///
    /// Fails on anything that is not valid percent-encoded UTF-8.
    pub fn from_environ(environ: Environ) -> Result<Self, DecodeError> {
        let Environ { parts, body, transport, handshake } = environ;

        let path = percent_decode_str(parts.uri.path())
            .decode_utf8()
            .map_err(|e| DecodeError::new("path", e.to_string()))?
            .into_owned();

        let mut params = match parts.uri.query() {
            Some(query) => decode_pairs(query, "query")?,
            None => Vec::new(),
        };

        let is_form = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if is_form && !body.is_empty() {
            let form = std::str::from_utf8(&body)
                .map_err(|e| DecodeError::new("body", e.to_string()))?;
            params.extend(decode_pairs(form, "body")?);
        }

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            path,
            headers: parts.headers,
            body,
            params,
            transport,
            handshake,
            extensions: parts.extensions,
            is_authenticated: false,
        })
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn transport(&self) -> &Transport { &self.transport }

    /// Percent-decoded path.
    pub fn path(&self) -> &str { &self.path }

    pub fn query_string(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Query and form parameters, in order, duplicates preserved.
    pub fn params(&self) -> &[(String, String)] { &self.params }

    /// First value of a parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Every value of a repeated parameter.
    pub fn param_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.params.iter().filter(move |(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k == name)
    }

    /// Set by authentication middleware; `false` until then.
    pub fn is_authenticated(&self) -> bool { self.is_authenticated }
    pub fn set_authenticated(&mut self, authenticated: bool) { self.is_authenticated = authenticated; }

    /// Attributes attached by middleware.
    pub fn extensions(&self) -> &Extensions { &self.extensions }
    pub fn extensions_mut(&mut self) -> &mut Extensions { &mut self.extensions }

    /// The pending WebSocket handshake, if the client asked for one.
    pub fn websocket(&self) -> Option<&Handshake> { self.handshake.as_ref() }

    /// Resolves scheme, hostname and port through forwarding headers.
    ///
    /// Precedence:
    /// - scheme: `X-Forwarded-Proto`, then the transport's scheme
    /// - host: `X-Forwarded-Host`, then `Host`, then the transport's authority
    /// - port: `X-Forwarded-Port` when numeric, then the port of the chosen host
    ///
    /// Only the first entry of a comma-separated list counts: it was added by
    /// the proxy closest to the client.
    pub fn scheme_hostname_port(&self) -> Origin {
        let scheme = self
            .first_forwarded(&X_FORWARDED_PROTO)
            .map(str::to_owned)
            .unwrap_or_else(|| self.transport_scheme());

        let (hostname, host_port) = match self
            .first_forwarded(&X_FORWARDED_HOST)
            .or_else(|| self.first_forwarded(&HOST))
        {
            Some(host) => split_host_port(host),
            None => self.transport_host(),
        };

        let port = self
            .first_forwarded(&X_FORWARDED_PORT)
            .and_then(|p| p.parse::<u16>().ok())
            .or(host_port);

        Origin { scheme, hostname, port }
    }

    /// The resolved port, if any.
    pub fn host_port(&self) -> Option<u16> {
        self.scheme_hostname_port().port
    }

    /// `scheme://host[:port]` as the client sees it. Never a trailing slash.
    pub fn host_url(&self) -> String {
        self.scheme_hostname_port().url()
    }

    /// Absolute URL of the current path, without the query string.
    pub fn path_url(&self) -> String {
        format!("{}{}", self.host_url(), self.uri.path())
    }

    /// True for `X-Requested-With: XMLHttpRequest` or when an `_a` parameter
    /// is present (forms and WebSocket bootstraps cannot set the header).
    pub fn is_xhr(&self) -> bool {
        let native = self
            .headers
            .get(&X_REQUESTED_WITH)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"XMLHttpRequest"));
        native || self.has_param(XHR_PARAM)
    }

    /// Builds a redirect target.
    ///
    /// `location` defaults to [`path_url`](Self::path_url). A trailing slash
    /// is added when `add_slash` is set and missing; `params` become a
    /// URL-encoded query string.
    ///
    /// ```rust,ignore
    /// req.create_redirect_url(Some("/x"), true, &[("a", "1")]); // "/x/?a=1"
    /// ```
    pub fn create_redirect_url<K, V>(&self, location: Option<&str>, add_slash: bool, params: &[(K, V)]) -> String
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut url = match location {
            Some(location) if !location.is_empty() => location.to_owned(),
            _ => self.path_url(),
        };

        if add_slash && !url.ends_with('/') {
            url.push('/');
        }

        if !params.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
                .finish();
            url.push('?');
            url.push_str(&query);
        }

        url
    }

    /// Builds the redirect fault described by `redirect`.
    ///
    /// XHR clients get `503 Service Unavailable` with a `Location` instead of
    /// the requested redirection, so the browser does not follow it silently.
    /// Cookies already set on `response` are carried over.
    pub fn create_redirect_response(&self, redirect: Redirect, response: Option<&Response>) -> HttpFault {
        let url = self.create_redirect_url(redirect.location.as_deref(), redirect.add_slash, &redirect.params[..]);
        let status = if self.is_xhr() { StatusCode::SERVICE_UNAVAILABLE } else { redirect.status };

        let mut fault = HttpFault::redirect(status, &url);
        fault.commit_transaction = redirect.commit_transaction;
        if let Some(response) = response {
            response.merge_cookies(&mut fault);
        }
        fault
    }

    fn first_forwarded(&self, name: &HeaderName) -> Option<&str> {
        let value = self.headers.get(name)?.to_str().ok()?;
        let first = value.split(',').next()?.trim();
        (!first.is_empty()).then_some(first)
    }

    fn transport_scheme(&self) -> String {
        self.uri
            .scheme_str()
            .map(str::to_owned)
            .unwrap_or_else(|| self.transport.scheme.clone())
    }

    fn transport_host(&self) -> (String, Option<u16>) {
        if let Some(authority) = self.uri.authority() {
            return (authority.host().to_owned(), authority.port_u16());
        }
        match self.transport.local_addr {
            Some(addr) => {
                let host = match addr {
                    SocketAddr::V4(a) => a.ip().to_string(),
                    SocketAddr::V6(a) => format!("[{}]", a.ip()),
                };
                (host, Some(addr.port()))
            }
            None => ("localhost".to_owned(), None),
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("is_authenticated", &self.is_authenticated)
            .field("websocket", &self.handshake.is_some())
            .finish_non_exhaustive()
    }
}

/// `host[:port]`, IPv6 literals kept in brackets. A non-numeric port is dropped.
fn split_host_port(host: &str) -> (String, Option<u16>) {
    let (name, port) = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => (&host[..=end], host[end + 1..].strip_prefix(':')),
            None => (host, None),
        }
    } else {
        match host.split_once(':') {
            Some((name, port)) => (name, Some(port)),
            None => (host, None),
        }
    };
    (name.to_owned(), port.and_then(|p| p.parse().ok()))
}

fn decode_pairs(input: &str, part: &'static str) -> Result<Vec<(String, String)>, DecodeError> {
    let decode = |s: &str| {
        let s = s.replace('+', " ");
        percent_decode(s.as_bytes())
            .decode_utf8()
            .map(|v| v.into_owned())
            .map_err(|e| DecodeError::new(part, e.to_string()))
    };

    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((decode(k)?, decode(v)?))
        })
        .collect()
}

// ── Redirect ─────────────────────────────────────────────────────────────────

/// What [`Request::create_redirect_response`] should build.
///
/// Defaults: current path, `303 See Other`, trailing slash added, no
/// parameters, not committed.
#[derive(Clone, Debug)]
pub struct Redirect {
    location: Option<String>,
    status: StatusCode,
    commit_transaction: bool,
    add_slash: bool,
    params: Vec<(String, String)>,
}

impl Redirect {
    /// Redirect back to the current path.
    pub fn here() -> Self {
        Self {
            location: None,
            status: StatusCode::SEE_OTHER,
            commit_transaction: false,
            add_slash: true,
            params: Vec::new(),
        }
    }

    pub fn to(location: impl Into<String>) -> Self {
        Self { location: Some(location.into()), ..Self::here() }
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn commit(mut self) -> Self {
        self.commit_transaction = true;
        self
    }

    pub fn add_slash(mut self, add_slash: bool) -> Self {
        self.add_slash = add_slash;
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }
}

impl Default for Redirect {
    fn default() -> Self { Self::here() }
}
