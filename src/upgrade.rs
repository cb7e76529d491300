//! Connection-upgrade trampoline.
//!
//! Every transaction is inspected once, before the application runs, to
//! decide whether it is a plain HTTP exchange or a WebSocket handshake. The
//! decision never changes afterwards.
//!
//! For a handshake the application still sees an ordinary
//! [`Request`](crate::Request)/[`Response`](crate::Response) pair, so
//! authentication and routing run the same way for both protocols. A handler
//! that wants the socket calls [`Response::switch_protocols`]. If the
//! transaction then completes successfully, the HTTP response is replaced by
//! `101 Switching Protocols` and the handler receives exclusive ownership of
//! the connection:
//!
//! ```text
//! negotiate(req) ──► Some(Handshake) ──► app runs ──► switch_protocols(h)?
//!        │                                              │ yes        │ no
//!        ▼                                              ▼            ▼
//!      None ──► plain HTTP                         101 + hand_off  plain HTTP
//! ```

use std::future::Future;
use std::pin::Pin;

use http::header::{
    CONNECTION, CONTENT_LENGTH, HeaderMap, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{Method, StatusCode};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, error};

use crate::response::Response;

/// The upgraded connection handed to a [`ProtocolHandler`]: a server-side
/// WebSocket stream of [`Message`](tokio_tungstenite::tungstenite::Message)s.
pub type Socket = WebSocketStream<TokioIo<Upgraded>>;

// ── Negotiation ──────────────────────────────────────────────────────────────

/// A WebSocket handshake offered by the client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Handshake {
    key: String,
    protocols: Vec<String>,
}

impl Handshake {
    /// The `Sec-WebSocket-Key` sent by the client.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Subprotocols offered in `Sec-WebSocket-Protocol`, in client order.
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// The first protocol of `supported`, in its order, that the client
    /// also offered.
    pub fn select_protocol<'a>(&self, supported: &'a [String]) -> Option<&'a str> {
        supported
            .iter()
            .find(|s| self.protocols.iter().any(|p| p.eq_ignore_ascii_case(s)))
            .map(String::as_str)
    }
}

/// Decides whether `req` is a WebSocket (version 13) handshake.
///
/// Anything short of a complete handshake stays plain HTTP.
pub fn negotiate<B>(req: &http::Request<B>) -> Option<Handshake> {
    let headers = req.headers();
    if req.method() != Method::GET
        || !has_token(headers, CONNECTION, "upgrade")
        || !has_token(headers, UPGRADE, "websocket")
        || headers.get(SEC_WEBSOCKET_VERSION).map(HeaderValue::as_bytes) != Some(&b"13"[..])
    {
        return None;
    }

    let key = headers.get(SEC_WEBSOCKET_KEY)?.to_str().ok()?.trim().to_owned();
    if key.is_empty() {
        return None;
    }

    let protocols = headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect();

    Some(Handshake { key, protocols })
}

/// `Sec-WebSocket-Accept` for a given client key (RFC 6455 §4.2.2).
pub fn accept_key(key: &str) -> String {
    derive_accept_key(key.as_bytes())
}

fn has_token(headers: &HeaderMap, name: http::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// The `101 Switching Protocols` response that confirms `handshake`.
pub(crate) fn switching_protocols(handshake: &Handshake, supported: &[String]) -> Response {
    let mut response = Response::status_only(StatusCode::SWITCHING_PROTOCOLS);
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    if let Ok(accept) = HeaderValue::from_str(&accept_key(handshake.key())) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    }
    if let Some(protocol) = handshake.select_protocol(supported) {
        if let Ok(protocol) = HeaderValue::from_str(protocol) {
            headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol);
        }
    }
    response
}

/// Waits for hyper to release the connection, then gives it to `handler`.
///
/// From here on nothing else touches the socket.
pub(crate) fn hand_off(on_upgrade: OnUpgrade, handler: BoxedProtocolHandler) {
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                debug!("connection upgraded to websocket");
                let socket = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                handler.call(socket).await;
            }
            Err(e) => error!("websocket upgrade failed: {e}"),
        }
    });
}

// ── Protocol handlers ────────────────────────────────────────────────────────

#[doc(hidden)]
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Internal dispatch interface, object-safe counterpart of [`ProtocolHandler`].
#[doc(hidden)]
pub trait ErasedProtocolHandler: Send {
    fn call(self: Box<Self>, socket: Socket) -> BoxFuture;
}

#[doc(hidden)]
pub type BoxedProtocolHandler = Box<dyn ErasedProtocolHandler + 'static>;

/// Implemented for every function that can own an upgraded connection:
///
/// ```text
/// async fn name(socket: Socket)
/// ```
///
/// Sealed: the blanket impl below is the only one.
pub trait ProtocolHandler: private::Sealed + Send + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedProtocolHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut> private::Sealed for F
where
    F: FnOnce(Socket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
}

impl<F, Fut> ProtocolHandler for F
where
    F: FnOnce(Socket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedProtocolHandler {
        Box::new(FnProtocolHandler(self))
    }
}

struct FnProtocolHandler<F>(F);

impl<F, Fut> ErasedProtocolHandler for FnProtocolHandler<F>
where
    F: FnOnce(Socket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(self: Box<Self>, socket: Socket) -> BoxFuture {
        Box::pin((self.0)(socket))
    }
}
