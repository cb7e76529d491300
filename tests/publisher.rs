use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, SET_COOKIE, UPGRADE,
};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use portico::exceptions::{EXCEPTION_HANDLER, HTTP_EXCEPTION_HANDLER};
use portico::{
    App, Config, Dispatch, DispatchContext, ErrorPages, ExceptionContext, ExceptionsService, Fault,
    HandlerRegistry, HttpFault, Message, MountTable, Publisher, Redirect, Request, RestApp, Router,
    Socket, Transaction,
};
use serde_json::json;

// ── Fixtures ─────────────────────────────────────────────────────────────────

/// A small shop: every path exercises one way a transaction can end.
struct Shop;

impl Router for Shop {
    type Args = String;

    fn create_dispatch_args(&self, _request: &Request, path: &str) -> String {
        path.to_owned()
    }

    fn dispatch(&self, cx: &mut DispatchContext<'_>, path: String) -> Result<Dispatch<String>, Fault> {
        match path.as_str() {
            "" | "/" => Ok(Dispatch::Continue("/index".to_owned())),
            "/index" => Ok(Dispatch::done(json!({ "page": "index" }))),
            "/checkout" => {
                cx.response.set_cookie("cart", "paid");
                let redirect = Redirect::to("/shop/thanks").commit();
                Err(cx.request.create_redirect_response(redirect, Some(&*cx.response)).into())
            }
            "/login" => Err(cx.request.create_redirect_response(Redirect::here(), None).into()),
            "/boom" => Err(Fault::other("database gone")),
            "/panic" => {
                let stock: Vec<u32> = Vec::new();
                Ok(Dispatch::done(json!({ "stock": stock[3] })))
            }
            "/loop" => Ok(Dispatch::Continue("/loop".to_owned())),
            "/chat" => {
                cx.response.switch_protocols(greet);
                Ok(Dispatch::done(()))
            }
            _ => Err(HttpFault::not_found().into()),
        }
    }
}

async fn greet(mut socket: Socket) {
    let _ = socket.send(Message::text("hello")).await;
    let _ = socket.close(None).await;
}

#[derive(Clone, Default)]
struct Ledger {
    commits: Arc<AtomicUsize>,
    rollbacks: Arc<AtomicUsize>,
}

impl Ledger {
    fn counts(&self) -> (usize, usize) {
        (self.commits.load(Ordering::SeqCst), self.rollbacks.load(Ordering::SeqCst))
    }
}

impl Transaction for Ledger {
    fn commit(&self) {
        self.commits.fetch_add(1, Ordering::SeqCst);
    }

    fn rollback(&self, _fault: &Fault) {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn publisher(errors: &Path) -> (Publisher<RestApp<Shop>>, Ledger) {
    init_tracing();
    let ledger = Ledger::default();
    let mut statics = MountTable::new();
    let exceptions = ExceptionsService::new(ErrorPages::new(errors));
    let app = RestApp::new(App::new("shop", None), Shop).with_max_dispatch(8);
    let publisher = Publisher::start(app, exceptions, &mut statics).with_transaction(ledger.clone());
    assert_eq!(statics.mounts(), ["/shop"]);
    (publisher, ledger)
}

fn get(uri: &str) -> http::request::Builder {
    http::Request::get(uri).header(HOST, "shop.example")
}

fn handshake(uri: &str) -> http::request::Builder {
    get(uri)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_VERSION, "13")
        .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
        .header(SEC_WEBSOCKET_PROTOCOL, "chat, binary")
}

async fn send(
    publisher: &Publisher<RestApp<Shop>>,
    builder: http::request::Builder,
) -> (http::response::Parts, Bytes) {
    let req = builder.body(Full::new(Bytes::new())).unwrap();
    let res = publisher.handle(req).await.unwrap();
    let (parts, body) = res.into_parts();
    (parts, body.collect().await.unwrap().to_bytes())
}

// ── Plain transactions ───────────────────────────────────────────────────────

#[tokio::test]
async fn successful_transaction_commits() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, ledger) = publisher(dir.path());

    let (parts, body) = send(&publisher, get("/shop")).await;
    assert_eq!(parts.status, StatusCode::OK);
    assert_eq!(parts.headers[CONTENT_TYPE], "application/json");
    assert_eq!(body, r#"{"page":"index"}"#);
    assert_eq!(ledger.counts(), (1, 0));
}

#[tokio::test]
async fn committed_redirect_keeps_cookies() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, ledger) = publisher(dir.path());

    let (parts, _) = send(&publisher, get("/shop/checkout")).await;
    assert_eq!(parts.status, StatusCode::SEE_OTHER);
    assert_eq!(parts.headers[LOCATION], "/shop/thanks/");
    assert_eq!(parts.headers[SET_COOKIE], "cart=paid; Path=/");
    assert_eq!(ledger.counts(), (1, 0));
}

#[tokio::test]
async fn uncommitted_redirect_rolls_back_but_still_answers() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, ledger) = publisher(dir.path());

    let (parts, _) = send(&publisher, get("/shop/login").header("x-forwarded-proto", "https")).await;
    assert_eq!(parts.status, StatusCode::SEE_OTHER);
    assert_eq!(parts.headers[LOCATION], "https://shop.example/shop/login/");
    assert_eq!(ledger.counts(), (0, 1));
}

#[tokio::test]
async fn xhr_clients_get_service_unavailable_instead_of_a_redirect() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, _) = publisher(dir.path());

    let (parts, _) = send(&publisher, get("/shop/checkout?_a=1")).await;
    assert_eq!(parts.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(parts.headers[LOCATION], "/shop/thanks/");

    let xhr = get("/shop/checkout").header("x-requested-with", "XMLHttpRequest");
    let (parts, _) = send(&publisher, xhr).await;
    assert_eq!(parts.status, StatusCode::SERVICE_UNAVAILABLE);
}

// ── Faults ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unshaped_fault_becomes_a_generic_500() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, ledger) = publisher(dir.path());

    let (parts, body) = send(&publisher, get("/shop/boom")).await;
    assert_eq!(parts.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "500 Internal Server Error\n");
    assert!(!String::from_utf8_lossy(&body).contains("database"));
    assert_eq!(ledger.counts(), (0, 1));
}

#[tokio::test]
async fn panicking_router_is_a_500_and_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, ledger) = publisher(dir.path());

    let (parts, body) = send(&publisher, get("/shop/panic")).await;
    assert_eq!(parts.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "500 Internal Server Error\n");
    assert_eq!(ledger.counts(), (0, 1));

    // The publisher keeps serving afterwards.
    let (parts, _) = send(&publisher, get("/shop/index")).await;
    assert_eq!(parts.status, StatusCode::OK);
    assert_eq!(ledger.counts(), (1, 1));
}

#[tokio::test]
async fn runaway_router_is_a_500() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, _) = publisher(dir.path());

    let (parts, _) = send(&publisher, get("/shop/loop")).await;
    assert_eq!(parts.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn error_pages_replace_default_bodies() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("4xx"), "<h1>Nothing here</h1>").unwrap();
    fs::write(dir.path().join("5xx"), "<h1>Our fault</h1>").unwrap();
    let (publisher, _) = publisher(dir.path());

    let (parts, body) = send(&publisher, get("/shop/nowhere")).await;
    assert_eq!(parts.status, StatusCode::NOT_FOUND);
    assert_eq!(parts.headers[CONTENT_TYPE], "text/html; charset=utf-8");
    assert_eq!(body, "<h1>Nothing here</h1>");

    let (parts, body) = send(&publisher, get("/shop/boom")).await;
    assert_eq!(parts.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "<h1>Our fault</h1>");
}

#[tokio::test]
async fn undecodable_requests_are_client_errors() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, ledger) = publisher(dir.path());

    let (parts, _) = send(&publisher, get("/shop/%ff")).await;
    assert_eq!(parts.status, StatusCode::BAD_REQUEST);

    let (parts, _) = send(&publisher, get("/shop/index?q=%c3%28")).await;
    assert_eq!(parts.status, StatusCode::BAD_REQUEST);

    assert_eq!(ledger.counts(), (0, 0));
}

// ── Upgrades ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn accepted_handshake_switches_protocols() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, ledger) = publisher(dir.path());

    let (parts, body) = send(&publisher, handshake("/shop/chat")).await;
    assert_eq!(parts.status, StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(parts.headers[SEC_WEBSOCKET_ACCEPT], "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    assert_eq!(parts.headers[SEC_WEBSOCKET_PROTOCOL], "binary");
    assert_eq!(parts.headers[CONTENT_LENGTH], "0");
    assert!(body.is_empty());
    assert_eq!(ledger.counts(), (1, 0));
}

#[tokio::test]
async fn handshake_stays_http_unless_the_application_accepts_it() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, _) = publisher(dir.path());

    let (parts, _) = send(&publisher, handshake("/shop/index")).await;
    assert_eq!(parts.status, StatusCode::OK);

    let (parts, _) = send(&publisher, handshake("/shop/nowhere")).await;
    assert_eq!(parts.status, StatusCode::NOT_FOUND);

    // Accepting without a handshake changes nothing.
    let (parts, _) = send(&publisher, get("/shop/chat")).await;
    assert_eq!(parts.status, StatusCode::OK);
}

#[tokio::test]
async fn websocket_client_receives_messages_after_the_upgrade() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, _) = publisher(dir.path());
    let (client_io, server_io) = tokio::io::duplex(4096);

    tokio::spawn(async move {
        let svc = service_fn(move |req: http::Request<Incoming>| {
            let publisher = publisher.clone();
            async move { publisher.handle(req).await }
        });
        let _ = http1::Builder::new()
            .serve_connection(TokioIo::new(server_io), svc)
            .with_upgrades()
            .await;
    });

    let (mut ws, res) = tokio_tungstenite::client_async("ws://shop.example/shop/chat", client_io)
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SWITCHING_PROTOCOLS);

    let msg = ws.next().await.unwrap().unwrap();
    assert_eq!(msg.to_text().unwrap(), "hello");
}

// ── Configuration ────────────────────────────────────────────────────────────

fn audit(fault: Fault, cx: &ExceptionContext<'_>) -> Fault {
    match fault {
        Fault::Http(mut shaped) if cx.request.is_some_and(|r| r.path().ends_with("/login")) => {
            shaped.headers_mut().insert("x-audited", http::HeaderValue::from_static("1"));
            shaped.into()
        }
        other => other,
    }
}

#[tokio::test]
async fn configured_publisher() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::from_toml(&format!(
        r#"
        [application]
        name = "shop"
        data = '{data}'

        [exceptions]
        exception_handlers = ["{EXCEPTION_HANDLER}", "{HTTP_EXCEPTION_HANDLER}", "shop::audit"]
        commit_exceptions = ["2xx", "303"]

        [websocket]
        protocols = ["chat"]
        "#,
        data = dir.path().display(),
    ))
    .unwrap();

    let registry = HandlerRegistry::new().with("shop::audit", audit);
    let ledger = Ledger::default();
    let mut statics = MountTable::new();
    let app = RestApp::from_config(&config.application, Shop);
    let publisher = Publisher::from_config(&config, app, &registry, &mut statics)
        .unwrap()
        .with_transaction(ledger.clone());

    assert!(publisher.exceptions().is_sealed());
    assert_eq!(publisher.exceptions().handler_names().len(), 3);
    assert_eq!(publisher.exceptions().error_pages_dir(), dir.path().join("http_errors"));

    let (parts, _) = send(&publisher, get("/shop/login")).await;
    assert_eq!(parts.status, StatusCode::SEE_OTHER);
    assert_eq!(parts.headers["x-audited"], "1");
    assert_eq!(ledger.counts(), (1, 0));

    let (parts, _) = send(&publisher, handshake("/shop/chat")).await;
    assert_eq!(parts.headers[SEC_WEBSOCKET_PROTOCOL], "chat");
}

#[test]
fn unknown_handler_reference_fails_at_startup() {
    let config = Config::from_toml(
        r#"
        [application]
        name = "shop"

        [exceptions]
        exception_handlers = ["shop::missing"]
        "#,
    )
    .unwrap();

    let mut statics = MountTable::new();
    let app = RestApp::from_config(&config.application, Shop);
    let result = Publisher::from_config(&config, app, &HandlerRegistry::new(), &mut statics);
    assert!(matches!(result, Err(portico::Error::UnknownHandler(name)) if name == "shop::missing"));
    assert!(statics.mounts().is_empty());
}
