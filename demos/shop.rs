//! A tiny shop served by hyper, with portico handling every transaction.
//!
//! ```text
//! cargo run --example shop
//! curl -i localhost:3000/shop/items/7
//! curl -i localhost:3000/shop/checkout
//! ```
//!
//! Drop files named `404`, `4xx` or `default` into `data/http_errors` to
//! customise error bodies.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use portico::{
    App, Dispatch, DispatchContext, ErrorPages, ExceptionsService, Fault, HttpFault, MountTable,
    Publisher, Redirect, Request, RestApp, Router, Socket, Transport,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

struct Shop;

impl Router for Shop {
    type Args = Vec<String>;

    fn create_dispatch_args(&self, _request: &Request, path: &str) -> Vec<String> {
        path.split('/').filter(|s| !s.is_empty()).map(str::to_owned).collect()
    }

    fn dispatch(&self, cx: &mut DispatchContext<'_>, args: Vec<String>) -> Result<Dispatch<Vec<String>>, Fault> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            [] => Ok(Dispatch::Continue(vec!["items".to_owned()])),
            ["items"] => Ok(Dispatch::done(json!([{ "id": 7, "name": "teapot" }]))),
            ["items", id] => match id.parse::<u32>() {
                Ok(7) => Ok(Dispatch::done(json!({ "id": 7, "name": "teapot" }))),
                _ => Err(HttpFault::not_found().into()),
            },
            ["checkout"] => {
                cx.response.set_cookie("cart", "empty");
                let redirect = Redirect::to(format!("{}/items", cx.app.url())).commit();
                Err(cx.request.create_redirect_response(redirect, Some(&*cx.response)).into())
            }
            ["ws"] => {
                cx.response.switch_protocols(echo);
                Ok(Dispatch::done(()))
            }
            _ => Err(HttpFault::not_found().into()),
        }
    }
}

async fn echo(mut socket: Socket) {
    while let Some(Ok(msg)) = socket.next().await {
        if (msg.is_text() || msg.is_binary()) && socket.send(msg).await.is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let mut statics = MountTable::new();
    let exceptions = ExceptionsService::new(ErrorPages::new("data/http_errors"));
    let app = RestApp::new(App::new("shop", None), Shop);
    let publisher = Publisher::start(app, exceptions, &mut statics);

    let addr: SocketAddr = "127.0.0.1:3000".parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, mounts = ?statics.mounts(), "shop listening");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received");
                return Ok(());
            }

            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let publisher = publisher.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |mut req: http::Request<Incoming>| {
                        let publisher = publisher.clone();
                        req.extensions_mut().insert(Transport {
                            scheme: "http".to_owned(),
                            local_addr: Some(addr),
                            remote_addr: Some(remote_addr),
                        });
                        async move { publisher.handle(req).await }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .with_upgrades()
                        .await
                    {
                        error!(peer = %remote_addr, "connection error: {e}");
                    }
                });
            }
        }
    }
}
