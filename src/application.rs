//! Application base.
//!
//! An application is mounted once, at startup, then asked to build a
//! request/response pair and handle it for every transaction. The
//! [`Application`] trait provides the plumbing; concrete applications
//! override [`handle_request`](Application::handle_request).

use tracing::info;

use crate::config::ApplicationConfig;
use crate::error::DecodeError;
use crate::fault::Fault;
use crate::request::{Environ, Request};
use crate::response::Response;

// ── Static-routing collaborator ──────────────────────────────────────────────

/// Whatever serves static content and decides which application owns which
/// URL prefix.
pub trait Statics {
    fn register_app(&mut self, url: &str);
}

/// A [`Statics`] that only remembers the mounts it was given.
#[derive(Debug, Default)]
pub struct MountTable {
    mounts: Vec<String>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mounts(&self) -> &[String] {
        &self.mounts
    }
}

impl Statics for MountTable {
    fn register_app(&mut self, url: &str) {
        self.mounts.push(url.to_owned());
    }
}

// ── App ──────────────────────────────────────────────────────────────────────

/// The state every application shares: its name and where it is mounted.
#[derive(Clone, Debug)]
pub struct App {
    name: String,
    url: String,
    service_url: String,
}

impl App {
    /// Mounts `name` at `url`, or at `/<name>` when no url is given.
    ///
    /// Surrounding slashes are normalised away: `"shop/"`, `"/shop"` and
    /// `"shop"` all mount at `/shop`; `""` mounts at the root.
    pub fn new(name: impl Into<String>, url: Option<&str>) -> Self {
        let name = name.into();
        let url = url.unwrap_or(&name).trim_matches('/');
        let url = if url.is_empty() { String::new() } else { format!("/{url}") };
        let service_url = format!("{url}/service");
        Self { name, url, service_url }
    }

    pub fn from_config(config: &ApplicationConfig) -> Self {
        Self::new(config.name.clone(), config.url.as_deref())
    }

    pub fn name(&self) -> &str { &self.name }

    /// Mount point, no trailing slash, `""` for the root.
    pub fn url(&self) -> &str { &self.url }

    /// Mount point of the application's internal services.
    pub fn service_url(&self) -> &str { &self.service_url }
}

impl Application for App {
    fn app(&self) -> &App { self }
}

// ── Application ──────────────────────────────────────────────────────────────

/// An application the publisher can drive.
///
/// Every method but [`app`](Application::app) has a default.
pub trait Application: Send + Sync + 'static {
    fn app(&self) -> &App;

    /// Builds the request view. Fails on undecodable input.
    fn create_request(&self, environ: Environ) -> Result<Request, DecodeError> {
        Request::from_environ(environ)
    }

    /// Builds the empty response paired with `request`.
    fn create_response(&self, _request: &Request) -> Response {
        Response::new()
    }

    /// Called once, at deployment.
    fn handle_start(&self, statics: &mut dyn Statics) {
        let app = self.app();
        info!(app = app.name(), url = app.url(), "application mounted");
        statics.register_app(app.url());
    }

    /// Fills `response` in for `request`. The base implementation leaves it
    /// untouched.
    fn handle_request(&self, _request: &Request, _response: &mut Response) -> Result<(), Fault> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_url_normalisation() {
        assert_eq!(App::new("shop", None).url(), "/shop");
        assert_eq!(App::new("shop", Some("/store/")).url(), "/store");
        assert_eq!(App::new("shop", Some("a/b")).url(), "/a/b");
        assert_eq!(App::new("shop", Some("/")).url(), "");
        assert_eq!(App::new("shop", Some("")).service_url(), "/service");
        assert_eq!(App::new("shop", None).service_url(), "/shop/service");
    }

    #[test]
    fn handle_start_registers_the_mount_point() {
        let mut statics = MountTable::new();
        App::new("shop", None).handle_start(&mut statics);
        assert_eq!(statics.mounts(), ["/shop"]);
    }

    #[test]
    fn base_handle_request_is_a_passthrough() {
        let app = App::new("shop", None);
        let env = Environ::new(http::Request::get("/").body(bytes::Bytes::new()).unwrap());
        let request = app.create_request(env).unwrap();

        let mut response = app.create_response(&request);
        response.set_body("untouched");
        app.handle_request(&request, &mut response).unwrap();
        assert_eq!(response.body(), b"untouched");
        assert_eq!(response.content_type(), "");
    }
}
