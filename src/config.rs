//! TOML configuration.
//!
//! ```toml
//! [application]
//! name = "shop"
//! url = "/store"
//!
//! [exceptions]
//! commit_exceptions = ["2xx", "303"]
//! http_errors_path = "$data/http_errors"
//!
//! [websocket]
//! protocols = ["binary", "chat"]
//! ```
//!
//! Only `application.name` is required. Everything is checked by
//! [`Config::validate`] before any service is built from it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::exceptions::{EXCEPTION_HANDLER, HTTP_EXCEPTION_HANDLER};
use crate::fault::FaultShape;
use crate::rest::{DEFAULT_MAX_DISPATCH, JSON};

/// Placeholder in paths standing for [`ApplicationConfig::data`].
pub const DATA_VAR: &str = "$data";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub application: ApplicationConfig,

    #[serde(default)]
    pub exceptions: ExceptionsConfig,

    #[serde(default)]
    pub websocket: WebSocketConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplicationConfig {
    pub name: String,

    /// Mount point. Defaults to `/<name>`.
    #[serde(default)]
    pub url: Option<String>,

    /// Applied by REST applications when a handler sets none. Empty means
    /// `application/octet-stream`.
    #[serde(default = "default_content_type")]
    pub default_content_type: String,

    /// Bound on routing trampoline iterations.
    #[serde(default = "default_max_dispatch")]
    pub max_dispatch: usize,

    /// Root substituted for `$data`.
    #[serde(default = "default_data")]
    pub data: String,
}

impl ApplicationConfig {
    /// Defaults for an application called `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: None,
            default_content_type: default_content_type(),
            max_dispatch: default_max_dispatch(),
            data: default_data(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExceptionsConfig {
    /// Handler references, in chain order.
    pub exception_handlers: Vec<String>,

    /// Fault shapes always delivered and committed.
    pub commit_exceptions: Vec<String>,

    pub http_errors_path: String,
}

impl Default for ExceptionsConfig {
    fn default() -> Self {
        Self {
            exception_handlers: vec![EXCEPTION_HANDLER.to_owned(), HTTP_EXCEPTION_HANDLER.to_owned()],
            commit_exceptions: vec!["2xx".to_owned()],
            http_errors_path: format!("{DATA_VAR}/http_errors"),
        }
    }
}

impl ExceptionsConfig {
    pub fn commit_shapes(&self) -> Result<Vec<FaultShape>> {
        self.commit_exceptions.iter().map(|s| s.parse()).collect()
    }

    /// The error pages directory with `$data` replaced by `data`.
    pub fn http_errors_dir(&self, data: &str) -> PathBuf {
        PathBuf::from(self.http_errors_path.replace(DATA_VAR, data))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Subprotocols this server speaks, in preference order.
    pub protocols: Vec<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self { protocols: vec!["binary".to_owned()] }
    }
}

fn default_content_type() -> String {
    JSON.to_owned()
}

fn default_max_dispatch() -> usize {
    DEFAULT_MAX_DISPATCH
}

fn default_data() -> String {
    "data".to_owned()
}

impl Config {
    /// Parses and validates `content`.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.application.name.trim().is_empty() {
            return Err(Error::ConfigInvalid("application.name must not be empty".into()));
        }
        if self.application.max_dispatch == 0 {
            return Err(Error::ConfigInvalid("application.max_dispatch must be at least 1".into()));
        }
        if self.websocket.protocols.iter().any(|p| p.trim().is_empty()) {
            return Err(Error::ConfigInvalid("websocket.protocols must not contain empty names".into()));
        }
        self.exceptions.commit_shapes()?;
        Ok(())
    }

    /// Error pages directory, `$data` resolved.
    pub fn http_errors_dir(&self) -> PathBuf {
        self.exceptions.http_errors_dir(&self.application.data)
    }
}

/// Loads and validates the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
        path: path.to_owned(),
        source,
    })?;
    Config::from_toml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_takes_defaults() {
        let config = Config::from_toml("[application]\nname = \"shop\"\n").unwrap();
        assert_eq!(config.application.url, None);
        assert_eq!(config.application.default_content_type, JSON);
        assert_eq!(config.application.max_dispatch, 32);
        assert_eq!(config.exceptions.exception_handlers, [EXCEPTION_HANDLER, HTTP_EXCEPTION_HANDLER]);
        assert_eq!(config.exceptions.commit_shapes().unwrap(), [FaultShape::OK]);
        assert_eq!(config.websocket.protocols, ["binary"]);
        assert_eq!(config.http_errors_dir(), Path::new("data/http_errors"));
    }

    #[test]
    fn data_root_is_substituted() {
        let config = Config::from_toml(
            r#"
            [application]
            name = "shop"
            data = "/srv/shop"

            [exceptions]
            commit_exceptions = ["2xx", "303"]
            "#,
        )
        .unwrap();
        assert_eq!(config.http_errors_dir(), Path::new("/srv/shop/http_errors"));
        assert_eq!(config.exceptions.commit_shapes().unwrap().len(), 2);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_shape = "[application]\nname = \"a\"\n[exceptions]\ncommit_exceptions = [\"2x\"]\n";
        assert!(matches!(Config::from_toml(bad_shape), Err(Error::InvalidFaultShape(_))));

        let zero = "[application]\nname = \"a\"\nmax_dispatch = 0\n";
        assert!(matches!(Config::from_toml(zero), Err(Error::ConfigInvalid(_))));

        let unnamed = "[application]\nname = \" \"\n";
        assert!(matches!(Config::from_toml(unnamed), Err(Error::ConfigInvalid(_))));

        assert!(matches!(Config::from_toml("[application]\n"), Err(Error::ConfigParse(_))));
    }

    #[test]
    fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portico.toml");
        fs::write(&path, "[application]\nname = \"shop\"\nurl = \"/store/\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.application.url.as_deref(), Some("/store/"));

        let missing = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(Error::ConfigRead { .. })));
    }
}
