//! User-facing error pages.
//!
//! For a status such as `404` the directory is searched for, in order:
//!
//! ```text
//! 404 → 40x → 4xx → xxx → default
//! ```
//!
//! The first regular file found supplies the body, read whole and used
//! verbatim. No file at all means no override. The search always ends at
//! `default`.

use std::fs;
use std::path::{Path, PathBuf};

use http::StatusCode;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct ErrorPages {
    dir: PathBuf,
}

impl ErrorPages {
    /// Pages are looked up under `dir`. A missing directory is reported once,
    /// here, and then simply yields no pages.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "error pages directory not found, default error bodies will be used");
        }
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File names tried for `status`, most specific first.
    pub fn candidates(status: StatusCode) -> [String; 5] {
        let code = status.as_str();
        [
            code.to_owned(),
            format!("{}x", &code[..2]),
            format!("{}xx", &code[..1]),
            "xxx".to_owned(),
            "default".to_owned(),
        ]
    }

    /// Content of the first existing candidate.
    ///
    /// Blocking filesystem reads, one `stat` per candidate until a hit.
    pub fn resolve(&self, status: StatusCode) -> Option<String> {
        let path = Self::candidates(status)
            .iter()
            .map(|name| self.dir.join(name))
            .find(|path| path.is_file())?;

        match fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(path = %path.display(), "cannot read error page: {e}");
                None
            }
        }
    }
}
