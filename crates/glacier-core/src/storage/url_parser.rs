//! URL parsing for storage backends.

use object_store::path::Path;
use regex::Regex;
use std::sync::LazyLock;

use crate::error::{InvalidUrlSnafu, StorageError};

use super::LocalConfig;

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^(?P<path>/.*)$";
const MEMORY_URL: &str = r"^memory://(?P<key>.*)$";

static LOCAL_MATCHERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [FILE_URI, FILE_URL, FILE_PATH]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("valid local url pattern"))
        .collect()
});

static MEMORY_MATCHER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(MEMORY_URL).expect("valid memory url pattern"));

/// Backend configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Local(LocalConfig),
    /// Process-local store; contents are lost on exit.
    Memory { key: Option<Path> },
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    ///
    /// Accepted forms: `/abs/path`, `file:///abs/path`, `file:/abs/path`,
    /// `memory://` and `memory://some/prefix`.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        if let Some(caps) = MEMORY_MATCHER.captures(url) {
            let key = caps
                .name("key")
                .map(|m| m.as_str().trim_matches('/'))
                .filter(|k| !k.is_empty())
                .map(Path::from);
            return Ok(BackendConfig::Memory { key });
        }

        if let Some(caps) = LOCAL_MATCHERS.iter().find_map(|r| r.captures(url)) {
            let path = caps.name("path").map(|m| m.as_str()).unwrap_or_default();
            let path = path.trim_end_matches('/');
            let path = if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            };
            return Ok(BackendConfig::Local(LocalConfig { path }));
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    /// Key prefix applied to every path.
    pub fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::Local(_) => None,
            BackendConfig::Memory { key } => key.as_ref(),
        }
    }
}
