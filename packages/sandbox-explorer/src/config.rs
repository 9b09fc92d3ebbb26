use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use sandbox_explorer_error::SandboxError;

pub const DEFAULT_URI_SCHEME: &str = "e2b";
pub const DEFAULT_INDEX_TTL_SECS: u64 = 300;
const DEFAULT_IGNORE_PATTERNS: [&str; 11] = [
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    ".cache",
    ".turbo",
    "__pycache__",
    ".venv",
    "coverage",
];

/// Settings supplied by the editor host. Never written back anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExplorerConfig {
    pub api_key: Option<String>,
    pub search_ignore_patterns: Vec<String>,
    pub index_cache_ttl_secs: u64,
    pub uri_scheme: String,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            search_ignore_patterns: DEFAULT_IGNORE_PATTERNS
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
            index_cache_ttl_secs: DEFAULT_INDEX_TTL_SECS,
            uri_scheme: DEFAULT_URI_SCHEME.to_string(),
        }
    }
}

impl ExplorerConfig {
    /// Reads the host's settings section; missing keys keep their defaults.
    pub fn from_settings(settings: &Value) -> Result<Self, SandboxError> {
        if settings.is_null() {
            return Ok(Self::default());
        }
        let mut config: Self =
            serde_json::from_value(settings.clone()).map_err(|err| SandboxError::InvalidRequest {
                message: format!("invalid explorer settings: {err}"),
            })?;
        config
            .search_ignore_patterns
            .retain(|pattern| !pattern.trim().is_empty());
        if config.uri_scheme.trim().is_empty() {
            config.uri_scheme = DEFAULT_URI_SCHEME.to_string();
        }
        Ok(config)
    }

    pub fn index_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.index_cache_ttl_secs)
    }
}
