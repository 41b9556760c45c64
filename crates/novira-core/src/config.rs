//! Offline layer configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{ConfigError, ConfigResult};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NoviraConfig {
    /// Cache router and worker lifecycle settings
    pub worker: WorkerConfig,

    /// URL classification rules
    pub routes: RouteRules,

    /// Update coordinator timers
    pub updater: UpdaterConfig,

    /// Sync indicator settings
    pub sync_indicator: SyncIndicatorConfig,

    /// HTTP client settings
    pub net: NetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Store name prefix
    pub cache_prefix: String,

    /// Deployed version; bumping it invalidates every cached entry
    pub version: String,

    /// Origin the precache manifest and root fallback resolve against
    pub origin: String,

    /// Paths fetched and stored on install
    pub precache: Vec<String>,

    /// Take control right after install instead of waiting for tabs to close
    pub skip_waiting_on_install: bool,

    /// Largest response body a single cache entry may hold, in bytes
    pub max_entry_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteRules {
    /// Host marker of the backend
    pub auth_host: String,

    /// Path marker of the backend's auth endpoints
    pub auth_path: String,

    /// Host markers answered stale-while-revalidate
    pub data_hosts: Vec<String>,

    /// Path prefixes of build and image-optimizer assets
    pub static_prefixes: Vec<String>,

    /// File extensions treated as static assets (without the dot)
    pub static_extensions: Vec<String>,

    /// URL schemes never intercepted
    pub passthrough_schemes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Delay before the first check after mount, in milliseconds
    pub settle_delay_ms: u64,

    /// Backstop polling period, in milliseconds
    pub check_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncIndicatorConfig {
    /// How long the signal stays raised, in milliseconds
    pub display_ms: u64,

    /// Host marker of data requests worth watching
    pub data_host: String,

    /// Path marker excluded from watching
    pub auth_path: String,

    /// Pages on which the indicator is never shown
    pub auth_pages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// User agent string
    pub user_agent: String,

    /// Transport timeout, in seconds
    pub timeout_secs: u64,

    /// Maximum redirects followed
    pub max_redirects: usize,
}

impl NoviraConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration");
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(raw: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the router cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker.version.trim().is_empty() {
            return Err(ConfigError::invalid("worker.version must not be empty"));
        }
        if self.worker.cache_prefix.trim().is_empty() {
            return Err(ConfigError::invalid("worker.cache_prefix must not be empty"));
        }
        self.worker.origin_url()?;
        if self.updater.check_interval_ms == 0 {
            return Err(ConfigError::invalid("updater.check_interval_ms must be positive"));
        }
        Ok(())
    }
}

impl WorkerConfig {
    /// Name of the store owned by this version
    pub fn store_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    /// Parsed app origin
    pub fn origin_url(&self) -> ConfigResult<Url> {
        Ok(Url::parse(&self.origin)?)
    }

    /// Precache manifest resolved against the origin
    pub fn precache_urls(&self) -> ConfigResult<Vec<Url>> {
        let origin = self.origin_url()?;
        self.precache
            .iter()
            .map(|path| origin.join(path).map_err(ConfigError::from))
            .collect()
    }
}

impl UpdaterConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl SyncIndicatorConfig {
    pub fn display_duration(&self) -> Duration {
        Duration::from_millis(self.display_ms)
    }
}

impl NetConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "novira".to_string(),
            version: "v2.6.0".to_string(),
            origin: "http://localhost:3000/".to_string(),
            precache: vec![
                "/".to_string(),
                "/Novira.png".to_string(),
                "/manifest.json".to_string(),
            ],
            skip_waiting_on_install: true,
            max_entry_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Default for RouteRules {
    fn default() -> Self {
        Self {
            auth_host: "supabase.co".to_string(),
            auth_path: "/auth/v1/".to_string(),
            data_hosts: vec!["supabase.co".to_string(), "frankfurter".to_string()],
            static_prefixes: vec!["/_next/static/".to_string(), "/_next/image".to_string()],
            static_extensions: [
                "js", "css", "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "woff", "woff2",
                "ttf", "eot",
            ]
            .iter()
            .map(|ext| ext.to_string())
            .collect(),
            passthrough_schemes: vec!["ws".to_string(), "wss".to_string()],
        }
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2_000,
            check_interval_ms: 30 * 60 * 1_000, // 30 minutes
        }
    }
}

impl Default for SyncIndicatorConfig {
    fn default() -> Self {
        Self {
            display_ms: 1_500,
            data_host: "supabase.co".to_string(),
            auth_path: "/auth/v1/".to_string(),
            auth_pages: vec![
                "/signin".to_string(),
                "/signup".to_string(),
                "/forgot-password".to_string(),
                "/update-password".to_string(),
            ],
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Novira/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            max_redirects: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_store_name() {
        let config = NoviraConfig::default();
        assert_eq!(config.worker.store_name(), "novira-v2.6.0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_precache_urls_resolve_against_origin() {
        let worker = WorkerConfig {
            origin: "https://app.novira.test/".to_string(),
            ..Default::default()
        };
        let urls = worker.precache_urls().unwrap();
        let urls: Vec<&str> = urls.iter().map(|u| u.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://app.novira.test/",
                "https://app.novira.test/Novira.png",
                "https://app.novira.test/manifest.json",
            ]
        );
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = NoviraConfig::from_json(r#"{"worker": {"version": "v3.0.0"}}"#).unwrap();
        assert_eq!(config.worker.store_name(), "novira-v3.0.0");
        assert_eq!(config.routes.auth_path, "/auth/v1/");
        assert_eq!(config.updater.settle_delay(), Duration::from_secs(2));
        assert_eq!(config.sync_indicator.display_duration(), Duration::from_millis(1500));
    }

    #[test]
    fn test_empty_version_rejected() {
        let err = NoviraConfig::from_json(r#"{"worker": {"version": " "}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_bad_origin_rejected() {
        let err = NoviraConfig::from_json(r#"{"worker": {"origin": "not a url"}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Url(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"updater": {{"check_interval_ms": 60000}}}}"#).unwrap();

        let config = NoviraConfig::load(file.path()).unwrap();
        assert_eq!(config.updater.check_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = NoviraConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
