//! Configuration management for the full-page cache client.
//!
//! Two documents are handled here:
//!
//! - [`Settings`]: the local `fpc.toml` (site credentials, data directory,
//!   cache and backlog behaviour), auto-discovered in parent directories
//! - [`SiteConfig`]: the site config JSON the remote service delivers, read
//!   from the data directory through [`ConfigStore`]
//!
//! CLI settings can be applied during load via [`CliSettings`].
//!
//! ## Environment Variable Expansion
//!
//! String settings support environment variable expansion:
//!
//! - `${VAR}` - expands to the value of VAR, errors if unset
//! - `${VAR:-default}` - expands to VAR if set, otherwise uses default
//!
//! Expanded fields:
//! - `site.id`
//! - `site.secret`
//! - `site.api_url`
//! - `storage.data_dir`

mod expand;
mod site;
mod wildcard;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub use site::{
    AjaxUrls, CacheIntegrations, ConfigStore, CookieExclude, ExcludedCookies, PageCacheConfig,
    SiteConfig, UrlList, VarnishConfig,
};
pub use wildcard::{Wildcard, any_match};

/// CLI settings that override configuration file values.
///
/// All fields are optional. Only non-None values override the loaded config.
#[derive(Debug, Default)]
pub struct CliSettings {
    /// Override data directory.
    pub data_dir: Option<PathBuf>,
    /// Override site id.
    pub site_id: Option<String>,
    /// Override remote API base URL.
    pub api_url: Option<String>,
    /// Override backlog enabled flag.
    pub backlog_enabled: Option<bool>,
    /// Override quick purge flag.
    pub quick_purge: Option<bool>,
}

/// Configuration filename to search for.
const CONFIG_FILENAME: &str = "fpc.toml";

/// Local settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Site identity and remote endpoint.
    pub site: SiteSettings,
    /// Where cache state lives.
    pub storage: StorageSettings,
    /// Page cache behaviour.
    pub cache: CacheSettings,
    /// Deferred remote operations.
    pub backlog: BacklogSettings,
    /// Remote call timeouts and retries.
    pub transport: TransportSettings,

    /// Path to the config file (set after loading).
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::default_with_base(Path::new("."))
    }
}

/// Site identity.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SiteSettings {
    /// Site id issued by the service.
    pub id: String,
    /// Site secret used to sign requests.
    pub secret: String,
    /// Remote API base URL.
    pub api_url: String,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            secret: String::new(),
            api_url: "https://api.getnitropack.com".to_owned(),
        }
    }
}

impl SiteSettings {
    /// Validate that the site can talk to the remote service.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty(&self.id, "site.id")?;
        require_non_empty(&self.secret, "site.secret")?;
        require_http_url(&self.api_url, "site.api_url")?;
        Ok(())
    }
}

/// Storage backend kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Local filesystem under `data_dir`.
    #[default]
    Fs,
    /// In-process key-value store (single process, nothing persisted).
    Memory,
}

/// Storage configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Data directory (relative paths resolve against the config file).
    pub data_dir: PathBuf,
    /// Backend kind.
    pub backend: StorageBackend,
    /// Key namespace for key-value backends.
    pub namespace: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            backend: StorageBackend::Fs,
            namespace: "fpc".to_owned(),
        }
    }
}

/// Page cache behaviour.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Write and serve gzip siblings.
    pub compression: bool,
    /// Leave the renamed cache directory of a complete purge for the caller
    /// to delete.
    pub quick_purge: bool,
    /// Name URL directories by their sanitized URL instead of a hash.
    pub debug_paths: bool,
    /// Extra directory segment below `pagecache`.
    pub path_suffix: Option<String>,
    /// Prefixes joined with `-` at the start of every cache file name.
    pub custom_prefixes: Vec<String>,
    /// `nitro_geot_<component>` cookie variations, first entry is the default.
    pub geo_variations: BTreeMap<String, Vec<String>>,
}

/// Backlog behaviour.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BacklogSettings {
    /// Defer failed remote operations instead of dropping them.
    pub enabled: bool,
    /// Minimum seconds between replay attempts; also the replay time budget.
    pub replay_time_limit: u64,
}

impl Default for BacklogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            replay_time_limit: 10,
        }
    }
}

/// Remote call limits.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Connect timeout in seconds.
    pub connect_timeout: u64,
    /// Whole-request timeout in seconds.
    pub timeout: u64,
    /// Attempts per request (1 means no retry).
    pub attempts: u32,
    /// Delay between attempts in milliseconds.
    pub retry_delay_ms: u64,
    /// Seconds between tag purge resolution attempts.
    pub tag_retry_delay: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: 3,
            timeout: 30,
            attempts: 2,
            retry_delay_ms: 500,
            tag_retry_delay: 3,
        }
    }
}

impl TransportSettings {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub fn tag_retry_delay(&self) -> Duration {
        Duration::from_secs(self.tag_retry_delay)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File not found.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Site config JSON error.
    #[error("Site config error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reading or writing the site config failed.
    #[error("Site config storage error: {0}")]
    Storage(#[from] fpc_storage::StorageError),
    /// Invalid wildcard pattern.
    #[error("Invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    /// Validation error.
    #[error("Configuration error: {0}")]
    Validation(String),
    /// Environment variable error during expansion.
    #[error("Environment variable error in {field}: {message}")]
    EnvVar {
        /// Config field path (e.g., "`site.secret`").
        field: String,
        /// Error message (e.g., "${`FPC_SECRET`} not set").
        message: String,
    },
}

/// Require a string field to be non-empty.
fn require_non_empty(value: &str, field: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

/// Require a URL field to use http:// or https:// scheme.
fn require_http_url(url: &str, field: &str) -> Result<(), ConfigError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "{field} must start with http:// or https://"
        )));
    }
    Ok(())
}

impl Settings {
    /// Load settings from file with optional CLI settings.
    ///
    /// If `config_path` is provided, loads from that file.
    /// Otherwise, searches for `fpc.toml` in current directory and parents.
    ///
    /// CLI settings are applied after loading and path resolution, allowing CLI
    /// arguments to take precedence over config file values.
    ///
    /// # Errors
    ///
    /// Returns error if explicit `config_path` doesn't exist or parsing fails.
    pub fn load(
        config_path: Option<&Path>,
        cli_settings: Option<&CliSettings>,
    ) -> Result<Self, ConfigError> {
        let mut settings = if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Self::load_from_file(path)?
        } else if let Some(discovered) = Self::discover_config() {
            Self::load_from_file(&discovered)?
        } else {
            Self::default_with_cwd()
        };

        if let Some(cli) = cli_settings {
            settings.apply_cli_settings(cli);
        }

        Ok(settings)
    }

    /// Apply CLI settings to the configuration.
    fn apply_cli_settings(&mut self, cli: &CliSettings) {
        if let Some(data_dir) = &cli.data_dir {
            self.storage.data_dir.clone_from(data_dir);
        }
        if let Some(site_id) = &cli.site_id {
            self.site.id.clone_from(site_id);
        }
        if let Some(api_url) = &cli.api_url {
            self.site.api_url.clone_from(api_url);
        }
        if let Some(enabled) = cli.backlog_enabled {
            self.backlog.enabled = enabled;
        }
        if let Some(quick) = cli.quick_purge {
            self.cache.quick_purge = quick;
        }
    }

    /// Get validated site settings.
    ///
    /// Use this instead of accessing the `site` field directly when the
    /// command talks to the remote service.
    pub fn require_site(&self) -> Result<&SiteSettings, ConfigError> {
        self.site.validate()?;
        Ok(&self.site)
    }

    /// Search for config file in current directory and parents.
    fn discover_config() -> Option<PathBuf> {
        let mut current = std::env::current_dir().ok()?;
        loop {
            let candidate = current.join(CONFIG_FILENAME);
            if candidate.exists() {
                return Some(candidate);
            }
            if !current.pop() {
                return None;
            }
        }
    }

    /// Create default settings with paths relative to current working directory.
    fn default_with_cwd() -> Self {
        let cwd = std::env::current_dir().unwrap_or_default();
        Self::default_with_base(&cwd)
    }

    /// Create default settings with paths relative to given base directory.
    fn default_with_base(base: &Path) -> Self {
        let storage = StorageSettings::default();
        Self {
            site: SiteSettings::default(),
            storage: StorageSettings {
                data_dir: base.join(&storage.data_dir),
                ..storage
            },
            cache: CacheSettings::default(),
            backlog: BacklogSettings::default(),
            transport: TransportSettings::default(),
            config_path: None,
        }
    }

    /// Load settings from a specific file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut settings: Self = toml::from_str(&content)?;

        // Expand environment variables before path resolution
        settings.expand_env_vars()?;

        let config_dir = path.parent().unwrap_or(Path::new("."));
        settings.storage.data_dir = config_dir.join(&settings.storage.data_dir);
        settings.config_path = Some(path.to_path_buf());

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration values.
    ///
    /// Site credentials are checked separately by
    /// [`require_site`](Self::require_site) since local-only commands work
    /// without them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_http_url(&self.site.api_url, "site.api_url")?;
        require_non_empty(&self.storage.namespace, "storage.namespace")?;

        if self.transport.timeout == 0 {
            return Err(ConfigError::Validation(
                "transport.timeout cannot be 0".to_owned(),
            ));
        }
        if self.transport.attempts == 0 {
            return Err(ConfigError::Validation(
                "transport.attempts must be at least 1".to_owned(),
            ));
        }
        for (component, variations) in &self.cache.geo_variations {
            if variations.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "cache.geo_variations.{component} cannot be empty"
                )));
            }
        }

        Ok(())
    }

    /// Expand environment variable references in configuration strings.
    fn expand_env_vars(&mut self) -> Result<(), ConfigError> {
        self.site.id = expand::expand_env(&self.site.id, "site.id")?;
        self.site.secret = expand::expand_env(&self.site.secret, "site.secret")?;
        self.site.api_url = expand::expand_env(&self.site.api_url, "site.api_url")?;

        let data_dir = self.storage.data_dir.to_string_lossy().into_owned();
        self.storage.data_dir = PathBuf::from(expand::expand_env(&data_dir, "storage.data_dir")?);

        Ok(())
    }
}
