//! Site config document delivered by the remote service.
//!
//! Stored as `<site_id>-config.json` in the data directory. Field names are
//! the service's PascalCase names. Fields this client does not understand are
//! kept verbatim so writing the document back never loses data.

use std::path::{Path, PathBuf};

use fpc_storage::{Storage, StorageExt};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Page cache policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PageCacheConfig {
    /// Seconds a fresh page is served.
    pub expire_time: u64,
    /// Seconds an invalidated page may still be served.
    pub stale_expire_time: u64,
    /// Cookie name patterns that take part in the cache key.
    pub supported_cookies: Vec<String>,
}

/// A toggled list of URL patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlList {
    #[serde(rename = "Status")]
    pub status: bool,
    #[serde(rename = "URLs")]
    pub urls: Vec<String>,
}

/// AJAX URL patterns. Standalone URLs are cacheable without a cached parent
/// page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AjaxUrls {
    #[serde(rename = "Status")]
    pub status: bool,
    #[serde(rename = "URLs")]
    pub urls: Vec<String>,
    #[serde(rename = "StandaloneURLs")]
    pub standalone_urls: Vec<String>,
}

/// One excluded-cookie rule. An empty `values` list excludes every value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieExclude {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExcludedCookies {
    pub status: bool,
    pub cookies: Vec<CookieExclude>,
}

/// Varnish-style reverse proxy settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VarnishConfig {
    /// `host` or `host:port` of every proxy to purge.
    pub servers: Vec<String>,
    pub purge_all_url: String,
    pub purge_all_method: String,
    pub purge_single_method: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CacheIntegrations {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub varnish: Option<VarnishConfig>,
}

/// The site config document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SiteConfig {
    pub page_cache: PageCacheConfig,
    #[serde(rename = "EnabledURLs")]
    pub enabled_urls: UrlList,
    #[serde(rename = "DisabledURLs")]
    pub disabled_urls: UrlList,
    #[serde(rename = "AjaxURLs")]
    pub ajax_urls: AjaxUrls,
    pub excluded_cookies: ExcludedCookies,
    /// Query parameter name patterns stripped during URL normalization.
    pub ignored_params: Vec<String>,
    /// Expected `x-nitro-rev` of cached pages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_hash: Option<String>,
    /// Cache directory hashing scheme. Missing or 0 means 1.
    #[serde(rename = "URLPathVersion", skip_serializing_if = "Option::is_none")]
    pub url_path_version: Option<u8>,
    pub cache_integrations: CacheIntegrations,
    /// Unix time the document was fetched. 0 forces a refetch.
    pub last_fetch: u64,
    #[serde(rename = "SDKVersion", skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SiteConfig {
    /// Parse a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Revision pages must carry to be served, if the site sets one.
    #[must_use]
    pub fn revision(&self) -> Option<&str> {
        self.revision_hash.as_deref().filter(|r| !r.is_empty())
    }

    /// Varnish settings when at least one server is configured.
    #[must_use]
    pub fn varnish(&self) -> Option<&VarnishConfig> {
        self.cache_integrations
            .varnish
            .as_ref()
            .filter(|v| !v.servers.is_empty())
    }
}

/// Loads and saves the site config document through [`Storage`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Store for `site_id`, at `<site_id>-config.json` under the storage root.
    #[must_use]
    pub fn new(site_id: &str) -> Self {
        Self {
            path: PathBuf::from(format!("{site_id}-config.json")),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored document.
    ///
    /// Returns `Ok(None)` when nothing has been stored yet.
    pub fn load(&self, storage: &dyn Storage) -> Result<Option<SiteConfig>, ConfigError> {
        Ok(storage.read_json(&self.path)?)
    }

    /// Write the document.
    pub fn save(&self, storage: &dyn Storage, config: &SiteConfig) -> Result<(), ConfigError> {
        storage.write_json(&self.path, config)?;
        Ok(())
    }

    /// Set `LastFetch` to 0 so the next request refetches the document.
    ///
    /// Does nothing when no document is stored.
    pub fn reset_last_fetch(&self, storage: &dyn Storage) -> Result<(), ConfigError> {
        let Some(mut config) = self.load(storage)? else {
            return Ok(());
        };
        config.last_fetch = 0;
        self.save(storage, &config)?;
        tracing::debug!(path = %self.path.display(), "Reset site config fetch time");
        Ok(())
    }
}
