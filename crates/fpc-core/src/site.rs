//! Everything one site's page cache needs, shared by its sessions and purges.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fpc_api::{ApiClient, ReverseProxy};
use fpc_backlog::{Backlog, BacklogError, HealthMonitor, HealthStatus};
use fpc_config::{CacheSettings, ConfigStore, SiteConfig};
use fpc_pagecache::{DeviceType, KeyContext, PathLayout, PathVersion, normalize_url};
use fpc_storage::{Clock, Storage};

use crate::{AdmissionPolicy, CoreError, ElementRevision, PageCacheLock};

/// Directory under the data root that holds rendered pages.
pub const CACHE_DIR: &str = "pagecache";

const DEFAULT_TAG_RETRY_DELAY: Duration = Duration::from_secs(3);

/// The page cache of one site.
///
/// Owns the site config document, the API client (and through it the health
/// monitor and backlog), the purge lock and the element revision. Per-request
/// state lives in a [`Session`](crate::Session).
pub struct SiteCache {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: SiteConfig,
    pub(crate) config_store: ConfigStore,
    pub(crate) api: ApiClient,
    pub(crate) proxy: Option<ReverseProxy>,
    pub(crate) lock: PageCacheLock,
    pub(crate) revision: ElementRevision,
    pub(crate) settings: CacheSettings,
    pub(crate) cache_dir: PathBuf,
    pub(crate) tag_retry_delay: Duration,
}

impl SiteCache {
    /// Proxies listed in the config's Varnish integration are purged over
    /// the API client's transport.
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        config: SiteConfig,
        api: ApiClient,
        settings: CacheSettings,
    ) -> Self {
        let mut cache_dir = PathBuf::from(CACHE_DIR);
        if let Some(suffix) = settings.path_suffix.as_deref().filter(|s| !s.is_empty()) {
            cache_dir.push(suffix);
        }
        let proxy = config
            .varnish()
            .map(|varnish| ReverseProxy::new(api.transport(), varnish.servers.clone()));

        Self {
            config_store: ConfigStore::new(api.site_id()),
            lock: PageCacheLock::new(Arc::clone(&storage), Arc::clone(&clock)),
            revision: ElementRevision::new(Arc::clone(&storage), api.site_id()),
            storage,
            clock,
            config,
            api,
            proxy,
            settings,
            cache_dir,
            tag_retry_delay: DEFAULT_TAG_RETRY_DELAY,
        }
    }

    /// Pause between failed tag purge attempts.
    #[must_use]
    pub fn with_tag_retry_delay(mut self, delay: Duration) -> Self {
        self.tag_retry_delay = delay;
        self
    }

    /// Send `value` as header `name` with every proxy purge.
    #[must_use]
    pub fn with_proxy_header(mut self, name: &str, value: &str) -> Self {
        self.proxy = self.proxy.map(|proxy| proxy.with_header(name, value));
        self
    }

    #[must_use]
    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    #[must_use]
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    #[must_use]
    pub fn health(&self) -> &HealthMonitor {
        self.api.health()
    }

    #[must_use]
    pub fn backlog(&self) -> &Backlog {
        self.api.backlog()
    }

    #[must_use]
    pub fn lock(&self) -> &PageCacheLock {
        &self.lock
    }

    #[must_use]
    pub fn revision(&self) -> &ElementRevision {
        &self.revision
    }

    /// Cache root, `pagecache` or `pagecache/<suffix>`.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    #[must_use]
    pub fn device_dir(&self, device: DeviceType) -> PathBuf {
        self.cache_dir.join(device.as_str())
    }

    #[must_use]
    pub fn layout(&self) -> PathLayout {
        PathLayout {
            version: PathVersion::from_config(self.config.url_path_version),
            debug: self.settings.debug_paths,
        }
    }

    #[must_use]
    pub fn admission(&self) -> AdmissionPolicy<'_> {
        AdmissionPolicy::new(&self.config)
    }

    /// Cache key inputs for a request carrying `cookies`.
    #[must_use]
    pub fn key_context(&self, cookies: std::collections::BTreeMap<String, String>) -> KeyContext {
        KeyContext {
            cookies,
            supported_cookies: self.config.page_cache.supported_cookies.clone(),
            geo_variations: self.settings.geo_variations.clone(),
            custom_prefixes: self.settings.custom_prefixes.clone(),
        }
    }

    /// Normalize `url` with the site's ignored query parameters.
    pub fn normalize(&self, url: &str) -> Result<String, CoreError> {
        Ok(normalize_url(url, &self.config.ignored_params)?)
    }

    /// Probe the service and set the health status from the outcome.
    pub fn check_health_status(&self) -> Result<HealthStatus, CoreError> {
        Ok(self.health().check(|| self.api.ping())?)
    }

    /// Replay queued remote operations for at most `time_limit`.
    ///
    /// Returns `true` once the backlog is gone. When replay has been failing
    /// for longer than the backlog may live, the whole local cache is purged,
    /// the backlog deleted and the timeout returned so an operator notices.
    pub fn replay_backlog(&self, time_limit: Duration) -> Result<bool, CoreError> {
        let transport = self.api.transport();
        match self.backlog().replay(time_limit, transport.as_ref()) {
            Ok(done) => Ok(done),
            Err(BacklogError::ReplayTimeout { ttl }) => {
                tracing::warn!(ttl, "Backlog replay timed out, purging local cache");
                self.purge_local_cache(false)?;
                self.backlog().delete()?;
                Err(BacklogError::ReplayTimeout { ttl }.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use fpc_config::VarnishConfig;
    use fpc_pagecache::{EntryOptions, PageCacheEntry, url_dir};
    use fpc_storage::{FsStorage, HeaderBlock, ManualClock};
    use fpc_transport::{MockTransport, Request, Response, Transport};
    use pretty_assertions::assert_eq;

    pub(crate) const NOW: u64 = 1_700_000_000;

    pub(crate) struct Fixture {
        pub(crate) temp_dir: tempfile::TempDir,
        pub(crate) storage: Arc<dyn Storage>,
        pub(crate) clock: Arc<ManualClock>,
        pub(crate) transport: Arc<MockTransport>,
        pub(crate) health: Arc<HealthMonitor>,
        pub(crate) backlog: Arc<Backlog>,
    }

    impl Fixture {
        pub(crate) fn new(transport: MockTransport) -> Self {
            let temp_dir = tempfile::tempdir().unwrap();
            let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(temp_dir.path().to_path_buf()));
            let clock = Arc::new(ManualClock::new(NOW));
            let health = Arc::new(HealthMonitor::load(
                Arc::clone(&storage),
                Arc::clone(&clock) as Arc<dyn Clock>,
            ));
            let backlog = Arc::new(Backlog::new(
                Arc::clone(&storage),
                Arc::clone(&clock) as Arc<dyn Clock>,
            ));
            Self {
                temp_dir,
                storage,
                clock,
                transport: Arc::new(transport),
                health,
                backlog,
            }
        }

        pub(crate) fn site(&self, config: SiteConfig) -> SiteCache {
            self.site_with(config, CacheSettings::default())
        }

        pub(crate) fn site_with(&self, config: SiteConfig, settings: CacheSettings) -> SiteCache {
            let api = ApiClient::new(
                "site1",
                "secret",
                Arc::clone(&self.transport) as Arc<dyn Transport>,
                Arc::clone(&self.health),
                Arc::clone(&self.backlog),
            )
            .with_retry(1, Duration::ZERO);
            SiteCache::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.clock) as Arc<dyn Clock>,
                config,
                api,
                settings,
            )
            .with_tag_retry_delay(Duration::ZERO)
        }

        /// Store a fresh desktop page for `url` and return its directory.
        pub(crate) fn cache_page(&self, site: &SiteCache, url: &str) -> PathBuf {
            let entry = PageCacheEntry::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.clock) as Arc<dyn Clock>,
                site.cache_dir(),
                EntryOptions {
                    url: url.to_owned(),
                    key: site.key_context(BTreeMap::new()),
                    layout: site.layout(),
                    ..EntryOptions::default()
                },
            )
            .unwrap();
            entry
                .set_content(b"<html>NITROPACK_STATE='FRESH'</html>", HeaderBlock::new())
                .unwrap();
            self.page_dir(site, url, false)
        }

        pub(crate) fn page_dir(&self, site: &SiteCache, url: &str, invalidated: bool) -> PathBuf {
            url_dir(&site.device_dir(DeviceType::Desktop), url, invalidated, site.layout())
        }

        pub(crate) fn exists(&self, path: &Path) -> bool {
            self.temp_dir.path().join(path).exists()
        }
    }

    pub(crate) fn varnish_config() -> SiteConfig {
        let mut config = SiteConfig::default();
        config.cache_integrations.varnish = Some(VarnishConfig {
            servers: vec!["127.0.0.1:6081".to_owned()],
            purge_all_url: "https://example.com/".to_owned(),
            purge_all_method: "BAN".to_owned(),
            purge_single_method: "PURGE".to_owned(),
        });
        config
    }

    #[test]
    fn test_cache_dir_with_suffix() {
        let fx = Fixture::new(MockTransport::new());
        let settings = CacheSettings {
            path_suffix: Some("v2".to_owned()),
            ..CacheSettings::default()
        };

        let site = fx.site_with(SiteConfig::default(), settings);

        assert_eq!(site.cache_dir(), Path::new("pagecache/v2"));
        assert_eq!(site.device_dir(DeviceType::Mobile), Path::new("pagecache/v2/mobile"));
    }

    #[test]
    fn test_layout_follows_config() {
        let fx = Fixture::new(MockTransport::new());
        let config = SiteConfig {
            url_path_version: Some(2),
            ..SiteConfig::default()
        };

        assert_eq!(fx.site(config).layout().version, PathVersion::V2);
        assert_eq!(fx.site(SiteConfig::default()).layout().version, PathVersion::V1);
    }

    #[test]
    fn test_key_context_takes_local_prefixes() {
        let fx = Fixture::new(MockTransport::new());
        let settings = CacheSettings {
            custom_prefixes: vec!["eu".to_owned(), "b2b".to_owned()],
            ..CacheSettings::default()
        };
        let mut config = SiteConfig::default();
        config.page_cache.supported_cookies = vec!["lang".to_owned()];

        let key = fx.site_with(config, settings).key_context(BTreeMap::new());

        assert_eq!(key.custom_prefix(), "eu-b2b");
        assert_eq!(key.supported_cookies, vec!["lang"]);
    }

    #[test]
    fn test_health_check_recovers() {
        let fx = Fixture::new(MockTransport::new());
        fx.health.set(HealthStatus::Sick).unwrap();
        let site = fx.site(SiteConfig::default());

        assert_eq!(site.check_health_status().unwrap(), HealthStatus::Healthy);

        fx.transport.push(Ok(Response::new(503)));
        assert_eq!(site.check_health_status().unwrap(), HealthStatus::Sick);
    }

    #[test]
    fn test_replay_backlog_drains_queue() {
        let fx = Fixture::new(MockTransport::new());
        fx.backlog.append(&Request::post("cache/purge/site1")).unwrap();
        let site = fx.site(SiteConfig::default());

        assert!(site.replay_backlog(Duration::from_secs(10)).unwrap());
        assert!(!fx.backlog.exists());
        assert_eq!(fx.transport.replay_count(), 1);
    }

    #[test]
    fn test_replay_timeout_purges_everything() {
        let fx = Fixture::new(MockTransport::with_handler(|_| Ok(Response::new(500))));
        let site = fx.site(SiteConfig::default());
        let dir = fx.cache_page(&site, "https://example.com/");
        fx.backlog.append(&Request::post("cache/purge/site1")).unwrap();

        assert!(!site.replay_backlog(Duration::from_secs(10)).unwrap());
        fx.clock.advance(fpc_backlog::REPLAY_TTL + 1);
        let err = site.replay_backlog(Duration::from_secs(10)).unwrap_err();

        assert!(matches!(
            err,
            CoreError::Backlog(BacklogError::ReplayTimeout { .. })
        ));
        assert!(!fx.backlog.exists());
        assert!(!fx.exists(&dir));
        assert!(fx.exists(site.cache_dir()));
    }

    #[test]
    fn test_proxy_purged_over_api_transport() {
        let fx = Fixture::new(MockTransport::new());
        let site = fx.site(varnish_config()).with_proxy_header("X-Purge-Token", "t");

        site.purge_proxy_cache(Some("https://example.com/a?b=1"));

        let sent = &fx.transport.requests()[0];
        assert_eq!(sent.method, "PURGE");
        assert_eq!(sent.path, "https://127.0.0.1:6081/a?b=1");
        assert_eq!(sent.headers["Host"], "example.com");
        assert_eq!(sent.headers["X-Purge-Token"], "t");
    }
}
