//! Serving one request from the local or the remote cache.

use std::sync::Arc;

use fpc_api::LookupContext;
use fpc_pagecache::{DeviceType, EntryOptions, PageCacheEntry, ResponseContext};
use fpc_storage::{CacheDocument, Clock};
use fpc_transport::ResponseStatus;

use crate::{CoreError, RequestInfo, SiteCache};

/// Cache state of one incoming request.
///
/// Built by [`SiteCache::session`]. Lookups fail open: anything that cannot
/// be read or stored counts as "not cached" and is logged.
pub struct Session<'a> {
    site: &'a SiteCache,
    request: RequestInfo,
    url: String,
    ajax: bool,
    entry: PageCacheEntry,
}

impl SiteCache {
    /// Start a session for `request`.
    ///
    /// An AJAX request to a non-standalone AJAX URL with a `Referer` is
    /// stored beside its referring page and depends on it.
    pub fn session(&self, request: RequestInfo) -> Result<Session<'_>, CoreError> {
        let policy = self.admission();
        let url = self.normalize(&request.url)?;
        let ajax = policy.is_ajax(&request, &url);
        let referer = match request.referer.as_deref().filter(|r| !r.is_empty()) {
            Some(referer)
                if ajax && policy.is_ajax_url(&url) && !policy.is_standalone_ajax_url(&url) =>
            {
                Some(self.normalize(referer)?)
            }
            _ => None,
        };
        let device = DeviceType::from_user_agent(request.user_agent.as_deref().unwrap_or_default());

        let mut entry = PageCacheEntry::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.clock) as Arc<dyn Clock>,
            &self.cache_dir,
            EntryOptions {
                url: url.clone(),
                referer,
                ajax,
                device,
                key: self.key_context(request.cookies.clone()),
                layout: self.layout(),
            },
        )?;
        entry.set_compression(self.settings.compression);

        Ok(Session {
            site: self,
            request,
            url,
            ajax,
            entry,
        })
    }
}

impl Session<'_> {
    /// Normalized request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn is_ajax(&self) -> bool {
        self.ajax
    }

    #[must_use]
    pub fn device(&self) -> DeviceType {
        self.entry.device()
    }

    #[must_use]
    pub fn entry(&self) -> &PageCacheEntry {
        &self.entry
    }

    #[must_use]
    pub fn is_allowed_url(&self) -> bool {
        self.site.admission().is_allowed_url(&self.url)
    }

    #[must_use]
    pub fn is_allowed_request(&self) -> bool {
        self.site
            .admission()
            .is_allowed_request(&self.request, &self.url, &self.entry, false)
    }

    #[must_use]
    pub fn is_cache_allowed(&self) -> bool {
        self.is_allowed_request() && self.is_allowed_url()
    }

    /// Whether a servable page is stored locally.
    ///
    /// Nothing is served while the backlog holds unsent purges or the
    /// service is not healthy. The invalidated family is timed by
    /// `StaleExpireTime`, the fresh one by `ExpireTime`.
    #[must_use]
    pub fn has_local_cache(&self, check_request: bool) -> bool {
        if self.site.backlog().exists() {
            return false;
        }
        if !self.is_allowed_url() || (check_request && !self.is_allowed_request()) {
            return false;
        }
        if !self.site.health().is_healthy() {
            return false;
        }

        let page_cache = &self.site.config.page_cache;
        let ttl = if self.entry.use_invalidated() {
            page_cache.stale_expire_time
        } else {
            page_cache.expire_time
        };
        self.entry.has_cache() && !self.entry.has_expired(ttl, self.site.config.revision())
    }

    /// Ask the service for the page and store it when it has one.
    ///
    /// Without a remote page the stored fresh page is still good enough, and
    /// failing that an invalidated page within `StaleExpireTime`; the session
    /// then keeps serving from the invalidated family.
    pub fn has_remote_cache(&mut self, layout: &str, check_request: bool) -> bool {
        if self.site.backlog().exists() {
            return false;
        }
        if !self.is_allowed_url()
            || (check_request && !self.is_allowed_request())
            || !self.entry.parent_cached()
            || self.site.lock().is_locked()
        {
            return false;
        }

        let context = self.lookup_context(layout);
        match self.site.api().get(&self.url, &context) {
            Ok(response) if response.status() == ResponseStatus::Ok => {
                return match self.store_remote(&response.body) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(url = %self.url, error = %e, "Failed to store remote page");
                        false
                    }
                };
            }
            Ok(response) => {
                tracing::debug!(url = %self.url, code = response.code, "No remote page");
            }
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Remote lookup failed");
            }
        }

        if self.entry.has_cache() {
            return true;
        }
        self.entry.set_use_invalidated(true);
        if self.has_local_cache(false) {
            return true;
        }
        self.entry.set_use_invalidated(false);
        false
    }

    /// Local cache first, then the service.
    pub fn has_cache(&mut self, layout: &str) -> bool {
        self.has_local_cache(true) || self.has_remote_cache(layout, true)
    }

    /// The stored page to answer with, gzipped when the client accepts it
    /// and `output_started` is false.
    pub fn read(&self, output_started: bool) -> Result<CacheDocument, CoreError> {
        let response = ResponseContext {
            output_started,
            ..ResponseContext::from_accept_encoding(self.request.accept_encoding.as_deref())
        };
        Ok(self.entry.read(response)?)
    }

    /// Seconds the served page stays fresh.
    #[must_use]
    pub fn remaining_ttl(&self) -> u64 {
        self.entry.remaining_ttl(self.site.config.page_cache.expire_time)
    }

    fn lookup_context(&self, layout: &str) -> LookupContext {
        let key = self.site.key_context(self.request.cookies.clone());
        LookupContext {
            user_agent: self.request.user_agent.clone().unwrap_or_default(),
            cookies: key.supported(),
            ajax: self.ajax,
            layout: layout.to_owned(),
            remote_addr: self.request.remote_addr.clone().unwrap_or_default(),
            referer: self.request.referer.clone(),
            cache_prefix: Some(key.custom_prefix()),
        }
    }

    /// Replace whatever is stored for the key with the service's page.
    fn store_remote(&mut self, raw: &[u8]) -> Result<(), CoreError> {
        self.entry.set_use_invalidated(true);
        let cleared = if self.entry.has_cache() {
            self.entry.delete_files()
        } else {
            Ok(())
        };
        self.entry.set_use_invalidated(false);
        cleared?;

        let document = CacheDocument::from_bytes(raw);
        self.entry.set_content(&document.body, document.headers)?;
        tracing::debug!(url = %self.url, "Stored remote page");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::tests::Fixture;
    use fpc_backlog::HealthStatus;
    use fpc_config::{AjaxUrls, SiteConfig};
    use fpc_pagecache::FileVariant;
    use fpc_transport::{MockTransport, Request, Response};
    use pretty_assertions::assert_eq;

    const PAGE: &str = "https://example.com/";

    fn config() -> SiteConfig {
        let mut config = SiteConfig::default();
        config.page_cache.expire_time = 3600;
        config.page_cache.stale_expire_time = 86_400;
        config
    }

    #[test]
    fn test_session_normalizes_url() {
        let fx = Fixture::new(MockTransport::new());
        let mut config = config();
        config.ignored_params = vec!["utm_*".to_owned()];
        let site = fx.site(config);

        let session = site
            .session(RequestInfo::get("https://example.com/?utm_source=x&b=2&a=1#top"))
            .unwrap();

        assert_eq!(session.url(), "https://example.com/?a=1&b=2");
        assert!(!session.is_ajax());
    }

    #[test]
    fn test_local_cache_fresh_then_expired() {
        let fx = Fixture::new(MockTransport::new());
        let site = fx.site(config());
        fx.cache_page(&site, PAGE);
        let session = site.session(RequestInfo::get(PAGE)).unwrap();

        assert!(session.has_local_cache(true));
        assert_eq!(session.remaining_ttl(), 3600);

        fx.clock.advance(3600);
        assert!(!session.has_local_cache(true));
    }

    #[test]
    fn test_local_cache_refused_while_unhealthy_or_backlogged() {
        let fx = Fixture::new(MockTransport::new());
        let site = fx.site(config());
        fx.cache_page(&site, PAGE);
        let session = site.session(RequestInfo::get(PAGE)).unwrap();

        fx.health.set(HealthStatus::UnderTheWeather).unwrap();
        assert!(!session.has_local_cache(true));

        fx.health.set(HealthStatus::Healthy).unwrap();
        fx.backlog.append(&Request::post("cache/purge/site1")).unwrap();
        assert!(!session.has_local_cache(true));
    }

    #[test]
    fn test_local_cache_checks_revision() {
        let fx = Fixture::new(MockTransport::new());
        let mut config = config();
        config.revision_hash = Some("rev2".to_owned());
        let site = fx.site(config);
        fx.cache_page(&site, PAGE);

        let session = site.session(RequestInfo::get(PAGE)).unwrap();

        assert!(!session.has_local_cache(true));
    }

    #[test]
    fn test_remote_page_is_stored() {
        let transport = MockTransport::new();
        transport.push(Ok(Response::new(200).with_body("x-cache-ctime: 1700000000\r\n\r\n<html>OK</html>")));
        let fx = Fixture::new(transport);
        let site = fx.site(config());
        let mut session = site
            .session(RequestInfo::get(PAGE).with_user_agent("Mozilla/5.0 (iPhone)"))
            .unwrap();

        assert!(session.has_cache("default"));

        let sent = &fx.transport.requests()[0];
        assert_eq!(sent.path, "cache/get/site1/default");
        assert_eq!(sent.headers["X-Nitro-Url"], PAGE);
        assert_eq!(session.device(), DeviceType::Mobile);
        let document = session.read(false).unwrap();
        assert_eq!(document.body, b"<html>OK</html>");
        assert_eq!(document.headers.get("x-cache-ctime"), Some("1700000000"));
        assert!(session.has_local_cache(true));
    }

    #[test]
    fn test_remote_page_replaces_invalidated_copy() {
        let transport = MockTransport::new();
        transport.push(Ok(Response::new(200).with_body("\r\n\r\n<html>new</html>")));
        let fx = Fixture::new(transport);
        let site = fx.site(config());
        fx.cache_page(&site, PAGE);
        site.invalidate_local_url(PAGE);
        let invalidated = fx.page_dir(&site, PAGE, true);
        assert!(fx.exists(&invalidated));

        let mut session = site.session(RequestInfo::get(PAGE)).unwrap();

        assert!(session.has_remote_cache("default", true));
        assert!(!fx.exists(&invalidated));
        assert!(!session.entry().use_invalidated());
        assert_eq!(session.read(false).unwrap().body, b"<html>new</html>");
    }

    #[test]
    fn test_remote_miss_falls_back_to_stale_page() {
        let fx = Fixture::new(MockTransport::with_handler(|_| Ok(Response::new(404))));
        let site = fx.site(config());
        fx.cache_page(&site, PAGE);
        site.invalidate_local_url(PAGE);
        let mut session = site.session(RequestInfo::get(PAGE)).unwrap();

        assert!(!session.has_local_cache(true));
        assert!(session.has_remote_cache("default", true));

        assert!(session.entry().use_invalidated());
        let document = session.read(false).unwrap();
        assert_eq!(document.body, b"<html>NITROPACK_STATE='STALE'</html>");
        assert_eq!(session.remaining_ttl(), 0);
    }

    #[test]
    fn test_remote_miss_without_any_copy() {
        let fx = Fixture::new(MockTransport::with_handler(|_| Ok(Response::new(404))));
        let site = fx.site(config());
        let mut session = site.session(RequestInfo::get(PAGE)).unwrap();

        assert!(!session.has_cache("default"));
        assert!(!session.entry().use_invalidated());
    }

    #[test]
    fn test_remote_lookup_skipped_while_purging() {
        let fx = Fixture::new(MockTransport::new());
        let site = fx.site(config());
        site.lock().lock().unwrap();
        let mut session = site.session(RequestInfo::get(PAGE)).unwrap();

        assert!(!session.has_remote_cache("default", true));
        assert!(fx.transport.requests().is_empty());
    }

    #[test]
    fn test_ajax_fragment_depends_on_referer() {
        let fx = Fixture::new(MockTransport::new());
        let mut config = config();
        config.ajax_urls = AjaxUrls {
            status: true,
            urls: vec!["*/wp-json/*".to_owned()],
            standalone_urls: Vec::new(),
        };
        let site = fx.site(config);
        let request = RequestInfo::get("https://example.com/wp-json/cart").with_referer(PAGE);

        let mut session = site.session(request.clone()).unwrap();
        assert!(session.is_ajax());
        assert!(session.entry().has_parent());
        assert!(!session.has_remote_cache("default", true));
        assert!(fx.transport.requests().is_empty());

        fx.cache_page(&site, PAGE);
        let mut session = site.session(request).unwrap();
        assert!(session.has_remote_cache("default", true));
        assert_eq!(fx.transport.requests()[0].headers["X-Nitro-Ajax"], "1");
        assert!(
            fx.exists(&session.entry().cache_file_path(FileVariant::Fresh)),
            "fragment is stored in the page's directory"
        );
        assert!(
            session
                .entry()
                .cache_file_path(FileVariant::Fresh)
                .starts_with(fx.page_dir(&site, PAGE, false))
        );
    }

    #[test]
    fn test_gzip_variant_when_accepted() {
        let transport = MockTransport::new();
        transport.push(Ok(Response::new(200).with_body("\r\n\r\n<html>OK</html>")));
        let fx = Fixture::new(transport);
        let settings = fpc_config::CacheSettings {
            compression: true,
            ..fpc_config::CacheSettings::default()
        };
        let site = fx.site_with(config(), settings);
        let mut request = RequestInfo::get(PAGE);
        request.accept_encoding = Some("gzip, deflate".to_owned());
        let mut session = site.session(request).unwrap();
        assert!(session.has_remote_cache("default", true));

        let gzipped = session.read(false).unwrap();
        let plain = session.read(true).unwrap();

        assert_eq!(gzipped.headers.get("content-encoding"), Some("gzip"));
        assert_eq!(plain.body, b"<html>OK</html>");
    }
}
