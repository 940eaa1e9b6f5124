//! Which requests may be served from, or stored in, the page cache.

use std::collections::BTreeMap;

use fpc_config::{SiteConfig, Wildcard, any_match};
use fpc_pagecache::PageCacheEntry;
use url::Url;

const SERVICE_REQUEST_HEADER: &str = "x-nitropack-request";
const REQUESTED_WITH_HEADER: &str = "x-requested-with";
const BYPASS_PARAM: &str = "nonitro";
const SUCURI_MARKER: &str = "sucurianticache=";

/// The parts of an incoming HTTP request the cache looks at.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Absolute request URL as received.
    pub url: String,
    /// `None` when the request did not come through HTTP (cron, CLI).
    pub method: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub remote_addr: Option<String>,
    pub accept_encoding: Option<String>,
    /// Other headers, names lowercased.
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
}

impl RequestInfo {
    /// A `GET` of `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Some("GET".to_owned()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn method_is(&self, method: &str) -> bool {
        self.method
            .as_deref()
            .is_none_or(|m| m.is_empty() || m.eq_ignore_ascii_case(method))
    }

    fn has_query_param(&self, name: &str) -> bool {
        Url::parse(&self.url).is_ok_and(|url| url.query_pairs().any(|(k, _)| k == name))
    }
}

/// Cacheability rules of a site config. Holds no state of its own.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy<'a> {
    config: &'a SiteConfig,
}

impl<'a> AdmissionPolicy<'a> {
    #[must_use]
    pub fn new(config: &'a SiteConfig) -> Self {
        Self { config }
    }

    /// Whether pages of `url` may be cached.
    ///
    /// When the enabled list is on and not empty only URLs matching it are
    /// allowed, and the disabled list is not consulted.
    #[must_use]
    pub fn is_allowed_url(&self, url: &str) -> bool {
        if url.contains(SUCURI_MARKER) {
            return false;
        }

        let enabled = &self.config.enabled_urls;
        let disabled = &self.config.disabled_urls;
        if enabled.status {
            if !enabled.urls.is_empty() {
                return any_match(&enabled.urls, url, Wildcard::url);
            }
        } else if disabled.status && any_match(&disabled.urls, url, Wildcard::url) {
            return false;
        }
        true
    }

    #[must_use]
    pub fn is_ajax_url(&self, url: &str) -> bool {
        let ajax = &self.config.ajax_urls;
        ajax.status && any_match(&ajax.urls, url, Wildcard::url)
    }

    /// AJAX URLs that are cached on their own, without a referring page.
    #[must_use]
    pub fn is_standalone_ajax_url(&self, url: &str) -> bool {
        let ajax = &self.config.ajax_urls;
        ajax.status && any_match(&ajax.standalone_urls, url, Wildcard::url)
    }

    /// Whether the request for the normalized `url` is an AJAX request.
    #[must_use]
    pub fn is_ajax(&self, request: &RequestInfo, url: &str) -> bool {
        request
            .header(REQUESTED_WITH_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("xmlhttprequest"))
            || self.is_ajax_url(url)
            || self.is_standalone_ajax_url(url)
    }

    /// Internet Explorer gets uncached pages.
    #[must_use]
    pub fn is_allowed_browser(user_agent: Option<&str>) -> bool {
        let Some(ua) = user_agent.filter(|ua| !ua.is_empty()) else {
            return true;
        };
        let lower = ua.to_ascii_lowercase();
        !(lower.contains("msie")
            || lower.contains("internet explorer")
            || ua.contains("Trident/7.0; rv:11.0"))
    }

    /// An AJAX fragment is cacheable when standalone, or when the page it
    /// was requested from is cached and fresh.
    #[must_use]
    pub fn is_allowed_ajax(&self, url: &str, entry: &PageCacheEntry) -> bool {
        if self.is_standalone_ajax_url(url) {
            return true;
        }
        entry.has_parent()
            && entry.parent_cached()
            && !entry.parent_expired(self.config.page_cache.expire_time)
    }

    /// Whether `request` may be answered from the cache.
    ///
    /// `url` is the normalized request URL and `entry` the cache entry built
    /// for it. Requests made by the cache service itself are refused unless
    /// `allow_service_requests` is set.
    #[must_use]
    pub fn is_allowed_request(
        &self,
        request: &RequestInfo,
        url: &str,
        entry: &PageCacheEntry,
        allow_service_requests: bool,
    ) -> bool {
        if self.is_ajax(request, url) && !self.is_allowed_ajax(url, entry) {
            return false;
        }
        if !(request.method_is("GET") || request.method_is("HEAD")) {
            return false;
        }
        if !allow_service_requests && request.header(SERVICE_REQUEST_HEADER).is_some() {
            return false;
        }
        if request.has_query_param(BYPASS_PARAM) {
            return false;
        }
        if !Self::is_allowed_browser(request.user_agent.as_deref()) {
            return false;
        }
        !self.has_excluded_cookie(&request.cookies)
    }

    /// Whether any cookie matches an excluded-cookie rule. A rule without
    /// values excludes the cookie whatever its value.
    #[must_use]
    pub fn has_excluded_cookie(&self, cookies: &BTreeMap<String, String>) -> bool {
        let excluded = &self.config.excluded_cookies;
        if !excluded.status {
            return false;
        }
        excluded.cookies.iter().any(|rule| {
            let name = match Wildcard::new(&rule.name) {
                Ok(name) => name,
                Err(e) => {
                    tracing::warn!(pattern = %rule.name, error = %e, "Skipping invalid cookie rule");
                    return false;
                }
            };
            cookies
                .iter()
                .filter(|(cookie, _)| name.is_match(cookie))
                .any(|(_, value)| rule.values.is_empty() || any_match(&rule.values, value, Wildcard::new))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use fpc_config::{AjaxUrls, CookieExclude, ExcludedCookies, UrlList};
    use fpc_pagecache::EntryOptions;
    use fpc_storage::{Clock, FsStorage, HeaderBlock, ManualClock, Storage};

    const PAGE: &str = "https://example.com/";
    const FRAGMENT: &str = "https://example.com/wp-json/cart";

    fn list(urls: &[&str]) -> UrlList {
        UrlList {
            status: true,
            urls: urls.iter().map(|u| (*u).to_owned()).collect(),
        }
    }

    fn ajax_config() -> SiteConfig {
        let mut config = SiteConfig::default();
        config.page_cache.expire_time = 3600;
        config.ajax_urls = AjaxUrls {
            status: true,
            urls: vec!["https://*/wp-json/*".to_owned()],
            standalone_urls: vec!["*/feed".to_owned()],
        };
        config
    }

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        storage: Arc<dyn Storage>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = tempfile::tempdir().unwrap();
            Self {
                storage: Arc::new(FsStorage::new(temp_dir.path().to_path_buf())),
                clock: Arc::new(ManualClock::new(10_000)),
                _temp_dir: temp_dir,
            }
        }

        fn entry(&self, url: &str, referer: Option<&str>, ajax: bool) -> PageCacheEntry {
            PageCacheEntry::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.clock) as Arc<dyn Clock>,
                Path::new("pagecache"),
                EntryOptions {
                    url: url.to_owned(),
                    referer: referer.map(str::to_owned),
                    ajax,
                    ..EntryOptions::default()
                },
            )
            .unwrap()
        }
    }

    #[test]
    fn test_sucuri_marker_is_never_cached() {
        let config = SiteConfig::default();

        assert!(!AdmissionPolicy::new(&config).is_allowed_url("https://example.com/?sucurianticache=1"));
        assert!(AdmissionPolicy::new(&config).is_allowed_url(PAGE));
    }

    #[test]
    fn test_enabled_list_wins_over_disabled_list() {
        let config = SiteConfig {
            enabled_urls: list(&["https://example.com/blog/*"]),
            disabled_urls: list(&["*/blog/*"]),
            ..SiteConfig::default()
        };
        let policy = AdmissionPolicy::new(&config);

        assert!(policy.is_allowed_url("http://example.com/blog/post"));
        assert!(!policy.is_allowed_url("https://example.com/shop"));
    }

    #[test]
    fn test_empty_enabled_list_allows_everything() {
        let config = SiteConfig {
            enabled_urls: list(&[]),
            disabled_urls: list(&["*"]),
            ..SiteConfig::default()
        };

        assert!(AdmissionPolicy::new(&config).is_allowed_url(PAGE));
    }

    #[test]
    fn test_disabled_list() {
        let config = SiteConfig {
            disabled_urls: list(&["//example.com/cart*"]),
            ..SiteConfig::default()
        };
        let policy = AdmissionPolicy::new(&config);

        assert!(!policy.is_allowed_url("https://example.com/cart/"));
        assert!(policy.is_allowed_url("https://example.com/shop"));
    }

    #[test]
    fn test_ajax_detection() {
        let config = ajax_config();
        let policy = AdmissionPolicy::new(&config);
        let plain = RequestInfo::get(PAGE);
        let xhr = RequestInfo::get(PAGE).with_header("X-Requested-With", "XMLHttpRequest");

        assert!(!policy.is_ajax(&plain, PAGE));
        assert!(policy.is_ajax(&xhr, PAGE));
        assert!(policy.is_ajax(&plain, FRAGMENT));
        assert!(policy.is_ajax(&plain, "https://example.com/feed"));
    }

    #[test]
    fn test_ajax_requires_fresh_parent() {
        let fx = Fixture::new();
        let config = ajax_config();
        let policy = AdmissionPolicy::new(&config);
        let request = RequestInfo::get(FRAGMENT);
        let orphan = fx.entry(FRAGMENT, None, true);
        let fragment = fx.entry(FRAGMENT, Some(PAGE), true);

        assert!(!policy.is_allowed_request(&request, FRAGMENT, &orphan, false));
        assert!(!policy.is_allowed_request(&request, FRAGMENT, &fragment, false));

        fx.entry(PAGE, None, false)
            .set_content(b"<html>page</html>", HeaderBlock::new())
            .unwrap();
        assert!(policy.is_allowed_request(&request, FRAGMENT, &fragment, false));

        fx.clock.advance(3600);
        assert!(!policy.is_allowed_request(&request, FRAGMENT, &fragment, false));
    }

    #[test]
    fn test_standalone_ajax_needs_no_parent() {
        let fx = Fixture::new();
        let config = ajax_config();
        let url = "https://example.com/feed";
        let entry = fx.entry(url, None, true);

        assert!(AdmissionPolicy::new(&config).is_allowed_request(&RequestInfo::get(url), url, &entry, false));
    }

    #[test]
    fn test_only_get_and_head() {
        let fx = Fixture::new();
        let config = SiteConfig::default();
        let policy = AdmissionPolicy::new(&config);
        let entry = fx.entry(PAGE, None, false);
        let mut cli = RequestInfo::get(PAGE);
        cli.method = None;

        assert!(policy.is_allowed_request(&RequestInfo::get(PAGE), PAGE, &entry, false));
        assert!(policy.is_allowed_request(&RequestInfo::get(PAGE).with_method("HEAD"), PAGE, &entry, false));
        assert!(policy.is_allowed_request(&cli, PAGE, &entry, false));
        assert!(!policy.is_allowed_request(&RequestInfo::get(PAGE).with_method("POST"), PAGE, &entry, false));
    }

    #[test]
    fn test_service_and_bypass_requests() {
        let fx = Fixture::new();
        let config = SiteConfig::default();
        let policy = AdmissionPolicy::new(&config);
        let entry = fx.entry(PAGE, None, false);
        let service = RequestInfo::get(PAGE).with_header("X-Nitropack-Request", "1");
        let bypass = RequestInfo::get("https://example.com/?nonitro");

        assert!(!policy.is_allowed_request(&service, PAGE, &entry, false));
        assert!(policy.is_allowed_request(&service, PAGE, &entry, true));
        assert!(!policy.is_allowed_request(&bypass, PAGE, &entry, false));
    }

    #[test]
    fn test_internet_explorer_is_refused() {
        assert!(!AdmissionPolicy::is_allowed_browser(Some(
            "Mozilla/4.0 (compatible; MSIE 8.0; Windows NT 6.1)"
        )));
        assert!(!AdmissionPolicy::is_allowed_browser(Some(
            "Mozilla/5.0 (Windows NT 10.0; Trident/7.0; rv:11.0) like Gecko"
        )));
        assert!(AdmissionPolicy::is_allowed_browser(Some("Mozilla/5.0 Firefox/120.0")));
        assert!(AdmissionPolicy::is_allowed_browser(None));
    }

    #[test]
    fn test_excluded_cookies() {
        let config = SiteConfig {
            excluded_cookies: ExcludedCookies {
                status: true,
                cookies: vec![
                    CookieExclude {
                        name: "wordpress_logged_in_*".to_owned(),
                        values: Vec::new(),
                    },
                    CookieExclude {
                        name: "currency".to_owned(),
                        values: vec!["EU*".to_owned()],
                    },
                ],
            },
            ..SiteConfig::default()
        };
        let policy = AdmissionPolicy::new(&config);
        let cookies = |name: &str, value: &str| BTreeMap::from([(name.to_owned(), value.to_owned())]);

        assert!(policy.has_excluded_cookie(&cookies("wordpress_logged_in_abc", "x")));
        assert!(policy.has_excluded_cookie(&cookies("currency", "EUR")));
        assert!(!policy.has_excluded_cookie(&cookies("currency", "USD")));
        assert!(!policy.has_excluded_cookie(&cookies("xcurrency", "EUR")));
    }

    #[test]
    fn test_excluded_cookies_switched_off() {
        let config = SiteConfig {
            excluded_cookies: ExcludedCookies {
                status: false,
                cookies: vec![CookieExclude {
                    name: "*".to_owned(),
                    values: Vec::new(),
                }],
            },
            ..SiteConfig::default()
        };
        let cookies = BTreeMap::from([("session".to_owned(), "1".to_owned())]);

        assert!(!AdmissionPolicy::new(&config).has_excluded_cookie(&cookies));
    }
}
