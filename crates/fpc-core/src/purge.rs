//! Purge and invalidation across the local cache, the service and reverse
//! proxies.

use std::collections::HashSet;
use std::ops::{BitOr, BitOrAssign};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use fpc_api::{ApiError, PurgeOptions};
use fpc_pagecache::{DeviceType, url_dir};
use fpc_storage::StorageError;

use crate::{CoreError, SiteCache, md5_hex};

/// Calls made to resolve a tag before giving up.
const TAG_ATTEMPTS: u32 = 10;

/// Most distinct URLs a tag purge clears locally.
const MAX_TAG_URLS: usize = 10_000;

const INVALIDATED_SUFFIX: &str = "_i";

/// What a purge does, as a set of flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PurgeMode(u8);

impl PurgeMode {
    /// Remove the cache outright.
    pub const COMPLETE: Self = Self(1);
    /// Keep pages as stale fallbacks instead of removing them.
    pub const INVALIDATE: Self = Self(2);
    /// Keep the service's optimized assets.
    pub const PAGECACHE_ONLY: Self = Self(4);
    /// Leave the stale copy of a complete local purge to the caller.
    pub const LIGHT_PURGE: Self = Self(8);

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Mode from raw bits. Unknown bits are dropped.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b1111)
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for PurgeMode {
    fn default() -> Self {
        Self::COMPLETE
    }
}

impl BitOr for PurgeMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PurgeMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// What to purge. No URLs and no tag means the whole site.
#[derive(Debug, Clone, Default)]
pub struct PurgeRequest {
    pub urls: Vec<String>,
    pub tag: Option<String>,
    pub mode: PurgeMode,
    /// Shown in the service's purge history.
    pub reason: Option<String>,
}

impl PurgeRequest {
    #[must_use]
    pub fn site(mode: PurgeMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn urls(urls: Vec<String>, mode: PurgeMode) -> Self {
        Self {
            urls,
            mode,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn tag(tag: impl Into<String>, mode: PurgeMode) -> Self {
        Self {
            tag: Some(tag.into()),
            mode,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn is_site(&self) -> bool {
        self.urls.is_empty() && self.tag.is_none()
    }
}

/// Outcome of a purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    /// Every local removal or invalidation succeeded.
    pub local: bool,
    /// The service accepted the purge. False when it was refused as down
    /// and the purge went to the backlog instead.
    pub remote: bool,
    /// Renamed cache root that was left for the caller to delete.
    pub stale_dir: Option<PathBuf>,
    /// Distinct URLs a tag resolved to.
    pub tag_urls: usize,
}

impl PurgeReport {
    fn new() -> Self {
        Self {
            local: true,
            remote: true,
            stale_dir: None,
            tag_urls: 0,
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.local && self.remote
    }
}

impl SiteCache {
    /// Purge or invalidate locally, at the service and at reverse proxies.
    ///
    /// Holds the page cache lock for the whole call, also when it fails, so
    /// no remote lookup writes pages while directories move.
    pub fn purge(&self, request: &PurgeRequest) -> Result<PurgeReport, CoreError> {
        let _lock = self.lock.acquire()?;
        let mode = request.mode;
        let invalidate = mode.contains(PurgeMode::INVALIDATE);
        let light = mode.contains(PurgeMode::LIGHT_PURGE);

        let mut report = PurgeReport::new();
        if request.is_site() {
            let options = PurgeOptions {
                pagecache_only: mode.contains(PurgeMode::PAGECACHE_ONLY),
                reason: request.reason.clone(),
                light,
            };
            if invalidate {
                self.invalidate_local_cache()?;
                report.remote = self.purge_remote(None, &options)?;
            } else {
                let stale_dir = self.purge_local_cache(true)?;
                report.remote = match self.purge_remote(None, &options) {
                    Ok(remote) => remote,
                    Err(e) => {
                        // the caller never sees the stale dir on failure
                        self.delete_stale_dir(&stale_dir);
                        self.revision.refresh();
                        return Err(e);
                    }
                };
                if light || self.settings.quick_purge {
                    report.stale_dir = Some(stale_dir);
                } else {
                    self.delete_stale_dir(&stale_dir);
                }
            }
            self.revision.refresh();
            tracing::info!(invalidate, remote = report.remote, "Purged site cache");
            return Ok(report);
        }

        let options = PurgeOptions {
            pagecache_only: false,
            reason: request.reason.clone(),
            light,
        };
        if !request.urls.is_empty() {
            let mut urls = Vec::with_capacity(request.urls.len());
            for url in &request.urls {
                let url = self.normalize(url)?;
                report.local &= self.clear_local_url(&url, invalidate);
                urls.push(url);
            }
            let result = match urls.as_slice() {
                [url] => self.api.purge(Some(url), &options),
                _ => self.api.purge_urls(&urls, &options),
            };
            report.remote = accepted(result)?;
        }
        if let Some(tag) = &request.tag {
            self.purge_tag(tag, invalidate, request.reason.as_deref(), &mut report)?;
        }
        tracing::info!(
            urls = request.urls.len(),
            tag = request.tag.as_deref(),
            invalidate,
            local = report.local,
            remote = report.remote,
            "Purged pages"
        );
        Ok(report)
    }

    /// Invalidate pages, keeping them as stale fallbacks.
    pub fn invalidate_cache(
        &self,
        urls: Vec<String>,
        tag: Option<String>,
        reason: Option<String>,
    ) -> Result<PurgeReport, CoreError> {
        self.purge(&PurgeRequest {
            urls,
            tag,
            mode: PurgeMode::INVALIDATE | PurgeMode::PAGECACHE_ONLY,
            reason,
        })
    }

    /// Remove every page of the site but keep optimized assets.
    pub fn clear_page_cache(&self, reason: Option<String>) -> Result<PurgeReport, CoreError> {
        self.purge(&PurgeRequest {
            mode: PurgeMode::PAGECACHE_ONLY,
            reason,
            ..PurgeRequest::default()
        })
    }

    /// Move the whole cache root aside and start an empty one.
    ///
    /// Readers holding files of the old root keep working. The old root is
    /// deleted unless `quick` is set; its path is returned either way. Also
    /// purges proxies, forces a site config refetch and refreshes the
    /// element revision.
    pub fn purge_local_cache(&self, quick: bool) -> Result<PathBuf, CoreError> {
        let stale_dir = self.stale_dir_name();
        self.purge_proxy_cache(None);
        self.config_store.reset_last_fetch(self.storage.as_ref())?;

        if self.storage.exists(&self.cache_dir) {
            self.storage.rename(&self.cache_dir, &stale_dir)?;
        }
        self.storage.create_dir(&self.cache_dir)?;
        if !quick {
            self.delete_stale_dir(&stale_dir);
        }

        self.revision.refresh();
        tracing::info!(stale_dir = %stale_dir.display(), quick, "Purged local cache");
        Ok(stale_dir)
    }

    /// Delete both directory families of `url` for every device type.
    ///
    /// Returns `false` when a directory could not be deleted.
    pub fn purge_local_url(&self, url: &str) -> bool {
        let Some(url) = self.normalize_logged(url) else {
            return false;
        };
        self.purge_proxy_cache(Some(&url));

        let mut ok = true;
        for device in DeviceType::ALL {
            let base = self.device_dir(device);
            for invalidated in [false, true] {
                let dir = url_dir(&base, &url, invalidated, self.layout());
                if let Err(e) = self.storage.delete_dir(&dir) {
                    tracing::warn!(url = %url, dir = %dir.display(), error = %e, "Failed to delete page cache");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Move the pages of `url` into the invalidated family for every device
    /// type.
    pub fn invalidate_local_url(&self, url: &str) -> bool {
        let Some(url) = self.normalize_logged(url) else {
            return false;
        };
        self.purge_proxy_cache(Some(&url));

        let mut ok = true;
        for device in DeviceType::ALL {
            let base = self.device_dir(device);
            let dir = url_dir(&base, &url, false, self.layout());
            let invalidated = url_dir(&base, &url, true, self.layout());
            if let Err(e) = self.invalidate_dir(&dir, &invalidated) {
                tracing::warn!(url = %url, dir = %dir.display(), error = %e, "Failed to invalidate page cache");
                ok = false;
            }
        }
        ok
    }

    /// Invalidate every page of the site. Also purges proxies and forces a
    /// site config refetch.
    pub fn invalidate_local_cache(&self) -> Result<(), CoreError> {
        self.purge_proxy_cache(None);
        self.config_store.reset_last_fetch(self.storage.as_ref())?;

        for device in DeviceType::ALL {
            self.storage
                .for_each_entry(&self.device_dir(device), &mut |dir| {
                    if is_invalidated(dir) || !self.storage.is_dir(dir) {
                        return Ok(());
                    }
                    self.invalidate_dir(dir, &invalidated_sibling(dir))
                })?;
        }
        tracing::info!(cache_dir = %self.cache_dir.display(), "Invalidated local cache");
        Ok(())
    }

    /// Purge `url`, or everything when `None`, at every configured reverse
    /// proxy. Returns how many proxies accepted the purge.
    pub fn purge_proxy_cache(&self, url: Option<&str>) -> usize {
        let (Some(proxy), Some(varnish)) = (&self.proxy, self.config.varnish()) else {
            return 0;
        };
        match url {
            Some(url) => match self.normalize_logged(url) {
                Some(url) => proxy.purge(&url, &varnish.purge_single_method),
                None => 0,
            },
            None => proxy.purge(&varnish.purge_all_url, &varnish.purge_all_method),
        }
    }

    /// Resolve `tag` at the service and clear whatever it returns locally.
    ///
    /// The service may answer with different URLs on every call while its
    /// index catches up, so it is asked again until it returns nothing.
    /// When it is down the whole local cache is purged instead.
    fn purge_tag(
        &self,
        tag: &str,
        invalidate: bool,
        reason: Option<&str>,
        report: &mut PurgeReport,
    ) -> Result<(), CoreError> {
        let options = PurgeOptions {
            reason: reason.map(str::to_owned),
            ..PurgeOptions::default()
        };
        let mut seen = HashSet::new();
        let mut attempts_left = TAG_ATTEMPTS;
        let mut calls = 0;
        let mut last_failed = false;

        loop {
            calls += 1;
            match self.api.purge_by_tag(tag, &options) {
                Ok(urls) => {
                    last_failed = false;
                    if urls.is_empty() {
                        break;
                    }
                    for url in urls {
                        if seen.len() >= MAX_TAG_URLS {
                            tracing::warn!(tag, limit = MAX_TAG_URLS, "Tag resolves to too many URLs");
                            break;
                        }
                        if !seen.contains(&url) {
                            report.local &= self.clear_local_url(&url, invalidate);
                            seen.insert(url);
                        }
                    }
                }
                Err(e) if e.is_service_down() => {
                    tracing::warn!(tag, error = %e, "Service down, purging whole local cache");
                    report.stale_dir = Some(self.purge_local_cache(true)?);
                    report.remote = false;
                    break;
                }
                Err(e) => {
                    tracing::warn!(tag, error = %e, attempts_left, "Tag purge failed");
                    last_failed = true;
                    attempts_left -= 1;
                    thread::sleep(self.tag_retry_delay);
                }
            }
            if attempts_left == 0 || calls >= TAG_ATTEMPTS || seen.len() >= MAX_TAG_URLS {
                break;
            }
        }

        if last_failed {
            report.remote = false;
        }
        report.tag_urls = seen.len();
        Ok(())
    }

    fn clear_local_url(&self, url: &str, invalidate: bool) -> bool {
        if invalidate {
            self.invalidate_local_url(url)
        } else {
            self.purge_local_url(url)
        }
    }

    /// Merge `dir` into `invalidated`, or rename it when there is nothing to
    /// merge into. The invalidated directory's time restarts the stale TTL.
    fn invalidate_dir(&self, dir: &Path, invalidated: &Path) -> Result<(), StorageError> {
        if !self.storage.exists(dir) {
            return Ok(());
        }
        if self.storage.exists(invalidated) {
            self.storage.for_each_entry(dir, &mut |file| match file.file_name() {
                Some(name) => self.storage.rename(file, &invalidated.join(name)),
                None => Ok(()),
            })?;
            self.storage.delete_dir(dir)?;
        } else {
            self.storage.rename(dir, invalidated)?;
        }
        self.storage.touch(invalidated, Some(self.clock.now()))
    }

    fn purge_remote(&self, url: Option<&str>, options: &PurgeOptions) -> Result<bool, CoreError> {
        accepted(self.api.purge(url, options))
    }

    fn stale_dir_name(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        let base = format!("{}.stale.{}", self.cache_dir.display(), md5_hex(nanos.to_string()));
        let mut candidate = PathBuf::from(&base);
        let mut counter = 0;
        while self.storage.exists(&candidate) {
            counter += 1;
            candidate = PathBuf::from(format!("{base}_{counter}"));
        }
        candidate
    }

    fn delete_stale_dir(&self, stale_dir: &Path) {
        if let Err(e) = self.storage.delete_dir(stale_dir) {
            tracing::warn!(dir = %stale_dir.display(), error = %e, "Failed to delete stale cache");
        }
    }

    fn normalize_logged(&self, url: &str) -> Option<String> {
        match self.normalize(url) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(url, error = %e, "Skipping invalid URL");
                None
            }
        }
    }
}

/// Whether the service took the purge. A service that is down is not an
/// error here; the local cache was already cleared.
fn accepted(result: Result<(), ApiError>) -> Result<bool, CoreError> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_service_down() => {
            tracing::warn!(error = %e, "Remote purge deferred");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn is_invalidated(dir: &Path) -> bool {
    dir.to_string_lossy().ends_with(INVALIDATED_SUFFIX)
}

fn invalidated_sibling(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_owned();
    name.push(INVALIDATED_SUFFIX);
    PathBuf::from(name)
}
