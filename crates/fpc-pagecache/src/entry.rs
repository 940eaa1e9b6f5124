//! One cached rendering and its on-disk variants.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use fpc_storage::{CacheDocument, Clock, HeaderBlock, Storage, StorageExt};

use crate::{CacheKey, DeviceType, KeyContext, PageCacheError, PathLayout, url_dir};

const EXPIRES_HEADER: &str = "x-nitro-expires";
const CTIME_HEADER: &str = "x-cache-ctime";
const REVISION_HEADER: &str = "x-nitro-rev";

const FRESH_MARKER: &[u8] = b"NITROPACK_STATE='FRESH'";
const STALE_MARKER: &[u8] = b"NITROPACK_STATE='STALE'";
const _: () = assert!(FRESH_MARKER.len() == STALE_MARKER.len());

const GZIP_LEVEL: u32 = 4;

/// The files a cache key can have in one directory family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileVariant {
    Fresh,
    FreshGz,
    Stale,
    StaleGz,
}

impl FileVariant {
    fn suffix(self) -> &'static str {
        match self {
            Self::Fresh => "",
            Self::FreshGz => ".gz",
            Self::Stale => ".stale",
            Self::StaleGz => ".stale.gz",
        }
    }

    fn gzipped(self) -> Self {
        match self {
            Self::Fresh | Self::FreshGz => Self::FreshGz,
            Self::Stale | Self::StaleGz => Self::StaleGz,
        }
    }
}

/// What the response writer allows when a cached page is served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseContext {
    /// The client sent `gzip` in `Accept-Encoding`.
    pub accepts_gzip: bool,
    /// Response bytes were already emitted.
    pub output_started: bool,
}

impl ResponseContext {
    #[must_use]
    pub fn from_accept_encoding(accept_encoding: Option<&str>) -> Self {
        Self {
            accepts_gzip: accept_encoding.is_some_and(|v| v.contains("gzip")),
            output_started: false,
        }
    }
}

/// Inputs for one entry.
#[derive(Debug, Clone, Default)]
pub struct EntryOptions {
    /// Normalized page URL.
    pub url: String,
    /// Normalized referring page. Makes that page this entry's parent.
    pub referer: Option<String>,
    pub ajax: bool,
    pub device: DeviceType,
    pub key: KeyContext,
    pub layout: PathLayout,
}

/// A cache file location: the page whose directory holds it, and its name.
#[derive(Debug, Clone)]
struct Link {
    page_url: String,
    file_name: String,
}

/// A page cache entry, plus the page it depends on when it is an AJAX
/// fragment.
///
/// Nothing about the entry is persisted except its files. Checks run parent
/// first: a fragment is never cached or fresh when its page is not.
pub struct PageCacheEntry {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    url: String,
    referer: Option<String>,
    device: DeviceType,
    data_dir: PathBuf,
    layout: PathLayout,
    /// This entry first, then the parent if any.
    chain: Vec<Link>,
    compression: bool,
    use_invalidated: bool,
}

impl PageCacheEntry {
    /// Create the entry for `options` under `cache_root/<device>`.
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        cache_root: &Path,
        options: EntryOptions,
    ) -> Result<Self, PageCacheError> {
        let EntryOptions {
            url,
            referer,
            ajax,
            device,
            key,
            layout,
        } = options;

        if referer.as_deref() == Some(url.as_str()) {
            return Err(PageCacheError::SelfReferral(url));
        }

        let mut chain = Vec::with_capacity(2);
        match &referer {
            Some(referer) => {
                let page_url = if ajax { referer.clone() } else { url.clone() };
                chain.push(Link {
                    page_url,
                    file_name: CacheKey::derive(&url, ajax, &key).file_name(),
                });
                chain.push(Link {
                    page_url: referer.clone(),
                    file_name: CacheKey::derive(referer, false, &key).file_name(),
                });
            }
            None => chain.push(Link {
                page_url: url.clone(),
                file_name: CacheKey::derive(&url, false, &key).file_name(),
            }),
        }

        Ok(Self {
            storage,
            clock,
            url,
            referer,
            device,
            data_dir: cache_root.join(device.as_str()),
            layout,
            chain,
            compression: false,
            use_invalidated: false,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn referer(&self) -> Option<&str> {
        self.referer.as_deref()
    }

    #[must_use]
    pub fn device(&self) -> DeviceType {
        self.device
    }

    #[must_use]
    pub fn has_parent(&self) -> bool {
        self.chain.len() > 1
    }

    pub fn set_compression(&mut self, enabled: bool) {
        self.compression = enabled;
    }

    /// Switch between the fresh and the invalidated directory family.
    pub fn set_use_invalidated(&mut self, use_invalidated: bool) {
        self.use_invalidated = use_invalidated;
    }

    #[must_use]
    pub fn use_invalidated(&self) -> bool {
        self.use_invalidated
    }

    /// Path of `variant` in the current family.
    #[must_use]
    pub fn cache_file_path(&self, variant: FileVariant) -> PathBuf {
        self.path(self.own(), self.use_invalidated, variant)
    }

    /// Whether the page this fragment depends on is cached. True without a
    /// parent.
    #[must_use]
    pub fn parent_cached(&self) -> bool {
        self.chain.get(1).is_none_or(|parent| self.link_has_cache(parent))
    }

    /// Whether the page this fragment depends on is past `ttl`. False without
    /// a parent.
    #[must_use]
    pub fn parent_expired(&self, ttl: u64) -> bool {
        self.chain
            .get(1)
            .is_some_and(|parent| self.link_has_expired(parent, ttl, None))
    }

    /// Whether a servable file exists for this entry and its parent.
    ///
    /// In the invalidated family a fresh file is converted to stale first.
    #[must_use]
    pub fn has_cache(&self) -> bool {
        self.chain.iter().rev().all(|link| self.link_has_cache(link))
    }

    /// Whether this entry or its parent is past `ttl`, past its explicit
    /// expiry, or carries a revision other than `revision`.
    ///
    /// Anything unreadable counts as expired.
    #[must_use]
    pub fn has_expired(&self, ttl: u64, revision: Option<&str>) -> bool {
        self.chain
            .iter()
            .rev()
            .any(|link| self.link_has_expired(link, ttl, revision))
    }

    /// Seconds until the entry (or its parent, when it has one) expires.
    #[must_use]
    pub fn remaining_ttl(&self, ttl: u64) -> u64 {
        if self.use_invalidated {
            return 0;
        }
        let link = self.chain.last().unwrap_or_else(|| self.own());
        let path = self.path(link, false, FileVariant::Fresh);
        let headers = match self.storage.read_document(&path) {
            Ok(document) => document.headers,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "No remaining TTL");
                return 0;
            }
        };

        let expires_at = if let Some(expires) = positive(&headers, EXPIRES_HEADER) {
            expires
        } else if let Some(ctime) = positive(&headers, CTIME_HEADER) {
            ctime + ttl
        } else {
            self.storage.mtime(&path).unwrap_or(0) + ttl
        };
        expires_at.saturating_sub(self.clock.now())
    }

    /// Store `body` with `headers` in the current family and refresh the gzip
    /// sibling.
    ///
    /// The file time is set to `x-cache-ctime` when present so expiry counts
    /// from content creation.
    pub fn set_content(&self, body: &[u8], headers: HeaderBlock) -> Result<(), PageCacheError> {
        let path = self.cache_file_path(FileVariant::Fresh);
        let document = CacheDocument::new(headers, body);
        self.storage.write_document(&path, &document)?;
        self.touch_to_ctime(&path, &document.headers)?;
        self.compress(self.own(), self.use_invalidated, FileVariant::Fresh)?;
        tracing::debug!(url = %self.url, path = %path.display(), "Stored page cache");
        Ok(())
    }

    /// Turn the fresh file of the invalidated family into the stale file.
    ///
    /// The body's state marker flips from FRESH to STALE, the file is renamed
    /// and the gzip sibling regenerated. Does nothing without a fresh file,
    /// so repeated calls leave the stale file as the first call made it.
    pub fn convert_to_stale(&self) -> Result<(), PageCacheError> {
        self.convert_link(self.own())
    }

    /// Read the file to serve for this entry.
    ///
    /// The gzip sibling is used only when compression is enabled, the client
    /// accepts gzip and no output was sent yet.
    pub fn read(&self, response: ResponseContext) -> Result<CacheDocument, PageCacheError> {
        let variant = if self.use_invalidated {
            self.convert_to_stale()?;
            FileVariant::Stale
        } else {
            FileVariant::Fresh
        };
        let variant = if self.compression && response.accepts_gzip && !response.output_started {
            variant.gzipped()
        } else {
            variant
        };
        Ok(self.storage.read_document(&self.cache_file_path(variant))?)
    }

    /// Delete every variant of this entry in the current family, and the
    /// directory once it is empty.
    pub fn delete_files(&self) -> Result<(), PageCacheError> {
        let link = self.own();
        for variant in [
            FileVariant::Fresh,
            FileVariant::FreshGz,
            FileVariant::Stale,
            FileVariant::StaleGz,
        ] {
            self.storage
                .delete(&self.path(link, self.use_invalidated, variant))?;
        }
        let dir = self.dir(link, self.use_invalidated);
        if self.storage.is_dir(&dir) && self.storage.is_empty_dir(&dir)? {
            self.storage.delete_dir(&dir)?;
        }
        Ok(())
    }

    fn own(&self) -> &Link {
        &self.chain[0]
    }

    fn dir(&self, link: &Link, invalidated: bool) -> PathBuf {
        url_dir(&self.data_dir, &link.page_url, invalidated, self.layout)
    }

    fn path(&self, link: &Link, invalidated: bool, variant: FileVariant) -> PathBuf {
        self.dir(link, invalidated)
            .join(format!("{}{}", link.file_name, variant.suffix()))
    }

    fn link_has_cache(&self, link: &Link) -> bool {
        if self.use_invalidated {
            if let Err(e) = self.convert_link(link) {
                tracing::debug!(url = %link.page_url, error = %e, "Stale conversion failed");
                return false;
            }
            self.storage.exists(&self.path(link, true, FileVariant::Stale))
        } else {
            self.storage.exists(&self.path(link, false, FileVariant::Fresh))
        }
    }

    fn link_has_expired(&self, link: &Link, ttl: u64, revision: Option<&str>) -> bool {
        let (path, mtime) = if self.use_invalidated {
            if let Err(e) = self.convert_link(link) {
                tracing::debug!(url = %link.page_url, error = %e, "Stale conversion failed");
                return true;
            }
            (
                self.path(link, true, FileVariant::Stale),
                self.storage.mtime(&self.dir(link, true)),
            )
        } else {
            let path = self.path(link, false, FileVariant::Fresh);
            let mtime = self.storage.mtime(&path);
            (path, mtime)
        };

        let now = self.clock.now();
        if now.saturating_sub(mtime.unwrap_or(0)) >= ttl {
            return true;
        }

        let headers = match self.storage.read_document(&path) {
            Ok(document) => document.headers,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Unreadable cache file");
                return true;
            }
        };
        if positive(&headers, EXPIRES_HEADER).is_some_and(|expires| now > expires) {
            return true;
        }
        // The invalidated family is timed by its directory.
        if !self.use_invalidated
            && positive(&headers, CTIME_HEADER).is_some_and(|ctime| now.saturating_sub(ctime) > ttl)
        {
            return true;
        }
        if let Some(expected) = revision.filter(|r| !r.is_empty()) {
            let cached = headers.get(REVISION_HEADER).filter(|r| !r.is_empty());
            if cached != Some(expected) {
                return true;
            }
        }
        false
    }

    fn convert_link(&self, link: &Link) -> Result<(), PageCacheError> {
        let fresh = self.path(link, true, FileVariant::Fresh);
        if !self.storage.exists(&fresh) {
            return Ok(());
        }
        let stale = self.path(link, true, FileVariant::Stale);

        let mut document = self.storage.read_document(&fresh)?;
        mark_stale(&mut document.body);
        self.storage.write_document(&fresh, &document)?;
        self.storage.rename(&fresh, &stale)?;
        self.storage
            .delete(&self.path(link, true, FileVariant::FreshGz))?;
        self.compress(link, true, FileVariant::Stale)?;
        tracing::debug!(path = %stale.display(), "Converted page cache to stale");
        Ok(())
    }

    /// Write the gzip sibling of `variant` from the stored file.
    fn compress(&self, link: &Link, invalidated: bool, variant: FileVariant) -> Result<(), PageCacheError> {
        let mut document = self
            .storage
            .read_document(&self.path(link, invalidated, variant))?;
        document.headers.set("Content-Encoding", "gzip");

        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(GZIP_LEVEL));
        encoder.write_all(&document.body)?;
        document.body = encoder.finish()?;

        let gz_path = self.path(link, invalidated, variant.gzipped());
        self.storage.write_document(&gz_path, &document)?;
        self.touch_to_ctime(&gz_path, &document.headers)
    }

    fn touch_to_ctime(&self, path: &Path, headers: &HeaderBlock) -> Result<(), PageCacheError> {
        let time = positive(headers, CTIME_HEADER).unwrap_or_else(|| self.clock.now());
        self.storage.touch(path, Some(time))?;
        Ok(())
    }
}

fn positive(headers: &HeaderBlock, name: &str) -> Option<u64> {
    headers.get_u64(name).filter(|v| *v > 0)
}

fn mark_stale(body: &mut [u8]) {
    let mut start = 0;
    while let Some(offset) = body[start..]
        .windows(FRESH_MARKER.len())
        .position(|w| w == FRESH_MARKER)
    {
        let at = start + offset;
        body[at..at + STALE_MARKER.len()].copy_from_slice(STALE_MARKER);
        start = at + STALE_MARKER.len();
    }
}
