//! Full-page cache for one site.
//!
//! [`SiteCache`] ties the page cache files, the site config, the remote
//! service client and reverse proxies together:
//!
//! - [`SiteCache::session`] decides whether a request may be cached and
//!   serves it from local files or the service
//! - [`SiteCache::purge`] removes or invalidates pages everywhere
//! - [`PageCacheLock`] keeps remote lookups from writing while a purge moves
//!   directories
//!
//! # Example
//!
//! ```ignore
//! use fpc_core::{PurgeMode, PurgeRequest, RequestInfo};
//!
//! let mut session = site.session(RequestInfo::get("https://example.com/"))?;
//! if session.is_cache_allowed() && session.has_cache("default") {
//!     let page = session.read(false)?;
//! }
//!
//! site.purge(&PurgeRequest::urls(vec!["https://example.com/".to_owned()], PurgeMode::INVALIDATE))?;
//! ```

mod admission;
mod error;
mod lock;
mod purge;
mod revision;
mod session;
mod site;

pub use admission::{AdmissionPolicy, RequestInfo};
pub use error::CoreError;
pub use lock::{LOCK_EXPIRATION, PageCacheLock, PageCacheLockGuard};
pub use purge::{PurgeMode, PurgeReport, PurgeRequest};
pub use revision::ElementRevision;
pub use session::Session;
pub use site::{CACHE_DIR, SiteCache};

/// Lowercase hex MD5 of `data`.
pub(crate) fn md5_hex(data: impl AsRef<[u8]>) -> String {
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(data.as_ref()))
}
