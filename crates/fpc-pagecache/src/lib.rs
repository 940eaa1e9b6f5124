//! Page cache keys, directory layout and entries.
//!
//! A request maps to one cache file:
//!
//! ```text
//! <root>/<device>/<md5(url)>[_i]/<custom->[ajax-<md5(url)>-][ssl-]<cookie hash>.html[.stale][.gz]
//! ```
//!
//! - [`normalize_url`] strips ignored query parameters and sorts the rest
//! - [`CacheKey`] derives the file name from the request context
//! - [`url_dir`] derives the directory from the page URL and [`PathLayout`]
//! - [`PageCacheEntry`] owns freshness, stale conversion and the gzip sibling
//!
//! AJAX fragments live in the directory of the page that referred them and
//! are only servable while that page is cached.

mod device;
mod entry;
mod error;
mod key;
mod layout;
mod normalize;

pub use device::DeviceType;
pub use entry::{EntryOptions, FileVariant, PageCacheEntry, ResponseContext};
pub use error::PageCacheError;
pub use key::{CacheKey, KeyContext};
pub use layout::{PathLayout, PathVersion, url_dir};
pub use normalize::normalize_url;

/// Lowercase hex MD5 of `data`.
pub(crate) fn md5_hex(data: impl AsRef<[u8]>) -> String {
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(data.as_ref()))
}
