use std::path::{Path, PathBuf};

use crate::md5_hex;

/// Sequences replaced by `-` when building a version 1 or debug directory
/// name, applied in this order.
const UNSAFE_SEQUENCES: [&str; 10] = ["/", "?", ":", ";", "=", "&", ".", "--", "%", "~"];

const INVALIDATED_SUFFIX: &str = "_i";

/// Directory hashing scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PathVersion {
    /// MD5 of the URL after unsafe characters are replaced.
    #[default]
    V1,
    /// MD5 of the raw URL.
    V2,
}

impl PathVersion {
    /// Version from the site config's `URLPathVersion`. Unknown values fall
    /// back to version 1.
    #[must_use]
    pub fn from_config(version: Option<u8>) -> Self {
        match version {
            Some(2) => Self::V2,
            _ => Self::V1,
        }
    }
}

/// How URL directories are named.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathLayout {
    pub version: PathVersion,
    /// Use the readable sanitized URL instead of a hash.
    pub debug: bool,
}

fn sanitize(url: &str) -> String {
    UNSAFE_SEQUENCES
        .iter()
        .fold(url.to_owned(), |acc, seq| acc.replace(seq, "-"))
}

/// Directory holding every cache file of `url` under `base`.
///
/// The invalidated family lives in a sibling directory with an `_i` suffix.
#[must_use]
pub fn url_dir(base: &Path, url: &str, use_invalidated: bool, layout: PathLayout) -> PathBuf {
    let mut name = if layout.debug {
        sanitize(url)
    } else {
        match layout.version {
            PathVersion::V1 => md5_hex(sanitize(url)),
            PathVersion::V2 => md5_hex(url),
        }
    };
    if use_invalidated {
        name.push_str(INVALIDATED_SUFFIX);
    }
    base.join(name)
}
