use std::collections::BTreeMap;

use fpc_config::{ConfigError, Wildcard};

use crate::md5_hex;

const GEO_COOKIE_PREFIX: &str = "nitro_geot_";
const COOKIE_HASH_LEN: usize = 16;

/// Request state that takes part in the cache file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyContext {
    /// Request cookies by name.
    pub cookies: BTreeMap<String, String>,
    /// `PageCache.SupportedCookies` patterns.
    pub supported_cookies: Vec<String>,
    /// Allowed values per geo component. A `nitro_geot_<component>` cookie
    /// with any other value is keyed as the first allowed value.
    pub geo_variations: BTreeMap<String, Vec<String>>,
    /// Joined with `-` in front of the file name.
    pub custom_prefixes: Vec<String>,
}

fn compile_all(
    patterns: &[String],
    compile: fn(&str) -> Result<Wildcard, ConfigError>,
) -> Vec<Wildcard> {
    patterns
        .iter()
        .filter_map(|p| match compile(p) {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(pattern = %p, error = %e, "Skipping invalid cookie pattern");
                None
            }
        })
        .collect()
}

impl KeyContext {
    /// Cookies whose whole name matches a supported pattern.
    #[must_use]
    pub fn supported(&self) -> BTreeMap<String, String> {
        let patterns = compile_all(&self.supported_cookies, Wildcard::new);
        self.cookies
            .iter()
            .filter(|(name, _)| patterns.iter().any(|w| w.is_match(name)))
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect()
    }

    /// First 16 hex chars of the MD5 of the canonical `name=value;` string.
    ///
    /// Supported cookies are visited by name. Each one contributes a pair for
    /// every supported pattern found anywhere in its name.
    #[must_use]
    pub fn cookie_fingerprint(&self) -> String {
        let contained = compile_all(&self.supported_cookies, Wildcard::unanchored);
        let mut canonical = String::new();
        for (name, value) in &self.supported() {
            let value = self.geo_value(name, value);
            for _ in contained.iter().filter(|w| w.is_match(name)) {
                canonical.push_str(name);
                canonical.push('=');
                canonical.push_str(value);
                canonical.push(';');
            }
        }
        let mut hash = md5_hex(canonical);
        hash.truncate(COOKIE_HASH_LEN);
        hash
    }

    #[must_use]
    pub fn custom_prefix(&self) -> String {
        self.custom_prefixes.join("-")
    }

    fn geo_value<'a>(&'a self, name: &str, value: &'a str) -> &'a str {
        name.strip_prefix(GEO_COOKIE_PREFIX)
            .and_then(|component| self.geo_variations.get(component))
            .filter(|variations| !variations.iter().any(|v| v == value))
            .and_then(|variations| variations.first())
            .map_or(value, String::as_str)
    }
}

/// The parts of a cache file name, in file name order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    custom_prefix: String,
    ajax_hash: Option<String>,
    ssl: bool,
    cookie_hash: String,
}

impl CacheKey {
    /// Key for the normalized `url`.
    ///
    /// `ajax_fragment` marks an AJAX response stored beside its referring
    /// page; the file name then carries the hash of its own URL.
    #[must_use]
    pub fn derive(url: &str, ajax_fragment: bool, context: &KeyContext) -> Self {
        Self {
            custom_prefix: context.custom_prefix(),
            ajax_hash: ajax_fragment.then(|| md5_hex(url)),
            ssl: url.starts_with("https://"),
            cookie_hash: context.cookie_fingerprint(),
        }
    }

    #[must_use]
    pub fn cookie_hash(&self) -> &str {
        &self.cookie_hash
    }

    #[must_use]
    pub fn is_ssl(&self) -> bool {
        self.ssl
    }

    /// `[custom-][ajax-<hash>-][ssl-]<cookie hash>.html`
    #[must_use]
    pub fn file_name(&self) -> String {
        let mut name = String::new();
        if !self.custom_prefix.is_empty() {
            name.push_str(&self.custom_prefix);
            name.push('-');
        }
        if let Some(hash) = &self.ajax_hash {
            name.push_str("ajax-");
            name.push_str(hash);
            name.push('-');
        }
        if self.ssl {
            name.push_str("ssl-");
        }
        name.push_str(&self.cookie_hash);
        name.push_str(".html");
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn context(cookies: &[(&str, &str)], supported: &[&str]) -> KeyContext {
        KeyContext {
            cookies: cookies
                .iter()
                .map(|(n, v)| ((*n).to_owned(), (*v).to_owned()))
                .collect(),
            supported_cookies: supported.iter().map(|s| (*s).to_owned()).collect(),
            ..KeyContext::default()
        }
    }

    fn hash16(canonical: &str) -> String {
        md5_hex(canonical)[..16].to_owned()
    }

    #[test]
    fn test_fingerprint_uses_supported_cookies_only() {
        let ctx = context(&[("session", "abc"), ("wp-lang", "en")], &["wp-lang*"]);

        assert_eq!(ctx.cookie_fingerprint(), hash16("wp-lang=en;"));
    }

    #[test]
    fn test_fingerprint_without_cookies() {
        let ctx = context(&[], &["wp-lang*"]);

        assert_eq!(ctx.cookie_fingerprint(), hash16(""));
    }

    #[test]
    fn test_fingerprint_sorted_by_name() {
        let a = context(&[("b", "2"), ("a", "1")], &["*"]);

        assert_eq!(a.cookie_fingerprint(), hash16("a=1;b=2;"));
    }

    #[test]
    fn test_cookie_counted_once_per_matching_pattern() {
        let ctx = context(&[("wp-lang", "en")], &["wp-*", "lang"]);

        assert_eq!(ctx.cookie_fingerprint(), hash16("wp-lang=en;wp-lang=en;"));
    }

    #[test]
    fn test_geo_cookie_outside_variations_uses_first() {
        let mut ctx = context(
            &[("nitro_geot_country", "FR"), ("nitro_geot_city", "Paris")],
            &["nitro_geot_*"],
        );
        ctx.geo_variations
            .insert("country".to_owned(), vec!["US".to_owned(), "DE".to_owned()]);

        assert_eq!(
            ctx.cookie_fingerprint(),
            hash16("nitro_geot_city=Paris;nitro_geot_country=US;")
        );

        ctx.cookies
            .insert("nitro_geot_country".to_owned(), "DE".to_owned());
        assert_eq!(
            ctx.cookie_fingerprint(),
            hash16("nitro_geot_city=Paris;nitro_geot_country=DE;")
        );
    }

    #[test]
    fn test_file_name_segment_order() {
        let mut ctx = context(&[], &[]);
        ctx.custom_prefixes = vec!["amp".to_owned(), "v2".to_owned()];
        let url = "https://example.com/wp-json/cart";

        let key = CacheKey::derive(url, true, &ctx);

        assert_eq!(
            key.file_name(),
            format!("amp-v2-ajax-{}-ssl-{}.html", md5_hex(url), hash16(""))
        );
    }

    #[test]
    fn test_plain_http_page() {
        let key = CacheKey::derive("http://example.com/", false, &KeyContext::default());

        assert!(!key.is_ssl());
        assert_eq!(key.file_name(), format!("{}.html", hash16("")));
    }

    #[test]
    fn test_distinct_cookies_give_distinct_keys() {
        let en = context(&[("wp-lang", "en")], &["wp-lang"]);
        let de = context(&[("wp-lang", "de")], &["wp-lang"]);
        let url = "https://example.com/";

        assert_ne!(
            CacheKey::derive(url, false, &en).file_name(),
            CacheKey::derive(url, false, &de).file_name()
        );
        assert_eq!(
            CacheKey::derive(url, false, &en),
            CacheKey::derive(url, false, &en)
        );
    }
}
