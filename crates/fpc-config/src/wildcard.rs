//! Shell-style `*` patterns used by URL lists, cookie rules and ignored
//! query parameters.

use regex::Regex;

use crate::ConfigError;

/// A pattern where `*` matches any run of characters and everything else is
/// literal. Matching is anchored at both ends unless built with
/// [`Wildcard::unanchored`].
#[derive(Debug, Clone)]
pub struct Wildcard {
    pattern: String,
    regex: Regex,
}

impl Wildcard {
    /// Compile a pattern.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        Self::compile(pattern, true)
    }

    /// Compile a pattern that matches anywhere inside the value.
    pub fn unanchored(pattern: &str) -> Result<Self, ConfigError> {
        Self::compile(pattern, false)
    }

    fn compile(pattern: &str, anchored: bool) -> Result<Self, ConfigError> {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*?");
        let source = if anchored { format!("^{body}$") } else { body };
        let regex = Regex::new(&source).map_err(|e| ConfigError::Pattern {
            pattern: pattern.to_owned(),
            source: e,
        })?;
        Ok(Self {
            pattern: pattern.to_owned(),
            regex,
        })
    }

    /// Compile a URL pattern. A leading `http://`, `https://` or `//` is
    /// replaced by `*` so the pattern matches either scheme.
    pub fn url(pattern: &str) -> Result<Self, ConfigError> {
        let stripped = ["https://", "http://", "//"]
            .iter()
            .find_map(|prefix| pattern.strip_prefix(prefix));
        match stripped {
            Some(rest) => Self::new(&format!("*{rest}")),
            None => Self::new(pattern),
        }
    }

    #[must_use]
    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

/// Compile every pattern with `compile` and report whether any matches.
pub fn any_match(
    patterns: &[String],
    value: &str,
    compile: fn(&str) -> Result<Wildcard, ConfigError>,
) -> bool {
    patterns.iter().any(|p| match compile(p) {
        Ok(w) => w.is_match(value),
        Err(e) => {
            tracing::warn!(pattern = %p, error = %e, "Skipping invalid pattern");
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_is_anchored() {
        let w = Wildcard::new("utm_source").unwrap();

        assert!(w.is_match("utm_source"));
        assert!(!w.is_match("xutm_source"));
        assert!(!w.is_match("utm_sourcex"));
    }

    #[test]
    fn test_star_matches_any_run() {
        let w = Wildcard::new("utm_*").unwrap();

        assert!(w.is_match("utm_"));
        assert!(w.is_match("utm_campaign"));
        assert!(!w.is_match("fbclid"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let w = Wildcard::new("a.b?c").unwrap();

        assert!(w.is_match("a.b?c"));
        assert!(!w.is_match("axb?c"));
        assert!(!w.is_match("a.bc"));
    }

    #[test]
    fn test_unanchored_matches_inside() {
        let w = Wildcard::unanchored("wp-lang").unwrap();

        assert!(w.is_match("wp-lang"));
        assert!(w.is_match("my-wp-lang-cookie"));
        assert!(!w.is_match("wp-settings"));
    }

    #[test]
    fn test_url_pattern_ignores_scheme() {
        let w = Wildcard::url("https://example.com/cart*").unwrap();

        assert!(w.is_match("http://example.com/cart"));
        assert!(w.is_match("https://example.com/cart/items"));
        assert!(!w.is_match("https://example.com/shop"));

        let w = Wildcard::url("//example.com/").unwrap();
        assert!(w.is_match("https://example.com/"));
    }

    #[test]
    fn test_any_match() {
        let patterns = vec!["wp-*".to_owned(), "session".to_owned()];

        assert!(any_match(&patterns, "wp-settings", Wildcard::new));
        assert!(any_match(&patterns, "session", Wildcard::new));
        assert!(!any_match(&patterns, "cart", Wildcard::new));
        assert!(!any_match(&[], "cart", Wildcard::new));
    }
}
