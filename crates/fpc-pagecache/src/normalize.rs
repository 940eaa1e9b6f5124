use std::collections::BTreeMap;

use fpc_config::Wildcard;
use url::Url;

use crate::PageCacheError;

/// Normalize a request URL.
///
/// Drops the fragment, removes query parameters whose name matches one of
/// `ignored_params` (anchored `*` patterns), and sorts the remaining
/// parameters by name. A repeated parameter keeps its last value. An empty
/// query is removed entirely.
pub fn normalize_url(raw: &str, ignored_params: &[String]) -> Result<String, PageCacheError> {
    let mut url = Url::parse(raw).map_err(|e| PageCacheError::InvalidUrl {
        url: raw.to_owned(),
        source: e,
    })?;
    url.set_fragment(None);

    if url.query().is_some() {
        let ignored: Vec<Wildcard> = ignored_params
            .iter()
            .filter_map(|p| match Wildcard::new(p) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "Skipping invalid ignored parameter");
                    None
                }
            })
            .collect();

        let params: BTreeMap<String, String> = url
            .query_pairs()
            .into_owned()
            .filter(|(name, _)| !ignored.iter().any(|w| w.is_match(name)))
            .collect();

        if params.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(&params);
        }
    }

    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ignored() -> Vec<String> {
        vec!["utm_*".to_owned(), "fbclid".to_owned()]
    }

    #[test]
    fn test_sorts_query_and_strips_ignored() {
        let url = normalize_url(
            "https://example.com/shop?b=2&utm_source=x&a=1&fbclid=abc",
            &ignored(),
        )
        .unwrap();

        assert_eq!(url, "https://example.com/shop?a=1&b=2");
    }

    #[test]
    fn test_query_removed_when_everything_ignored() {
        let url = normalize_url("https://example.com/?utm_medium=mail", &ignored()).unwrap();

        assert_eq!(url, "https://example.com/");
    }

    #[test]
    fn test_fragment_dropped_and_host_lowercased() {
        let url = normalize_url("HTTPS://Example.COM/Page#top", &[]).unwrap();

        assert_eq!(url, "https://example.com/Page");
    }

    #[test]
    fn test_repeated_parameter_keeps_last() {
        let url = normalize_url("https://example.com/?a=1&a=2", &[]).unwrap();

        assert_eq!(url, "https://example.com/?a=2");
    }

    #[test]
    fn test_equivalent_urls_normalize_identically() {
        let a = normalize_url("https://example.com/p?x=1&y=2&utm_id=3", &ignored()).unwrap();
        let b = normalize_url("https://example.com/p?y=2&x=1", &ignored()).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_url() {
        let err = normalize_url("not a url", &[]).unwrap_err();

        assert!(matches!(err, PageCacheError::InvalidUrl { .. }));
    }
}
