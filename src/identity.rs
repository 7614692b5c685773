//! Canonical article identity used as the deduplication key.
//!
//! Feeds hand out the same article under many URL spellings: `http` vs
//! `https`, upper-case hosts, `#comments` fragments, and a long tail of
//! campaign parameters. [`canonicalize_url`] folds those into one string.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use url::Url;

/// Query parameters dropped during canonicalization, in addition to every `utm_*` key.
static TRACKING_PARAMS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "fbclid",
        "gclid",
        "dclid",
        "msclkid",
        "yclid",
        "igshid",
        "mc_cid",
        "mc_eid",
        "_ga",
        "_gl",
        "ref",
        "ref_src",
        "cmpid",
        "icid",
        "ncid",
        "s_cid",
        "sc_cid",
        "__twitter_impression",
    ]
    .into_iter()
    .collect()
});

fn is_tracking_param(key: &str, extra: &[String]) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_")
        || TRACKING_PARAMS.contains(key.as_str())
        || extra.iter().any(|p| p.eq_ignore_ascii_case(&key))
}

/// Normalize an article URL for identity comparison.
///
/// Returns `None` for anything that is not an absolute http(s) URL.
pub fn canonicalize_url(raw: &str, extra_tracking: &[String]) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    match url.scheme() {
        "https" => {}
        "http" => url.set_scheme("https").ok()?,
        _ => return None,
    }
    url.host_str()?;
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k, extra_tracking))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(&kept);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Some(url.to_string())
}

/// The deduplication key: canonical URL scoped by source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArticleIdentity {
    pub source_id: String,
    pub url: String,
}

impl ArticleIdentity {
    pub fn from_url(source_id: &str, raw_url: &str, extra_tracking: &[String]) -> Option<Self> {
        canonicalize_url(raw_url, extra_tracking).map(|url| Self {
            source_id: source_id.to_string(),
            url,
        })
    }

    /// One-line form used by the dedup log.
    pub fn to_line(&self) -> String {
        format!("{}\t{}", self.source_id, self.url)
    }

    pub fn from_line(line: &str) -> Option<Self> {
        let (source_id, url) = line.trim_end_matches(['\r', '\n']).split_once('\t')?;
        if source_id.is_empty() || url.is_empty() {
            return None;
        }
        Some(Self {
            source_id: source_id.to_string(),
            url: url.to_string(),
        })
    }
}

impl fmt::Display for ArticleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_and_host_normalized() {
        assert_eq!(
            canonicalize_url("HTTP://WWW.Nature.COM/articles/d41586-025-01234-5", &[]).as_deref(),
            Some("https://www.nature.com/articles/d41586-025-01234-5")
        );
    }

    #[test]
    fn test_tracking_params_and_fragment_stripped() {
        let raw = "https://www.statnews.com/2025/05/06/story/?utm_source=rss&utm_medium=rss&page=2#comments";
        assert_eq!(
            canonicalize_url(raw, &[]).as_deref(),
            Some("https://www.statnews.com/2025/05/06/story?page=2")
        );
    }

    #[test]
    fn test_extra_tracking_params() {
        let extra = vec!["rss_id".to_string()];
        assert_eq!(
            canonicalize_url("https://example.org/a?rss_id=9&fbclid=x", &extra).as_deref(),
            Some("https://example.org/a")
        );
    }

    #[test]
    fn test_root_path_kept() {
        assert_eq!(
            canonicalize_url("https://example.org/", &[]).as_deref(),
            Some("https://example.org/")
        );
    }

    #[test]
    fn test_rejects_non_http() {
        assert_eq!(canonicalize_url("mailto:editor@example.org", &[]), None);
        assert_eq!(canonicalize_url("/relative/path", &[]), None);
        assert_eq!(canonicalize_url("", &[]), None);
    }

    #[test]
    fn test_equal_identity_for_variants() {
        let a = ArticleIdentity::from_url("stat", "http://statnews.com/x/?utm_campaign=a", &[]);
        let b = ArticleIdentity::from_url("stat", "https://STATNEWS.com/x#top", &[]);
        assert_eq!(a, b);
        let c = ArticleIdentity::from_url("other", "https://statnews.com/x", &[]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_line_format() {
        let id = ArticleIdentity::from_url("cell", "https://www.cell.com/cell/fulltext/S0092", &[])
            .unwrap();
        let line = id.to_line();
        assert_eq!(ArticleIdentity::from_line(&format!("{line}\n")), Some(id));
        assert_eq!(ArticleIdentity::from_line("garbage"), None);
        assert_eq!(ArticleIdentity::from_line("\thttps://x.org"), None);
    }
}
