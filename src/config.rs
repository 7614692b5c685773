//! Pipeline configuration: sources, retry/concurrency knobs, and the credential.
//!
//! Settings come from an optional YAML file; every field has a default, and
//! without a file the built-in science feed list is used.
//!
//! ```yaml
//! sources:
//!   - id: nature-news
//!     name: Nature
//!     url: https://www.nature.com/nature/rss/articles?type=news
//!     category: News
//! summarizer:
//!   concurrency: 2
//!   quota_per_run: 50
//! ```

use crate::errors::ConfigError;
use crate::models::Source;
use crate::retry::RetryPolicy;
use itertools::Itertools;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument, warn};
use url::Url;

/// Environment variable carrying the summarizer credential.
pub const CREDENTIAL_ENV: &str = "GEMINI_API_KEY";

/// Raw source entry as written in the config file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SourceEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub article_selector: Option<String>,
}

fn default_category() -> String {
    "News".to_string()
}

impl SourceEntry {
    fn new(id: &str, name: &str, url: &str, category: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            category: category.to_string(),
            article_selector: None,
        }
    }
}

/// The feeds harvested when no config file overrides them.
pub fn default_sources() -> Vec<SourceEntry> {
    vec![
        SourceEntry::new("nature-news", "Nature", "https://www.nature.com/nature/rss/articles?type=news", "News"),
        SourceEntry::new("science-news", "Science", "https://www.science.org/rss/news_current.xml", "News"),
        SourceEntry::new("transmitter", "The Transmitter", "https://www.thetransmitter.org/feed/", "Neuroscience"),
        SourceEntry::new("science-paper", "Science (Paper)", "https://www.science.org/action/showFeed?type=etoc&feed=rss&jc=science", "Paper"),
        SourceEntry::new("cell", "Cell", "https://www.cell.com/cell/current.rss", "Paper"),
        SourceEntry::new("nature-neuro", "Nature Neuroscience", "https://www.nature.com/neuro/current_issue/rss", "Paper"),
        SourceEntry::new("nature-medicine", "Nature Medicine", "https://www.nature.com/nm/current_issue/rss", "Paper"),
        SourceEntry::new("nature-drug-discovery", "Nature Drug Discovery", "https://www.nature.com/nrd/current_issue/rss", "Paper"),
        SourceEntry::new("nature-biotech", "Nature Biotechnology", "https://www.nature.com/nbt/current_issue/rss", "Paper"),
        SourceEntry::new("nature-news-comment", "Nature (News & Comment)", "https://www.nature.com/nature/rss/newsandcomment", "News"),
        SourceEntry::new("nature-paper", "Nature (Paper)", "https://www.nature.com/nature/research-articles.rss", "Paper"),
        SourceEntry::new("stat", "STAT News", "https://www.statnews.com/feed/", "News"),
        SourceEntry::new("the-scientist", "The Scientist", "https://www.the-scientist.com/rss", "News"),
        SourceEntry::new("ars-science", "Ars Technica", "https://arstechnica.com/science/feed/", "News"),
        SourceEntry::new("wired-science", "Wired", "https://www.wired.com/feed/category/science/latest/rss", "News"),
        SourceEntry::new("neuroscience-news", "Neuroscience News", "https://neurosciencenews.com/feed/", "News"),
        SourceEntry::new("fda-drugs", "FDA", "https://www.fda.gov/about-fda/contact-fda/stay-informed/rss-feeds/drugs/rss.xml", "News"),
        SourceEntry::new("fierce-biotech", "Fierce Biotech", "https://www.fiercebiotech.com/rss/xml", "News"),
        SourceEntry::new("endpoints", "Endpoints News", "https://endpts.com/feed/", "News"),
        SourceEntry::new("nejm", "NEJM", "https://www.nejm.org/action/showFeed?jc=nejm&type=etoc&feed=rss", "Paper"),
        SourceEntry::new("jama", "JAMA", "https://jamanetwork.com/rss/latest.xml", "Paper"),
    ]
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FetchSettings {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_secs: u64,
    pub concurrency: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            timeout_secs: 20,
            concurrency: 4,
        }
    }
}

impl FetchSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries + 1,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SummarizerSettings {
    pub api_base: String,
    pub model: String,
    /// Total attempts per article, including the first.
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub concurrency: usize,
    /// Backend calls allowed in one run; `None` means only the service limits apply.
    pub quota_per_run: Option<usize>,
    /// Translated titles longer than this many characters are cut.
    pub max_title_chars: usize,
    /// Input text is capped at this many characters before prompting.
    pub max_input_chars: usize,
}

impl Default for SummarizerSettings {
    fn default() -> Self {
        Self {
            api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash".to_string(),
            max_attempts: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            request_timeout_secs: 120,
            concurrency: 2,
            quota_per_run: Some(50),
            max_title_chars: 120,
            max_input_chars: 6_000,
        }
    }
}

impl SummarizerSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    /// Concurrency never exceeds the per-run budget.
    pub fn effective_concurrency(&self) -> usize {
        let c = self.concurrency.max(1);
        match self.quota_per_run {
            Some(q) => c.min(q.max(1)),
            None => c,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunSettings {
    pub timeout_secs: u64,
    pub grace_secs: u64,
    /// New candidates handed to the summarizer per run; the rest wait for the next run.
    pub max_new_articles: usize,
    /// Size of the "latest" view.
    pub latest_count: usize,
    /// Extra query keys treated as tracking parameters.
    pub extra_tracking_params: Vec<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 900,
            grace_secs: 30,
            max_new_articles: 50,
            latest_count: 30,
            extra_tracking_params: Vec::new(),
        }
    }
}

impl RunSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Full configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub sources: Vec<SourceEntry>,
    pub fetch: FetchSettings,
    pub summarizer: SummarizerSettings,
    pub run: RunSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            fetch: FetchSettings::default(),
            summarizer: SummarizerSettings::default(),
            run: RunSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Load from `path`, or fall back to defaults when no path is given.
    #[instrument(level = "info")]
    pub async fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            info!("No config file given; using built-in defaults");
            return Ok(Self::default());
        };
        let unreadable = |reason: String| ConfigError::Unreadable {
            path: path.to_string(),
            reason,
        };
        let text = tokio::fs::read_to_string(Path::new(path))
            .await
            .map_err(|e| unreadable(e.to_string()))?;
        let settings = Self::from_yaml(&text).map_err(|e| unreadable(e.to_string()))?;
        info!(path, sources = settings.sources.len(), "Loaded configuration");
        Ok(settings)
    }

    /// Validated sources; invalid entries are dropped with a warning.
    pub fn validated_sources(&self) -> Vec<Source> {
        validate_sources(&self.sources)
    }
}

fn validate_entry(entry: &SourceEntry, seen: &HashSet<String>) -> Result<Source, ConfigError> {
    let id = entry.id.trim();
    let invalid = |reason: &str| ConfigError::InvalidSource {
        id: entry.id.clone(),
        reason: reason.to_string(),
    };
    if id.is_empty() || id.chars().any(char::is_whitespace) {
        return Err(invalid("id must be non-empty and contain no whitespace"));
    }
    if seen.contains(id) {
        return Err(invalid("duplicate id"));
    }
    let url = entry.url.trim();
    if url.is_empty() {
        return Err(invalid("empty listing url"));
    }
    let listing_url = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(listing_url.scheme(), "http" | "https") {
        return Err(invalid("listing url must be http(s)"));
    }
    let name = match entry.name.trim() {
        "" => id.to_string(),
        n => n.to_string(),
    };
    let article_selector = entry
        .article_selector
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            scraper::Selector::parse(s)
                .map(|_| s.to_string())
                .map_err(|e| invalid(&format!("bad article selector: {e}")))
        })
        .transpose()?;

    Ok(Source {
        id: id.to_string(),
        name,
        listing_url,
        category: entry.category.trim().to_string(),
        article_selector,
    })
}

/// Keep well-formed sources with unique ids, in configured order.
pub fn validate_sources(entries: &[SourceEntry]) -> Vec<Source> {
    let mut seen = HashSet::new();
    let mut sources = Vec::with_capacity(entries.len());
    for entry in entries {
        match validate_entry(entry, &seen) {
            Ok(source) => {
                seen.insert(source.id.clone());
                sources.push(source);
            }
            Err(e) => warn!(error = %e, "Dropping invalid source"),
        }
    }
    info!(
        valid = sources.len(),
        dropped = entries.len() - sources.len(),
        ids = %sources.iter().map(|s| s.id.as_str()).join(","),
        "Validated sources"
    );
    sources
}

/// The summarizer credential. Debug output never shows the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Fails with [`ConfigError::MissingCredential`] when absent or blank.
    pub fn from_value(var: &str, value: Option<&str>) -> Result<Self, ConfigError> {
        match value.map(str::trim) {
            Some(v) if !v.is_empty() => Ok(Self(v.to_string())),
            _ => Err(ConfigError::MissingCredential {
                var: var.to_string(),
            }),
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_original_feeds() {
        let settings = Settings::default();
        assert_eq!(settings.sources.len(), 21);
        assert_eq!(settings.validated_sources().len(), 21);
        assert_eq!(settings.run.max_new_articles, 50);
        assert_eq!(settings.fetch.max_retries, 3);
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = r#"
sources:
  - id: stat
    name: STAT News
    url: https://www.statnews.com/feed/
summarizer:
  concurrency: 3
  max_title_chars: 80
run:
  latest_count: 10
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.sources.len(), 1);
        assert_eq!(settings.sources[0].category, "News");
        assert_eq!(settings.summarizer.concurrency, 3);
        assert_eq!(settings.summarizer.max_title_chars, 80);
        assert_eq!(settings.summarizer.model, "gemini-2.5-flash");
        assert_eq!(settings.run.latest_count, 10);
        assert_eq!(settings.run.grace_secs, 30);
    }

    #[test]
    fn test_invalid_sources_dropped() {
        let entries = vec![
            SourceEntry::new("ok", "Ok", "https://example.org/feed", "News"),
            SourceEntry::new("ok", "Dup", "https://example.org/other", "News"),
            SourceEntry::new("empty", "Empty", "  ", "News"),
            SourceEntry::new("ftp", "Ftp", "ftp://example.org/feed", "News"),
            SourceEntry::new("", "NoId", "https://example.org/x", "News"),
            SourceEntry::new("broken", "Broken", "not a url", "News"),
            SourceEntry {
                article_selector: Some("div[[".to_string()),
                ..SourceEntry::new("badsel", "BadSel", "https://example.org/y", "News")
            },
            SourceEntry::new("second", "", "https://example.org/z", "Paper"),
        ];
        let sources = validate_sources(&entries);
        let ids: Vec<&str> = sources.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["ok", "second"]);
        assert_eq!(sources[0].name, "Ok");
        assert_eq!(sources[1].name, "second");
    }

    #[test]
    fn test_concurrency_bounded_by_quota() {
        let settings = SummarizerSettings {
            concurrency: 8,
            quota_per_run: Some(3),
            ..Default::default()
        };
        assert_eq!(settings.effective_concurrency(), 3);
        let unlimited = SummarizerSettings {
            concurrency: 8,
            quota_per_run: None,
            ..Default::default()
        };
        assert_eq!(unlimited.effective_concurrency(), 8);
    }

    #[test]
    fn test_credential() {
        assert!(matches!(
            Credential::from_value(CREDENTIAL_ENV, None),
            Err(ConfigError::MissingCredential { .. })
        ));
        assert!(Credential::from_value(CREDENTIAL_ENV, Some("  ")).is_err());
        let cred = Credential::from_value(CREDENTIAL_ENV, Some("secret")).unwrap();
        assert_eq!(cred.expose(), "secret");
        assert_eq!(format!("{cred:?}"), "Credential(***)");
    }

    #[tokio::test]
    async fn test_load_missing_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.yaml");
        let err = Settings::load(Some(path.to_str().unwrap())).await.unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "run:\n  max_new_articles: 5\n").unwrap();
        let settings = Settings::load(Some(path.to_str().unwrap())).await.unwrap();
        assert_eq!(settings.run.max_new_articles, 5);
        assert_eq!(settings.sources.len(), 21);
    }
}
