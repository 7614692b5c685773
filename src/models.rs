//! Data models flowing through the pipeline.
//!
//! - [`Source`]: a validated feed to harvest
//! - [`ArticleCandidate`]: an item discovered on a listing, not yet summarized
//! - [`SummarizedArticle`]: a translated and summarized article, owned by the archive
//! - [`RunSummary`] / [`RunState`]: what one run did and how it ended
//! - [`RunClock`]: the injected notion of "now" for a run

use crate::identity::ArticleIdentity;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// A validated science-news source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// Unique, stable identifier (used in dedup keys).
    pub id: String,
    /// Human-readable name shown in rendered pages.
    pub name: String,
    /// Listing (feed) location.
    pub listing_url: Url,
    /// Coarse grouping, e.g. "News" or "Paper".
    pub category: String,
    /// CSS selector for the article body; when set, article pages are fetched.
    pub article_selector: Option<String>,
}

/// An article discovered on a listing page.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleCandidate {
    pub source_id: String,
    pub source_name: String,
    pub category: String,
    /// Absolute URL as published by the source.
    pub url: String,
    pub title_raw: String,
    /// Plain-text teaser from the listing; the default summarization input.
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
}

/// A translated, summarized article. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizedArticle {
    pub identity: ArticleIdentity,
    pub title_ko: String,
    pub summary_ko: String,
    pub title_en: String,
    pub summary_en: String,
    pub source_id: String,
    pub source_name: String,
    pub category: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub processed_at: DateTime<Utc>,
}

impl SummarizedArticle {
    /// Chronological key: publication time, falling back to processing time.
    pub fn sort_time(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.processed_at)
    }

    /// Date shown next to the article in rendered pages.
    pub fn display_date(&self) -> NaiveDate {
        self.sort_time().date_naive()
    }
}

/// The injected clock of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunClock {
    /// Day partition new articles are committed to.
    pub today: NaiveDate,
    /// Stamped as `processed_at` on every article of the run.
    pub now: DateTime<Utc>,
}

impl RunClock {
    pub fn new(today: NaiveDate, now: DateTime<Utc>) -> Self {
        Self { today, now }
    }
}

/// Outcome of one archive commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitResult {
    pub day: NaiveDate,
    pub appended: usize,
    pub partition_total: usize,
}

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Extracting,
    Filtering,
    Summarizing,
    Archiving,
    Done,
    PartialFailure,
    Fatal,
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub sources_attempted: usize,
    pub sources_failed: usize,
    pub zero_yield_sources: usize,
    pub candidates_found: usize,
    pub candidates_new: usize,
    pub summarized_ok: usize,
    pub summarized_failed: usize,
    pub committed: usize,
    pub quota_used: usize,
    pub quota_halted: bool,
    pub timed_out: bool,
    /// Counters per source id, for every attempted source.
    pub per_source: BTreeMap<String, SourceTally>,
}

/// What one source contributed to a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceTally {
    /// Candidates extracted from the listing.
    pub found: usize,
    /// Candidates not seen before, counted before the per-run cap.
    pub new: usize,
    /// Articles summarized successfully.
    pub ok: usize,
}

impl RunSummary {
    /// Tally of `source_id`, created on first use.
    pub fn source(&mut self, source_id: &str) -> &mut SourceTally {
        self.per_source.entry(source_id.to_string()).or_default()
    }

    /// Anything that reduced output without corrupting it.
    pub fn degraded(&self) -> bool {
        self.sources_failed > 0
            || self.zero_yield_sources > 0
            || self.summarized_failed > 0
            || self.quota_halted
            || self.timed_out
    }
}
