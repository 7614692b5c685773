//! Derived views rendered from the archive.
//!
//! Rendering is a pure function of the archive contents and the run date, so
//! rebuilding twice yields byte-identical files.
//!
//! # Submodules
//!
//! - [`markdown`]: article, per-day, "today" and "latest" documents
//! - [`indexes`]: the archive index and mdBook `SUMMARY.md`
//! - [`json`]: `latest.json` for API consumers
//!
//! # Output Structure
//!
//! ```text
//! site_dir/
//! ├── today.md
//! ├── latest.md
//! ├── latest.json
//! ├── index.md
//! ├── SUMMARY.md
//! └── days/
//!     └── 2025-05-06.md
//! ```

pub mod indexes;
pub mod json;
pub mod markdown;

use crate::archive::sort_articles;
use crate::models::SummarizedArticle;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Rendered documents keyed by their path relative to the site root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewSet {
    pub files: Vec<(PathBuf, String)>,
}

impl ViewSet {
    fn push(&mut self, relative: impl Into<PathBuf>, contents: String) {
        self.files.push((relative.into(), contents));
    }

    #[cfg(test)]
    pub fn get(&self, relative: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|(path, _)| path.as_path() == std::path::Path::new(relative))
            .map(|(_, contents)| contents.as_str())
    }
}

/// Render every view from the day partitions.
pub fn render_views(
    partitions: &BTreeMap<NaiveDate, Vec<SummarizedArticle>>,
    today: NaiveDate,
    latest_count: usize,
) -> ViewSet {
    let mut views = ViewSet::default();
    let mut days = Vec::with_capacity(partitions.len());

    for (date, articles) in partitions {
        let refs: Vec<&SummarizedArticle> = articles.iter().collect();
        views.push(indexes::day_document_name(*date), markdown::day_to_markdown(*date, &refs));
        days.push((*date, articles.len()));
    }

    let today_articles: Vec<&SummarizedArticle> = partitions
        .get(&today)
        .map(|articles| articles.iter().collect())
        .unwrap_or_default();
    views.push("today.md", markdown::today_to_markdown(today, &today_articles));

    let mut all: Vec<SummarizedArticle> = partitions.values().flatten().cloned().collect();
    sort_articles(&mut all);
    let latest: Vec<&SummarizedArticle> = all.iter().take(latest_count).collect();
    views.push("latest.md", markdown::latest_to_markdown(&latest));
    views.push("latest.json", json::latest_to_json(today, &latest));

    views.push("index.md", indexes::index_to_markdown(&days));
    views.push("SUMMARY.md", indexes::summary_to_markdown(&days));
    views
}
