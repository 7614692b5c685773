//! JSON projection of the "latest" view for API consumers.
//!
//! ```text
//! site_dir/latest.json
//! { "as_of": "2025-05-06", "count": 30, "articles": [ ... ] }
//! ```

use crate::models::SummarizedArticle;
use chrono::NaiveDate;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct LatestFeed<'a> {
    as_of: NaiveDate,
    count: usize,
    articles: &'a [&'a SummarizedArticle],
}

/// Pretty-printed, newline-terminated JSON of the latest articles.
pub fn latest_to_json(as_of: NaiveDate, articles: &[&SummarizedArticle]) -> String {
    let feed = LatestFeed {
        as_of,
        count: articles.len(),
        articles,
    };
    // Serializing plain data with string keys cannot fail.
    let mut json = serde_json::to_string_pretty(&feed).unwrap_or_default();
    json.push('\n');
    json
}
