//! The durable, append-only archive of summarized articles.
//!
//! # Layout
//!
//! ```text
//! data_dir/archive/
//! ├── 2025-05-05.json
//! └── 2025-05-06.json   # DayPartition: every article committed that day
//! ```
//!
//! A commit only ever touches the partition of the injected run date, and the
//! partition file is replaced atomically, so a commit either fully lands or
//! not at all. Derived views are rebuilt from these files alone.

use crate::errors::StoreError;
use crate::identity::ArticleIdentity;
use crate::models::{CommitResult, SummarizedArticle};
use crate::outputs::{self, ViewSet};
use crate::utils::write_atomic;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, instrument, warn};

/// Every article committed on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayPartition {
    pub date: NaiveDate,
    pub articles: Vec<SummarizedArticle>,
}

/// Newest first by publication (falling back to processing) time, then by URL.
pub fn sort_articles(articles: &mut [SummarizedArticle]) {
    articles.sort_by(|a, b| {
        Reverse(a.sort_time())
            .cmp(&Reverse(b.sort_time()))
            .then_with(|| a.url.cmp(&b.url))
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
}

/// Owns the archive partitions and regenerates the rendered views.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    archive_dir: PathBuf,
    site_dir: PathBuf,
    latest_count: usize,
}

impl ArchiveBuilder {
    pub fn new(data_dir: impl AsRef<Path>, site_dir: impl AsRef<Path>, latest_count: usize) -> Self {
        Self {
            archive_dir: data_dir.as_ref().join("archive"),
            site_dir: site_dir.as_ref().to_path_buf(),
            latest_count,
        }
    }

    fn partition_path(&self, day: NaiveDate) -> PathBuf {
        self.archive_dir.join(format!("{}.json", day.format("%Y-%m-%d")))
    }

    fn unreachable(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Unreachable {
            path: path.display().to_string(),
            source,
        }
    }

    /// Articles of one day, empty when the partition does not exist yet.
    pub async fn load_partition(&self, day: NaiveDate) -> Result<Vec<SummarizedArticle>, StoreError> {
        let path = self.partition_path(day);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.unreachable(&path, e)),
        };
        let partition: DayPartition = serde_json::from_str(&text).map_err(|e| StoreError::Unreachable {
            path: path.display().to_string(),
            source: std::io::Error::new(ErrorKind::InvalidData, e),
        })?;
        Ok(partition.articles)
    }

    /// Dates with a partition file, ascending.
    pub async fn list_days(&self) -> Result<Vec<NaiveDate>, StoreError> {
        let mut entries = match fs::read_dir(&self.archive_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.unreachable(&self.archive_dir, e)),
        };
        let mut days = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.unreachable(&self.archive_dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            match name
                .strip_suffix(".json")
                .and_then(|stem| NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok())
            {
                Some(day) => days.push(day),
                None if name.starts_with('.') => {}
                None => warn!(file = %name, "Ignoring unexpected file in archive"),
            }
        }
        days.sort();
        Ok(days)
    }

    /// The whole archive keyed by day.
    pub async fn load_all(&self) -> Result<BTreeMap<NaiveDate, Vec<SummarizedArticle>>, StoreError> {
        let mut all = BTreeMap::new();
        for day in self.list_days().await? {
            all.insert(day, self.load_partition(day).await?);
        }
        Ok(all)
    }

    /// Every identity ever committed.
    pub async fn identities(&self) -> Result<Vec<ArticleIdentity>, StoreError> {
        Ok(self
            .load_all()
            .await?
            .into_values()
            .flatten()
            .map(|a| a.identity)
            .collect())
    }

    /// Durably append `batch` to the partition of `today`.
    #[instrument(level = "info", skip_all, fields(%today, batch = batch.len()))]
    pub async fn commit(&self, batch: Vec<SummarizedArticle>, today: NaiveDate) -> Result<CommitResult, StoreError> {
        let mut articles = self.load_partition(today).await?;
        let appended = batch.len();
        if appended == 0 {
            return Ok(CommitResult {
                day: today,
                appended,
                partition_total: articles.len(),
            });
        }
        articles.extend(batch);
        sort_articles(&mut articles);

        let partition = DayPartition {
            date: today,
            articles,
        };
        let path = self.partition_path(today);
        let json = serde_json::to_vec_pretty(&partition)
            .map_err(|e| StoreError::write_failed(path.display().to_string(), e))?;
        write_atomic(&path, &json)
            .await
            .map_err(|e| StoreError::write_failed(path.display().to_string(), e))?;

        info!(path = %path.display(), appended, total = partition.articles.len(), "Committed archive partition");
        Ok(CommitResult {
            day: today,
            appended,
            partition_total: partition.articles.len(),
        })
    }

    /// Render every derived view from the archive alone.
    pub async fn render_views(&self, today: NaiveDate) -> Result<ViewSet, StoreError> {
        let partitions = self.load_all().await?;
        Ok(outputs::render_views(&partitions, today, self.latest_count))
    }

    /// Regenerate the site directory; idempotent and byte-stable for a given archive and date.
    #[instrument(level = "info", skip_all, fields(%today, site = %self.site_dir.display()))]
    pub async fn rebuild_views(&self, today: NaiveDate) -> Result<usize, StoreError> {
        let views = self.render_views(today).await?;
        for (relative, contents) in &views.files {
            let path = self.site_dir.join(relative);
            write_atomic(&path, contents.as_bytes())
                .await
                .map_err(|e| StoreError::write_failed(path.display().to_string(), e))?;
        }
        info!(files = views.files.len(), "Rebuilt views");
        Ok(views.files.len())
    }
}
