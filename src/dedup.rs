//! Durable record of article identities that have already been archived.
//!
//! The file backing is an append-only log, one `source_id<TAB>url` line per
//! identity. Appends only ever add lines, so two writers produce the union of
//! their marks; a duplicate line is harmless. Unreadable lines are skipped on
//! load, and an unterminated last line is closed before the next append.

use crate::errors::StoreError;
use crate::identity::ArticleIdentity;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

/// Membership set of processed articles.
pub trait DedupStore {
    async fn contains(&self, identity: &ArticleIdentity) -> Result<bool, StoreError>;

    /// Record every identity; already-present ones are a no-op.
    async fn mark_all(&mut self, identities: &[ArticleIdentity]) -> Result<(), StoreError>;

    async fn mark(&mut self, identity: &ArticleIdentity) -> Result<(), StoreError> {
        self.mark_all(std::slice::from_ref(identity)).await
    }
}

/// Append-log store on the local filesystem.
#[derive(Debug)]
pub struct FileDedupStore {
    path: PathBuf,
    seen: HashSet<ArticleIdentity>,
    torn_tail: bool,
}

impl FileDedupStore {
    /// Load the log at `path`, creating its directory if needed.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let unreachable = |source| StoreError::Unreachable {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(unreachable)?;
        }

        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(unreachable(e)),
        };

        let mut seen = HashSet::new();
        let mut skipped = 0usize;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match ArticleIdentity::from_line(line) {
                Some(identity) => {
                    seen.insert(identity);
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(skipped, "Ignored unreadable dedup log lines");
        }
        info!(entries = seen.len(), "Opened dedup store");

        Ok(Self {
            torn_tail: !text.is_empty() && !text.ends_with('\n'),
            path,
            seen,
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl DedupStore for FileDedupStore {
    async fn contains(&self, identity: &ArticleIdentity) -> Result<bool, StoreError> {
        Ok(self.seen.contains(identity))
    }

    #[instrument(level = "info", skip_all, fields(path = %self.path.display(), count = identities.len()))]
    async fn mark_all(&mut self, identities: &[ArticleIdentity]) -> Result<(), StoreError> {
        let mut fresh: Vec<&ArticleIdentity> = Vec::new();
        let mut batch = HashSet::new();
        for identity in identities {
            if !self.seen.contains(identity) && batch.insert(identity) {
                fresh.push(identity);
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }

        let mut lines = String::new();
        if self.torn_tail {
            lines.push('\n');
        }
        for identity in &fresh {
            lines.push_str(&identity.to_line());
            lines.push('\n');
        }

        let path = self.path.display().to_string();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::write_failed(&path, e))?;
        file.write_all(lines.as_bytes())
            .await
            .map_err(|e| StoreError::write_failed(&path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::write_failed(&path, e))?;

        self.torn_tail = false;
        let added = fresh.len();
        self.seen.extend(fresh.into_iter().cloned());
        info!(added, total = self.seen.len(), "Marked identities");
        Ok(())
    }
}

/// In-memory store for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    seen: HashSet<ArticleIdentity>,
    /// When set, every `mark_all` fails.
    pub fail_writes: bool,
}

#[cfg(test)]
impl MemoryDedupStore {
    pub fn with_entries(entries: impl IntoIterator<Item = ArticleIdentity>) -> Self {
        Self {
            seen: entries.into_iter().collect(),
            fail_writes: false,
        }
    }

    pub fn entries(&self) -> &HashSet<ArticleIdentity> {
        &self.seen
    }
}

#[cfg(test)]
impl DedupStore for MemoryDedupStore {
    async fn contains(&self, identity: &ArticleIdentity) -> Result<bool, StoreError> {
        Ok(self.seen.contains(identity))
    }

    async fn mark_all(&mut self, identities: &[ArticleIdentity]) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::write_failed("memory", "writes disabled"));
        }
        self.seen.extend(identities.iter().cloned());
        Ok(())
    }
}
