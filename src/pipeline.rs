//! One harvesting run: fetch listings, extract candidates, drop what was seen
//! before, summarize the rest, commit them to the archive, then mark them.
//!
//! The dedup store is only marked after the archive write succeeded. A crash
//! between the two is healed by [`Orchestrator::reconcile`] at the start of
//! the next run, so an archived article is never summarized twice.

use crate::archive::ArchiveBuilder;
use crate::config::{RunSettings, Settings};
use crate::dedup::DedupStore;
use crate::errors::{ExtractWarning, FetchError, StoreError, SummarizeError};
use crate::extractor::{article_body_text, extract};
use crate::fetcher::Fetch;
use crate::identity::ArticleIdentity;
use crate::models::{ArticleCandidate, RunClock, RunState, RunSummary, Source, SummarizedArticle};
use crate::summarizer::{LlmBackend, SummarizerClient};
use futures::{StreamExt, stream};
use itertools::Itertools;
use std::collections::HashMap;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, instrument, warn};

/// How a run ended.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: RunState,
    pub summary: RunSummary,
    /// The store failure that made the run fatal, if any.
    pub error: Option<StoreError>,
}

impl RunOutcome {
    pub fn is_fatal(&self) -> bool {
        self.state == RunState::Fatal
    }
}

/// Drives a run over injected fetcher, dedup store, summarizer and archive.
pub struct Orchestrator<F, S, B> {
    fetcher: F,
    store: S,
    summarizer: SummarizerClient<B>,
    archive: ArchiveBuilder,
    sources: Vec<Source>,
    fetch_concurrency: usize,
    summarize_concurrency: usize,
    run: RunSettings,
    clock: RunClock,
    state: RunState,
}

impl<F: Fetch, S: DedupStore, B: LlmBackend> Orchestrator<F, S, B> {
    pub fn new(
        fetcher: F,
        store: S,
        summarizer: SummarizerClient<B>,
        archive: ArchiveBuilder,
        sources: Vec<Source>,
        settings: &Settings,
        clock: RunClock,
    ) -> Self {
        Self {
            fetcher,
            store,
            summarizer,
            archive,
            sources,
            fetch_concurrency: settings.fetch.concurrency.max(1),
            summarize_concurrency: settings.summarizer.effective_concurrency(),
            run: settings.run.clone(),
            clock,
            state: RunState::Idle,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[cfg(test)]
    pub fn into_store(self) -> S {
        self.store
    }

    fn enter(&mut self, next: RunState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "Run state changed");
            self.state = next;
        }
    }

    /// Mark archived identities the store does not know yet.
    #[instrument(level = "info", skip_all)]
    pub async fn reconcile(&mut self) -> Result<usize, StoreError> {
        let mut missing = Vec::new();
        for identity in self.archive.identities().await? {
            if !self.store.contains(&identity).await? {
                missing.push(identity);
            }
        }
        if !missing.is_empty() {
            warn!(count = missing.len(), "Archived articles missing from dedup store; marking them");
            self.store.mark_all(&missing).await?;
        }
        Ok(missing.len())
    }

    /// Execute one full run and report how it went.
    #[instrument(level = "info", skip_all, fields(today = %self.clock.today, sources = self.sources.len()))]
    pub async fn run(&mut self) -> RunOutcome {
        let t0 = std::time::Instant::now();
        let mut summary = RunSummary::default();
        let result = self.execute(&mut summary).await;

        summary.quota_used = self.summarizer.quota().used();
        summary.quota_halted = self.summarizer.quota().is_halted();

        let quota_starved =
            summary.quota_halted && summary.summarized_ok == 0 && summary.candidates_new > 0;
        let state = match &result {
            Err(e) => {
                error!(error = %e, "Run aborted");
                RunState::Fatal
            }
            Ok(()) if quota_starved => {
                error!("Quota exhausted before any article was produced");
                RunState::Fatal
            }
            Ok(()) if summary.degraded() || summary.timed_out => RunState::PartialFailure,
            Ok(()) => RunState::Done,
        };
        self.enter(state);
        info!(
            elapsed_ms = t0.elapsed().as_millis() as u64,
            state = ?state,
            sources_attempted = summary.sources_attempted,
            sources_failed = summary.sources_failed,
            candidates_found = summary.candidates_found,
            candidates_new = summary.candidates_new,
            summarized_ok = summary.summarized_ok,
            summarized_failed = summary.summarized_failed,
            committed = summary.committed,
            quota_used = summary.quota_used,
            quota_halted = summary.quota_halted,
            timed_out = summary.timed_out,
            "Run finished"
        );
        for (source, tally) in &summary.per_source {
            info!(source = %source, found = tally.found, new = tally.new, ok = tally.ok, "Source tally");
        }
        RunOutcome {
            state,
            summary,
            error: result.err(),
        }
    }

    async fn execute(&mut self, summary: &mut RunSummary) -> Result<(), StoreError> {
        let deadline = Instant::now() + self.run.timeout();
        let hard_stop = deadline + self.run.grace();

        self.reconcile().await?;

        self.enter(RunState::Fetching);
        let listings = self.fetch_listings(deadline, hard_stop, summary).await;

        self.enter(RunState::Extracting);
        let mut candidates = Vec::new();
        for (i, raw) in listings {
            let source = &self.sources[i];
            let extraction = extract(source, &raw);
            summary.source(&source.id).found = extraction.candidates.len();
            match &extraction.warning {
                Some(ExtractWarning::ZeroYield) => {
                    summary.zero_yield_sources += 1;
                    warn!(source = %source.id, "Listing yielded no articles");
                }
                Some(warning) => {
                    summary.zero_yield_sources += 1;
                    warn!(source = %source.id, warning = %warning, "Listing could not be read");
                }
                None => {}
            }
            if extraction.dropped > 0 {
                debug!(source = %source.id, dropped = extraction.dropped, "Dropped incomplete items");
            }
            candidates.extend(extraction.candidates);
        }
        summary.candidates_found = candidates.len();

        self.enter(RunState::Filtering);
        let mut fresh = self.filter_new(candidates).await?;
        summary.candidates_new = fresh.len();
        for (_, candidate) in &fresh {
            summary.source(&candidate.source_id).new += 1;
        }
        if fresh.len() > self.run.max_new_articles {
            info!(
                deferred = fresh.len() - self.run.max_new_articles,
                "Deferring new articles to the next run"
            );
            fresh.truncate(self.run.max_new_articles);
        }

        self.enter(RunState::Summarizing);
        let batch = self.summarize_all(fresh, deadline, hard_stop, summary).await;

        self.enter(RunState::Archiving);
        let identities: Vec<ArticleIdentity> = batch.iter().map(|a| a.identity.clone()).collect();
        let commit = self.archive.commit(batch, self.clock.today).await?;
        summary.committed = commit.appended;
        self.store.mark_all(&identities).await?;
        self.archive.rebuild_views(self.clock.today).await?;
        Ok(())
    }

    /// Listing bodies of the sources that answered, keyed by source position.
    async fn fetch_listings(
        &self,
        deadline: Instant,
        hard_stop: Instant,
        summary: &mut RunSummary,
    ) -> Vec<(usize, String)> {
        let fetcher = &self.fetcher;
        let tasks = self.sources.iter().enumerate().map(|(i, source)| {
            guarded(deadline, async move { (i, fetcher.fetch(source.listing_url.as_str()).await) })
        });
        summary.sources_attempted = self.sources.len();
        for source in &self.sources {
            summary.source(&source.id);
        }

        let mut results: Vec<(usize, Result<String, FetchError>)> = Vec::new();
        let timed_out = drain(
            stream::iter(tasks).buffer_unordered(self.fetch_concurrency),
            hard_stop,
            |item| match item {
                Some(result) => results.push(result),
                None => summary.timed_out = true,
            },
        )
        .await;
        summary.timed_out |= timed_out;

        results.sort_by_key(|(i, _)| *i);
        let mut answered = Vec::with_capacity(results.len());
        for (i, result) in results {
            match result {
                Ok(body) => answered.push((i, body)),
                Err(e) => {
                    summary.sources_failed += 1;
                    warn!(source = %self.sources[i].id, error = %e, "Skipping source");
                }
            }
        }
        answered
    }

    /// Candidates whose identity is new, one per identity, in discovery order.
    async fn filter_new(
        &self,
        candidates: Vec<ArticleCandidate>,
    ) -> Result<Vec<(ArticleIdentity, ArticleCandidate)>, StoreError> {
        let extra = &self.run.extra_tracking_params;
        let keyed = candidates
            .into_iter()
            .filter_map(|c| match ArticleIdentity::from_url(&c.source_id, &c.url, extra) {
                Some(identity) => Some((identity, c)),
                None => {
                    debug!(url = %c.url, "Dropping candidate without a usable URL");
                    None
                }
            })
            .unique_by(|(identity, _)| identity.clone());

        let mut fresh = Vec::new();
        for (identity, candidate) in keyed {
            if !self.store.contains(&identity).await? {
                fresh.push((identity, candidate));
            }
        }
        Ok(fresh)
    }

    async fn summarize_all(
        &self,
        fresh: Vec<(ArticleIdentity, ArticleCandidate)>,
        deadline: Instant,
        hard_stop: Instant,
        summary: &mut RunSummary,
    ) -> Vec<SummarizedArticle> {
        let selectors: HashMap<&str, &str> = self
            .sources
            .iter()
            .filter_map(|s| s.article_selector.as_deref().map(|sel| (s.id.as_str(), sel)))
            .collect();
        let fetcher = &self.fetcher;
        let summarizer = &self.summarizer;

        let tasks = fresh.into_iter().map(|(identity, candidate)| {
            let selector = selectors.get(candidate.source_id.as_str()).copied();
            guarded(deadline, async move {
                if summarizer.quota().is_halted() {
                    return Err(SummarizeError::QuotaExhausted);
                }
                let text = article_text(fetcher, selector, &candidate).await;
                summarizer.summarize(identity, &candidate, &text).await
            })
        });

        let mut batch = Vec::new();
        let timed_out = drain(
            stream::iter(tasks).buffer_unordered(self.summarize_concurrency),
            hard_stop,
            |item| match item {
                Some(Ok(article)) => {
                    summary.summarized_ok += 1;
                    summary.source(&article.source_id).ok += 1;
                    batch.push(article);
                }
                Some(Err(SummarizeError::QuotaExhausted)) => {
                    debug!("Article left for the next run: quota exhausted");
                }
                Some(Err(e)) => {
                    summary.summarized_failed += 1;
                    warn!(error = %e, "Article not summarized");
                }
                None => summary.timed_out = true,
            },
        )
        .await;
        summary.timed_out |= timed_out;
        batch
    }
}

/// Run `fut` unless the deadline already passed when it is first polled.
async fn guarded<T>(deadline: Instant, fut: impl Future<Output = T>) -> Option<T> {
    if Instant::now() >= deadline {
        return None;
    }
    Some(fut.await)
}

/// Feed every stream item to `sink` until the stream ends or `hard_stop`
/// passes; returns whether in-flight work was abandoned.
async fn drain<St, T>(stream: St, hard_stop: Instant, mut sink: impl FnMut(T)) -> bool
where
    St: futures::Stream<Item = T>,
{
    let mut stream = std::pin::pin!(stream);
    loop {
        match timeout_at(hard_stop, stream.next()).await {
            Ok(Some(item)) => sink(item),
            Ok(None) => return false,
            Err(_) => {
                warn!("Run timeout reached; abandoning in-flight work");
                return true;
            }
        }
    }
}

/// Summarization input: the article body when the source has a selector, else the listing description.
async fn article_text<F: Fetch>(fetcher: &F, selector: Option<&str>, candidate: &ArticleCandidate) -> String {
    if let Some(selector) = selector {
        match fetcher.fetch(&candidate.url).await {
            Ok(page) => match article_body_text(&page, selector) {
                Some(text) => return text,
                None => debug!(url = %candidate.url, selector, "Article selector matched nothing"),
            },
            Err(e) => debug!(url = %candidate.url, error = %e, "Article page unavailable"),
        }
    }
    candidate.description.clone()
}
