//! # Korean Science Digest
//!
//! Harvests English-language science news feeds, translates and summarizes
//! new articles into Korean through the Gemini API, and keeps a durable,
//! day-partitioned archive rendered as Markdown and JSON.
//!
//! ## Usage
//!
//! ```sh
//! GEMINI_API_KEY=... sci_digest_ko -d ./data -o ./site
//! ```
//!
//! ## Architecture
//!
//! 1. **Fetching**: download every configured feed (bounded concurrency, retried)
//! 2. **Extracting**: parse RSS/RDF/Atom items into candidates
//! 3. **Filtering**: drop candidates whose identity is already archived
//! 4. **Summarizing**: translate and summarize through the LLM (quota-aware)
//! 5. **Archiving**: commit to today's partition, mark the dedup log, re-render the site
//!
//! Exit status is 0 unless the run was fatal (1) or the configuration was
//! unusable at start-up (2).

use chrono::{Local, Utc};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod archive;
mod cli;
mod config;
mod dedup;
mod errors;
mod extractor;
mod fetcher;
mod identity;
mod models;
mod outputs;
mod pipeline;
mod retry;
mod summarizer;
mod utils;

use archive::ArchiveBuilder;
use cli::Cli;
use config::{CREDENTIAL_ENV, Credential, Settings};
use dedup::FileDedupStore;
use fetcher::{HttpFetcher, RetryFetch};
use models::RunClock;
use pipeline::Orchestrator;
use summarizer::{GeminiBackend, SummarizerClient};
use utils::ensure_writable_dir;

const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
#[instrument]
async fn main() -> ExitCode {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("sci_digest_ko starting up");

    let args = Cli::parse();
    debug!(?args.config, %args.data_dir, %args.output_dir, ?args.date, "Parsed CLI arguments");

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Run failed");
            ExitCode::from(EXIT_FATAL)
        }
    };
    info!(elapsed_ms = start_time.elapsed().as_millis() as u64, "Finished");
    code
}

async fn run(args: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let settings = match Settings::load(args.config.as_deref()).await {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Configuration is unusable");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    let clock = RunClock::new(
        args.date.unwrap_or_else(|| Local::now().date_naive()),
        Utc::now(),
    );
    let archive = ArchiveBuilder::new(&args.data_dir, &args.output_dir, settings.run.latest_count);

    // Missing credential is reported before any network or storage work.
    let credential = if args.rebuild_views {
        None
    } else {
        match Credential::from_value(CREDENTIAL_ENV, args.api_key.as_deref()) {
            Ok(credential) => Some(credential),
            Err(e) => {
                error!(error = %e, "Cannot summarize without a credential");
                return Ok(ExitCode::from(EXIT_CONFIG));
            }
        }
    };

    if let Err(e) = ensure_writable_dir(Path::new(&args.output_dir)).await {
        error!(path = %args.output_dir, error = %e, "Output directory is not writable (fix perms or choose a different path)");
        return Ok(ExitCode::from(EXIT_CONFIG));
    }

    let Some(credential) = credential else {
        let written = archive.rebuild_views(clock.today).await?;
        info!(files = written, "Views rebuilt from archive");
        return Ok(ExitCode::SUCCESS);
    };

    let sources = settings.validated_sources();
    if sources.is_empty() {
        warn!("No valid sources configured; only the views will be refreshed");
    }

    if let Err(e) = ensure_writable_dir(Path::new(&args.data_dir)).await {
        error!(path = %args.data_dir, error = %e, "Data directory is not writable");
        return Ok(ExitCode::from(EXIT_CONFIG));
    }

    let fetcher = RetryFetch::new(HttpFetcher::new(settings.fetch.timeout())?, settings.fetch.retry_policy());
    let store = match FileDedupStore::open(Path::new(&args.data_dir).join("dedup").join("seen.log")).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Dedup store is unreachable");
            return Ok(ExitCode::from(EXIT_FATAL));
        }
    };
    let backend = GeminiBackend::new(&settings.summarizer, credential)?;
    let summarizer = SummarizerClient::new(backend, &settings.summarizer, clock.now);

    let mut orchestrator = Orchestrator::new(fetcher, store, summarizer, archive, sources, &settings, clock);
    let outcome = orchestrator.run().await;

    if let Some(e) = &outcome.error {
        error!(error = %e, "Run ended on a store failure");
    }
    match serde_json::to_string(&outcome.summary) {
        Ok(json) => info!(state = ?outcome.state, summary = %json, "Run summary"),
        Err(e) => warn!(error = %e, "Could not serialize run summary"),
    }
    Ok(if outcome.is_fatal() {
        ExitCode::from(EXIT_FATAL)
    } else {
        ExitCode::SUCCESS
    })
}
