//! Command-line interface definitions for the science digest.
//!
//! All arguments can be provided via command-line flags; the API key may also
//! come from the environment.

use chrono::NaiveDate;
use clap::Parser;

/// Command-line arguments for one harvesting run.
///
/// # Examples
///
/// ```sh
/// # Harvest with the built-in source list
/// GEMINI_API_KEY=... sci_digest_ko -d ./data -o ./site
///
/// # Custom sources and settings
/// sci_digest_ko -c config.yaml -d ./data -o ./site
///
/// # Re-render the site from the archive without fetching anything
/// sci_digest_ko -d ./data -o ./site --rebuild-views
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to config.yaml file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Directory holding the archive and the dedup log
    #[arg(short, long, default_value = "data")]
    pub data_dir: String,

    /// Directory the rendered site is written to
    #[arg(short, long, default_value = "site")]
    pub output_dir: String,

    /// Run date (YYYY-MM-DD) used as the archive partition; defaults to the local date
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Only regenerate the rendered views from the archive
    #[arg(long)]
    pub rebuild_views: bool,

    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}
