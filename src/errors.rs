//! Error taxonomy for every stage of the digest pipeline.
//!
//! Per-item errors ([`FetchError`], [`SummarizeError`]) and the extractor's
//! [`ExtractWarning`] degrade a run; [`StoreError`] and [`ConfigError`] abort it.

use std::time::Duration;
use thiserror::Error;

/// Failure retrieving a listing or article page.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network, DNS or timeout failure.
    #[error("source unreachable: {0}")]
    Unreachable(String),
    /// The server answered with a non-2xx status.
    #[error("http status {status}")]
    HttpError { status: u16 },
    /// The body is not something we know how to parse.
    #[error("unexpected content type: {content_type}")]
    Malformed { content_type: String },
}

impl FetchError {
    /// Unreachable and 5xx are worth another attempt; 4xx means the source changed or blocked us.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Unreachable(_) => true,
            FetchError::HttpError { status } => *status >= 500,
            FetchError::Malformed { .. } => false,
        }
    }
}

/// Non-fatal findings while extracting candidates from a listing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractWarning {
    #[error("listing yielded zero candidates")]
    ZeroYield,
    #[error("listing could not be parsed: {0}")]
    Unparseable(String),
}

/// Failure turning one article into a Korean summary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SummarizeError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient summarizer failure: {0}")]
    Transient(String),
    #[error("invalid summarizer response: {0}")]
    InvalidResponse(String),
    #[error("summarizer quota exhausted")]
    QuotaExhausted,
    #[error("summarizer rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

impl SummarizeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SummarizeError::RateLimited { .. } | SummarizeError::Transient(_)
        )
    }

    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            SummarizeError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Failure of the durable stores (dedup log, archive partitions, views).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable at {path}: {source}")]
    Unreachable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write failed at {path}: {reason}")]
    WriteFailed { path: String, reason: String },
}

impl StoreError {
    pub fn write_failed(path: impl Into<String>, reason: impl ToString) -> Self {
        StoreError::WriteFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Start-up configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("credential missing: set {var} in the environment")]
    MissingCredential { var: String },
    #[error("invalid source `{id}`: {reason}")]
    InvalidSource { id: String, reason: String },
    #[error("config file {path} unreadable: {reason}")]
    Unreadable { path: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_retry_classification() {
        assert!(FetchError::Unreachable("dns".into()).is_retryable());
        assert!(FetchError::HttpError { status: 503 }.is_retryable());
        assert!(!FetchError::HttpError { status: 404 }.is_retryable());
        assert!(!FetchError::HttpError { status: 403 }.is_retryable());
        assert!(
            !FetchError::Malformed {
                content_type: "application/pdf".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_summarize_retry_classification() {
        let hint = Duration::from_secs(7);
        let limited = SummarizeError::RateLimited {
            retry_after: Some(hint),
        };
        assert!(limited.is_retryable());
        assert_eq!(limited.retry_hint(), Some(hint));
        assert!(SummarizeError::Transient("502".into()).is_retryable());
        assert!(!SummarizeError::InvalidResponse("empty".into()).is_retryable());
        assert!(!SummarizeError::QuotaExhausted.is_retryable());
        assert_eq!(SummarizeError::QuotaExhausted.retry_hint(), None);
    }
}
