//! Listing and article page retrieval.
//!
//! - [`Fetch`]: one GET, errors normalized into [`FetchError`]
//! - [`HttpFetcher`]: the `reqwest` implementation
//! - [`RetryFetch`]: decorator adding the shared [`RetryPolicy`] to any [`Fetch`]
//!
//! Only `Unreachable` and 5xx failures are retried; a 4xx means the source
//! moved or blocked us, and retrying will not help.

use crate::errors::FetchError;
use crate::retry::{RetryDecision, RetryPolicy};
use reqwest::header::{self, HeaderMap, HeaderValue};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36";
const ACCEPT: &str = "application/xml,application/rss+xml,text/xml;q=0.9,text/html;q=0.8,*/*;q=0.5";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9,ko;q=0.8";

/// Anything that can GET a page body.
pub trait Fetch {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// Reject bodies we cannot parse as a feed or a web page.
///
/// An absent content type is accepted; plenty of feeds omit it.
pub fn check_content_type(content_type: &str) -> Result<(), FetchError> {
    let ct = content_type.to_ascii_lowercase();
    if ct.is_empty() || ["xml", "rss", "atom", "html"].iter().any(|k| ct.contains(k)) {
        Ok(())
    } else {
        Err(FetchError::Malformed {
            content_type: content_type.to_string(),
        })
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT));
    headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

/// Single-attempt HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .default_headers(default_headers())
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let t0 = Instant::now();
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpError {
                status: status.as_u16(),
            });
        }

        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        check_content_type(&content_type)?;

        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;
        debug!(
            bytes = body.len(),
            %content_type,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Fetched page"
        );
        Ok(body)
    }
}

/// Adds bounded retries with exponential backoff to any [`Fetch`].
pub struct RetryFetch<F> {
    inner: F,
    policy: RetryPolicy,
}

impl<F> RetryFetch<F> {
    pub fn new(inner: F, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<F> fmt::Debug for RetryFetch<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryFetch")
            .field("policy", &self.policy)
            .finish()
    }
}

impl<F: Fetch> Fetch for RetryFetch<F> {
    #[instrument(level = "info", skip(self))]
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let res = self
            .policy
            .run(
                url,
                |_| self.inner.fetch(url),
                |e: &FetchError| {
                    if e.is_retryable() {
                        RetryDecision::Retry { hint: None }
                    } else {
                        RetryDecision::GiveUp
                    }
                },
            )
            .await;
        match &res {
            Ok(body) => info!(bytes = body.len(), "Fetch succeeded"),
            Err(e) => warn!(error = %e, "Fetch failed"),
        }
        res
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};

    /// Scripted fetcher: each URL answers with queued responses, the last one repeating.
    #[derive(Default)]
    pub(crate) struct ScriptedFetch {
        responses: RefCell<HashMap<String, VecDeque<Result<String, u16>>>>,
        pub(crate) calls: RefCell<Vec<String>>,
    }

    impl ScriptedFetch {
        pub(crate) fn ok(self, url: &str, body: &str) -> Self {
            self.push(url, Ok(body.to_string()))
        }

        /// Status 0 stands for an unreachable host.
        pub(crate) fn fail(self, url: &str, status: u16) -> Self {
            self.push(url, Err(status))
        }

        fn push(self, url: &str, response: Result<String, u16>) -> Self {
            self.responses
                .borrow_mut()
                .entry(url.to_string())
                .or_default()
                .push_back(response);
            self
        }

        pub(crate) fn call_count(&self, url: &str) -> usize {
            self.calls.borrow().iter().filter(|u| *u == url).count()
        }
    }

    impl Fetch for ScriptedFetch {
        async fn fetch(&self, url: &str) -> Result<String, FetchError> {
            self.calls.borrow_mut().push(url.to_string());
            let mut responses = self.responses.borrow_mut();
            let queue = responses
                .get_mut(url)
                .ok_or_else(|| FetchError::Unreachable(format!("no route to {url}")))?;
            let next = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            match next {
                Some(Ok(body)) => Ok(body),
                Some(Err(0)) | None => Err(FetchError::Unreachable("connection refused".into())),
                Some(Err(status)) => Err(FetchError::HttpError { status }),
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(1), Duration::from_millis(2))
            .with_jitter(Duration::ZERO)
    }

    #[test]
    fn test_content_type_check() {
        assert!(check_content_type("application/rss+xml; charset=utf-8").is_ok());
        assert!(check_content_type("text/html").is_ok());
        assert!(check_content_type("application/atom+xml").is_ok());
        assert!(check_content_type("").is_ok());
        assert!(matches!(
            check_content_type("application/json"),
            Err(FetchError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let url = "https://example.org/feed";
        let fetch = RetryFetch::new(
            ScriptedFetch::default()
                .fail(url, 503)
                .fail(url, 0)
                .ok(url, "<rss/>"),
            fast_policy(),
        );
        assert_eq!(fetch.fetch(url).await.unwrap(), "<rss/>");
        assert_eq!(fetch.inner.call_count(url), 3);
    }

    #[tokio::test]
    async fn test_client_errors_not_retried() {
        let url = "https://example.org/gone";
        let fetch = RetryFetch::new(ScriptedFetch::default().fail(url, 404), fast_policy());
        let err = fetch.fetch(url).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpError { status: 404 }));
        assert_eq!(fetch.inner.call_count(url), 1);
    }

    #[tokio::test]
    async fn test_exhausts_retries() {
        let url = "https://example.org/down";
        let fetch = RetryFetch::new(ScriptedFetch::default().fail(url, 502), fast_policy());
        assert!(fetch.fetch(url).await.is_err());
        assert_eq!(fetch.inner.call_count(url), 4);
    }
}
