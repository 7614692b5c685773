//! Korean translation and summarization through an LLM.
//!
//! # Architecture
//!
//! - [`LlmBackend`]: one raw generation call, errors classified as [`SummarizeError`]
//! - [`GeminiBackend`]: the Gemini `generateContent` REST implementation
//! - [`QuotaMeter`]: counts backend calls and latches once the quota is gone
//! - [`SummarizerClient`]: retries, quota accounting, response validation and
//!   deterministic title truncation around any backend
//!
//! Every backend attempt, including retries, consumes one quota unit.

use crate::config::{Credential, SummarizerSettings};
use crate::errors::SummarizeError;
use crate::extractor::normalize_whitespace;
use crate::identity::ArticleIdentity;
use crate::models::{ArticleCandidate, SummarizedArticle};
use crate::retry::{RetryDecision, RetryPolicy};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// A text-generation service.
pub trait LlmBackend {
    async fn generate(&self, prompt: &str) -> Result<String, SummarizeError>;
}

/// Prompt asking for a JSON object with `title_kr` and `summary_kr`.
pub fn build_prompt(title_en: &str, text_en: &str) -> String {
    format!(
        r#"당신은 전문 과학 뉴스 편집자입니다.
아래의 영어 기사 제목과 본문을 바탕으로 한국어 제목과 한국어 요약본을 작성해 주세요.
결과는 반드시 지정된 JSON 형식으로만 제공해야 합니다.

[입력]
- title_en: {title_en:?}
- text_en: {text_en:?}

[JSON 출력 형식]
{{"title_kr": "한국어 번역 제목", "summary_kr": "5-6 문장으로 구성된 상세한 한국어 요약"}}

[규칙]
1. "title_kr"에는 title_en을 자연스럽고 전문적인 한국어 제목으로 번역합니다.
2. "summary_kr"에는 text_en의 핵심 내용을 5-6 문장의 한국어로 요약합니다.
3. 친절한 말투가 아닌, 전문적이고 간결한 뉴스체로 작성합니다."#
    )
}

/// Keep at most `max` characters, cutting on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}

/// Single-line heading text: whitespace collapsed, leading Markdown markers removed.
fn heading_text(s: &str) -> String {
    normalize_whitespace(s)
        .trim_start_matches(['#', '>'])
        .trim_start()
        .to_string()
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[derive(Debug, Deserialize)]
struct SummaryPayload {
    #[serde(default)]
    title_kr: Option<String>,
    #[serde(default)]
    summary_kr: Option<String>,
}

/// Validate a model response into `(title_kr, summary_kr)`; the title may be empty.
pub fn parse_summary(raw: &str) -> Result<(String, String), SummarizeError> {
    let payload: SummaryPayload = serde_json::from_str(strip_code_fence(raw)).map_err(|e| {
        if matches!(e.classify(), serde_json::error::Category::Eof) {
            SummarizeError::InvalidResponse(format!("truncated JSON: {e}"))
        } else {
            SummarizeError::InvalidResponse(format!("malformed JSON: {e}"))
        }
    })?;
    let summary = payload.summary_kr.unwrap_or_default().trim().to_string();
    if summary.is_empty() {
        return Err(SummarizeError::InvalidResponse("empty summary".to_string()));
    }
    let title = payload.title_kr.unwrap_or_default().trim().to_string();
    Ok((title, summary))
}

/// Per-run consumption of the summarization quota.
#[derive(Debug, Default)]
pub struct QuotaMeter {
    budget: Option<usize>,
    used: AtomicUsize,
    halted: AtomicBool,
}

impl QuotaMeter {
    pub fn new(budget: Option<usize>) -> Self {
        Self {
            budget,
            ..Default::default()
        }
    }

    /// Claim one call, or fail once the budget is spent or the service said no.
    pub fn acquire(&self) -> Result<(), SummarizeError> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(SummarizeError::QuotaExhausted);
        }
        let claimed = self.used.fetch_add(1, Ordering::SeqCst);
        if self.budget.is_some_and(|b| claimed >= b) {
            self.used.fetch_sub(1, Ordering::SeqCst);
            self.halt();
            return Err(SummarizeError::QuotaExhausted);
        }
        Ok(())
    }

    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            warn!(used = self.used(), "Summarization quota exhausted; halting new calls");
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

/// Retrying, quota-aware summarizer around an [`LlmBackend`].
#[derive(Debug)]
pub struct SummarizerClient<B> {
    backend: B,
    policy: RetryPolicy,
    quota: QuotaMeter,
    max_title_chars: usize,
    max_input_chars: usize,
    processed_at: DateTime<Utc>,
}

impl<B: LlmBackend> SummarizerClient<B> {
    pub fn new(backend: B, settings: &SummarizerSettings, processed_at: DateTime<Utc>) -> Self {
        Self {
            backend,
            policy: settings.retry_policy(),
            quota: QuotaMeter::new(settings.quota_per_run),
            max_title_chars: settings.max_title_chars,
            max_input_chars: settings.max_input_chars,
            processed_at,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn quota(&self) -> &QuotaMeter {
        &self.quota
    }

    /// Translate and summarize one article.
    #[instrument(level = "info", skip_all, fields(source = %candidate.source_id, url = %candidate.url))]
    pub async fn summarize(
        &self,
        identity: ArticleIdentity,
        candidate: &ArticleCandidate,
        article_text: &str,
    ) -> Result<SummarizedArticle, SummarizeError> {
        let t0 = Instant::now();
        let text = truncate_chars(article_text, self.max_input_chars);
        let prompt = build_prompt(&candidate.title_raw, &text);

        let raw = self
            .policy
            .run(
                &candidate.url,
                |attempt| {
                    let prompt = &prompt;
                    async move {
                        self.quota.acquire()?;
                        debug!(attempt, "Calling summarizer backend");
                        let res = self.backend.generate(prompt).await;
                        if let Err(SummarizeError::QuotaExhausted) = &res {
                            self.quota.halt();
                        }
                        res
                    }
                },
                |e: &SummarizeError| {
                    if e.is_retryable() {
                        RetryDecision::Retry {
                            hint: e.retry_hint(),
                        }
                    } else {
                        RetryDecision::GiveUp
                    }
                },
            )
            .await?;

        let (title_ko, summary_ko) = parse_summary(&raw).inspect_err(|e| {
            warn!(error = %e, response_preview = %truncate_chars(&raw, 300), "Summarizer returned unusable content");
        })?;
        let title_ko = match heading_text(&title_ko) {
            t if t.is_empty() => truncate_chars(&candidate.title_raw, self.max_title_chars),
            t => truncate_chars(&t, self.max_title_chars),
        };

        info!(
            elapsed_ms = t0.elapsed().as_millis() as u64,
            quota_used = self.quota.used(),
            "Summarized article"
        );
        Ok(SummarizedArticle {
            identity,
            title_ko,
            summary_ko,
            title_en: candidate.title_raw.clone(),
            summary_en: candidate.description.clone(),
            source_id: candidate.source_id.clone(),
            source_name: candidate.source_name.clone(),
            category: candidate.category.clone(),
            url: candidate.url.clone(),
            image_url: candidate.image_url.clone(),
            published_at: candidate.published_at,
            processed_at: self.processed_at,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<GenerateCandidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct GenerateCandidate {
    #[serde(default)]
    content: Option<GenerateContent>,
}

#[derive(Debug, Deserialize)]
struct GenerateContent {
    #[serde(default)]
    parts: Vec<GeneratePart>,
}

#[derive(Debug, Deserialize)]
struct GeneratePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: ApiError,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<serde_json::Value>,
}

fn parse_delay(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().trim_end_matches('s').parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Response body as UTF-8; invalid bytes reject the answer instead of being replaced.
fn decode_body(bytes: &[u8]) -> Result<String, SummarizeError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| SummarizeError::InvalidResponse(format!("body is not UTF-8: {e}")))
}

/// Map a 429 answer onto `QuotaExhausted` (daily quota) or `RateLimited` (per-minute window).
pub fn classify_rate_limit(retry_after: Option<&str>, body: &str) -> SummarizeError {
    let lowered = body.to_ascii_lowercase();
    if lowered.contains("perday") || lowered.contains("per day") {
        return SummarizeError::QuotaExhausted;
    }
    let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
    let from_details = || {
        parsed
            .error
            .details
            .iter()
            .filter(|d| {
                d.get("@type")
                    .and_then(|t| t.as_str())
                    .is_some_and(|t| t.ends_with("RetryInfo"))
            })
            .find_map(|d| d.get("retryDelay").and_then(|v| v.as_str()).and_then(parse_delay))
    };
    SummarizeError::RateLimited {
        retry_after: retry_after.and_then(parse_delay).or_else(from_details),
    }
}

/// Classify a non-success HTTP answer.
pub fn classify_status(status: u16, retry_after: Option<&str>, body: &str) -> SummarizeError {
    match status {
        429 => classify_rate_limit(retry_after, body),
        408 | 500..=599 => SummarizeError::Transient(format!("status {status}")),
        _ => {
            let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
            SummarizeError::Rejected {
                status,
                message: parsed.error.message,
            }
        }
    }
}

/// Gemini `generateContent` client with JSON response mode.
#[derive(Debug)]
pub struct GeminiBackend {
    client: reqwest::Client,
    endpoint: String,
    credential: Credential,
}

impl GeminiBackend {
    pub fn new(settings: &SummarizerSettings, credential: Credential) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        let endpoint = format!(
            "{}/models/{}:generateContent",
            settings.api_base.trim_end_matches('/'),
            urlencoding::encode(&settings.model)
        );
        Ok(Self {
            client,
            endpoint,
            credential,
        })
    }
}

impl LlmBackend for GeminiBackend {
    #[instrument(level = "debug", skip_all)]
    async fn generate(&self, prompt: &str) -> Result<String, SummarizeError> {
        let t0 = Instant::now();
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseMimeType": "application/json", "temperature": 0.3 }
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", self.credential.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| SummarizeError::Transient(e.to_string()))?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SummarizeError::Transient(e.to_string()))?;

        if status != StatusCode::OK {
            let text = String::from_utf8_lossy(&bytes);
            let err = classify_status(status.as_u16(), retry_after.as_deref(), &text);
            warn!(
                status = status.as_u16(),
                elapsed_ms = t0.elapsed().as_millis() as u64,
                error = %err,
                "Gemini call failed"
            );
            return Err(err);
        }

        let text = decode_body(&bytes)?;
        let parsed: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| SummarizeError::InvalidResponse(format!("envelope: {e}")))?;
        if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(SummarizeError::InvalidResponse(format!("prompt blocked: {reason}")));
        }
        let output: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if output.trim().is_empty() {
            return Err(SummarizeError::InvalidResponse("no candidate text".to_string()));
        }
        debug!(elapsed_ms = t0.elapsed().as_millis() as u64, bytes = output.len(), "Gemini call succeeded");
        Ok(output)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    /// Backend answering from a closure over the prompt.
    pub(crate) struct FnBackend<F> {
        pub(crate) respond: F,
        pub(crate) calls: Cell<usize>,
    }

    impl<F> FnBackend<F>
    where
        F: Fn(&str) -> Result<String, SummarizeError>,
    {
        pub(crate) fn new(respond: F) -> Self {
            Self {
                respond,
                calls: Cell::new(0),
            }
        }
    }

    impl<F> LlmBackend for FnBackend<F>
    where
        F: Fn(&str) -> Result<String, SummarizeError>,
    {
        async fn generate(&self, prompt: &str) -> Result<String, SummarizeError> {
            self.calls.set(self.calls.get() + 1);
            (self.respond)(prompt)
        }
    }

    struct ScriptedBackend {
        responses: RefCell<VecDeque<Result<String, SummarizeError>>>,
        calls: Cell<usize>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<String, SummarizeError>>) -> Self {
            Self {
                responses: RefCell::new(responses.into()),
                calls: Cell::new(0),
            }
        }
    }

    impl LlmBackend for ScriptedBackend {
        async fn generate(&self, _prompt: &str) -> Result<String, SummarizeError> {
            self.calls.set(self.calls.get() + 1);
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(SummarizeError::Transient("script exhausted".into())))
        }
    }

    pub(crate) fn candidate(title: &str) -> ArticleCandidate {
        ArticleCandidate {
            source_id: "nature".to_string(),
            source_name: "Nature".to_string(),
            category: "News".to_string(),
            url: format!("https://www.nature.com/articles/{}", title.replace(' ', "-")),
            title_raw: title.to_string(),
            description: format!("About {title}."),
            published_at: None,
            image_url: None,
        }
    }

    fn identity(c: &ArticleCandidate) -> ArticleIdentity {
        ArticleIdentity::from_url(&c.source_id, &c.url, &[]).unwrap()
    }

    fn settings() -> SummarizerSettings {
        SummarizerSettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            quota_per_run: Some(10),
            max_title_chars: 10,
            ..Default::default()
        }
    }

    fn client<B: LlmBackend>(backend: B) -> SummarizerClient<B> {
        let now = Utc.with_ymd_and_hms(2025, 5, 6, 9, 0, 0).unwrap();
        SummarizerClient::new(backend, &settings(), now).with_policy(
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2))
                .with_jitter(Duration::ZERO),
        )
    }

    const GOOD: &str = r#"{"title_kr": "새 은하 발견", "summary_kr": "연구진이 새 은하를 발견했다."}"#;

    #[test]
    fn test_truncate_chars_is_char_boundary_safe() {
        assert_eq!(truncate_chars("한국어제목입니다", 3), "한국어");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("exact", 5), "exact");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_parse_summary() {
        assert_eq!(
            parse_summary(GOOD).unwrap(),
            ("새 은하 발견".to_string(), "연구진이 새 은하를 발견했다.".to_string())
        );
        let fenced = format!("```json\n{GOOD}\n```");
        assert!(parse_summary(&fenced).is_ok());
        assert!(matches!(
            parse_summary(r#"{"title_kr": "x", "summary_kr": "  "}"#),
            Err(SummarizeError::InvalidResponse(_))
        ));
        let truncated = parse_summary(r#"{"title_kr": "x", "summary_kr": "abc"#).unwrap_err();
        assert!(truncated.to_string().contains("truncated"));
    }

    #[test]
    fn test_classify_status() {
        let daily = r#"{"error":{"code":429,"message":"Quota exceeded for metric GenerateRequestsPerDayPerProjectPerModel-FreeTier","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(classify_status(429, None, daily), SummarizeError::QuotaExhausted);

        let minute = r#"{"error":{"code":429,"message":"Too many requests","status":"RESOURCE_EXHAUSTED","details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"36s"}]}}"#;
        assert_eq!(
            classify_status(429, None, minute),
            SummarizeError::RateLimited {
                retry_after: Some(Duration::from_secs(36))
            }
        );
        assert_eq!(
            classify_status(429, Some("5"), minute),
            SummarizeError::RateLimited {
                retry_after: Some(Duration::from_secs(5))
            }
        );
        assert!(matches!(classify_status(503, None, ""), SummarizeError::Transient(_)));
        assert_eq!(
            classify_status(400, None, r#"{"error":{"message":"API key not valid"}}"#),
            SummarizeError::Rejected {
                status: 400,
                message: "API key not valid".to_string()
            }
        );
    }

    #[test]
    fn test_out_of_range_retry_delay_is_ignored() {
        let expected = SummarizeError::RateLimited { retry_after: None };
        assert_eq!(classify_status(429, Some("1e30"), "{}"), expected);
        assert_eq!(classify_status(429, Some("-3"), "{}"), expected);
        assert_eq!(classify_status(429, Some("inf"), "{}"), expected);

        let huge = r#"{"error":{"details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"1e30s"}]}}"#;
        assert_eq!(classify_status(429, None, huge), expected);
    }

    #[test]
    fn test_decode_body_rejects_invalid_utf8() {
        assert_eq!(decode_body("{\"ok\": \"한국어\"}".as_bytes()).unwrap(), "{\"ok\": \"한국어\"}");
        assert!(matches!(
            decode_body(&[b'{', 0xff, 0xfe, b'}']),
            Err(SummarizeError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_quota_meter_budget() {
        let meter = QuotaMeter::new(Some(2));
        assert!(meter.acquire().is_ok());
        assert!(meter.acquire().is_ok());
        assert_eq!(meter.acquire(), Err(SummarizeError::QuotaExhausted));
        assert!(meter.is_halted());
        assert_eq!(meter.used(), 2);
    }

    #[tokio::test]
    async fn test_summarize_success_truncates_title() {
        let c = candidate("galaxy");
        let summarizer = client(FnBackend::new(|_| {
            Ok(r#"{"title_kr": "제임스 웹 망원경이 초기 은하를 발견하다", "summary_kr": "요약"}"#.to_string())
        }));
        let article = summarizer.summarize(identity(&c), &c, &c.description).await.unwrap();
        assert_eq!(article.title_ko, "제임스 웹 망원경이");
        assert_eq!(article.title_ko.chars().count(), 10);
        assert_eq!(article.summary_ko, "요약");
        assert_eq!(article.title_en, "galaxy");
        assert_eq!(summarizer.quota().used(), 1);

        // same input, same committed title
        let again = summarizer.summarize(identity(&c), &c, &c.description).await.unwrap();
        assert_eq!(again.title_ko, article.title_ko);
    }

    #[tokio::test]
    async fn test_multiline_title_becomes_one_heading_line() {
        let c = candidate("galaxy");
        let summarizer = client(FnBackend::new(|_| {
            Ok(r###"{"title_kr": "## 새\n  은하", "summary_kr": "요약"}"###.to_string())
        }));
        let article = summarizer.summarize(identity(&c), &c, "text").await.unwrap();
        assert_eq!(article.title_ko, "새 은하");

        let markers_only = client(FnBackend::new(|_| {
            Ok(r#"{"title_kr": "> #", "summary_kr": "요약"}"#.to_string())
        }));
        let article = markers_only.summarize(identity(&c), &c, "text").await.unwrap();
        assert_eq!(article.title_ko, "galaxy");
    }

    #[tokio::test]
    async fn test_empty_title_falls_back_to_original() {
        let c = candidate("galaxy");
        let summarizer = client(FnBackend::new(|_| Ok(r#"{"summary_kr": "요약"}"#.to_string())));
        let article = summarizer.summarize(identity(&c), &c, "text").await.unwrap();
        assert_eq!(article.title_ko, "galaxy");
    }

    #[tokio::test]
    async fn test_transient_errors_retried_and_counted() {
        let c = candidate("retry");
        let backend = ScriptedBackend::new(vec![
            Err(SummarizeError::Transient("502".into())),
            Err(SummarizeError::RateLimited {
                retry_after: Some(Duration::from_millis(1)),
            }),
            Ok(GOOD.to_string()),
        ]);
        let summarizer = client(backend);
        assert!(summarizer.summarize(identity(&c), &c, "text").await.is_ok());
        assert_eq!(summarizer.backend.calls.get(), 3);
        assert_eq!(summarizer.quota().used(), 3);
    }

    #[tokio::test]
    async fn test_invalid_response_not_retried() {
        let c = candidate("bad");
        let summarizer = client(ScriptedBackend::new(vec![Ok("not json".to_string())]));
        let err = summarizer.summarize(identity(&c), &c, "text").await.unwrap_err();
        assert!(matches!(err, SummarizeError::InvalidResponse(_)));
        assert_eq!(summarizer.backend.calls.get(), 1);
    }

    #[tokio::test]
    async fn test_quota_exhausted_halts_further_calls() {
        let c = candidate("quota");
        let summarizer = client(ScriptedBackend::new(vec![Err(SummarizeError::QuotaExhausted)]));
        let err = summarizer.summarize(identity(&c), &c, "text").await.unwrap_err();
        assert_eq!(err, SummarizeError::QuotaExhausted);
        assert!(summarizer.quota().is_halted());

        let err = summarizer.summarize(identity(&c), &c, "text").await.unwrap_err();
        assert_eq!(err, SummarizeError::QuotaExhausted);
        assert_eq!(summarizer.backend.calls.get(), 1);
    }
}
