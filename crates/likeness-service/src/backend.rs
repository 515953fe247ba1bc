//! Image generation backend contract, a retrying decorator, and an HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Transient: rate limit, overload, network hiccup.
    #[error("retryable backend error: {0}")]
    Retryable(String),
    #[error("backend error: {0}")]
    Fatal(String),
    #[error("backend still failing after {tries} tries: {last}")]
    Exhausted { tries: u32, last: String },
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Retryable(_))
    }
}

/// One call to the generator.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Encoded reference image used to condition the output.
    pub reference_image: Option<Vec<u8>>,
    pub seed: u32,
    /// Reference-image influence in [0, 1].
    pub strength: f32,
}

/// Text/image-to-image generator. Output is not deterministic, even for identical requests.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Generate one encoded image.
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, BackendError>;
}

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);

/// Retries [`BackendError::Retryable`] failures with exponential backoff.
///
/// Up to `max_retries` extra tries follow the first one; after that the
/// last error is reported as [`BackendError::Exhausted`]. Other errors
/// pass through untouched.
pub struct RetryingBackend<B> {
    inner: B,
    max_retries: u32,
    base: Duration,
    cap: Duration,
}

impl<B: ImageBackend> RetryingBackend<B> {
    pub fn new(inner: B, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            base: BACKOFF_BASE,
            cap: BACKOFF_CAP,
        }
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.base = base;
        self.cap = cap;
        self
    }

    fn delay(&self, retry: u32) -> Duration {
        self.base.saturating_mul(1u32 << retry.min(16)).min(self.cap)
    }
}

#[async_trait]
impl<B: ImageBackend> ImageBackend for RetryingBackend<B> {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, BackendError> {
        let mut retry = 0u32;
        loop {
            match self.inner.generate(request).await {
                Ok(image) => return Ok(image),
                Err(BackendError::Retryable(reason)) => {
                    if retry >= self.max_retries {
                        return Err(BackendError::Exhausted {
                            tries: retry + 1,
                            last: reason,
                        });
                    }
                    let delay = self.delay(retry);
                    retry += 1;
                    tracing::warn!(
                        retry,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        seed = request.seed,
                        %reason,
                        "backend transient error; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[derive(Serialize)]
struct HttpRequestBody<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_image: Option<String>,
    seed: u32,
    strength: f32,
}

/// JSON-over-HTTP generator. The response body is the encoded image.
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpBackend {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("likeness/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::Fatal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        BackendError::Retryable(err.to_string())
    } else {
        BackendError::Fatal(err.to_string())
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

#[async_trait]
impl ImageBackend for HttpBackend {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, BackendError> {
        let body = HttpRequestBody {
            prompt: &request.prompt,
            reference_image: request.reference_image.as_deref().map(|b| BASE64.encode(b)),
            seed: request.seed,
            strength: request.strength,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let reason = format!("HTTP {status}: {}", detail.chars().take(200).collect::<String>());
            return Err(if is_retryable_status(status) {
                BackendError::Retryable(reason)
            } else {
                BackendError::Fatal(reason)
            });
        }

        let bytes = response.bytes().await.map_err(classify_transport)?;
        if bytes.is_empty() {
            return Err(BackendError::Fatal("empty response body".into()));
        }
        tracing::debug!(seed = request.seed, bytes = bytes.len(), "backend returned image");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Replays a fixed list of outcomes, one per call, and records the seeds it saw.
    pub struct ScriptedBackend {
        script: Mutex<VecDeque<Result<Vec<u8>, BackendError>>>,
        pub calls: AtomicU32,
        pub seeds: Mutex<Vec<u32>>,
    }

    impl ScriptedBackend {
        pub fn new(script: Vec<Result<Vec<u8>, BackendError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                seeds: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn seeds(&self) -> Vec<u32> {
            self.seeds.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ImageBackend for ScriptedBackend {
        async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seeds.lock().unwrap().push(request.seed);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Fatal("script exhausted".into())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedBackend;
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "a child riding a dragon".into(),
            reference_image: Some(b"ref".to_vec()),
            seed: 42,
            strength: 0.25,
        }
    }

    fn fast(inner: ScriptedBackend, retries: u32) -> RetryingBackend<ScriptedBackend> {
        RetryingBackend::new(inner, retries).with_backoff(Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn test_backoff_schedule() {
        let backend = RetryingBackend::new(ScriptedBackend::new(vec![]), 10);
        let delays: Vec<u64> = (0..6).map(|r| backend.delay(r).as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000]);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let backend = fast(
            ScriptedBackend::new(vec![
                Err(BackendError::Retryable("429".into())),
                Err(BackendError::Retryable("503".into())),
                Ok(b"img".to_vec()),
            ]),
            3,
        );
        assert_eq!(backend.generate(&request()).await.unwrap(), b"img");
        assert_eq!(backend.inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_after_budget() {
        let backend = fast(
            ScriptedBackend::new(vec![Err(BackendError::Retryable("503".into())); 5]),
            2,
        );
        let err = backend.generate(&request()).await.unwrap_err();
        assert_eq!(
            err,
            BackendError::Exhausted {
                tries: 3,
                last: "503".into()
            }
        );
        assert_eq!(backend.inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_fatal_not_retried() {
        let backend = fast(
            ScriptedBackend::new(vec![Err(BackendError::Fatal("bad prompt".into())), Ok(b"img".to_vec())]),
            3,
        );
        assert!(matches!(backend.generate(&request()).await, Err(BackendError::Fatal(_))));
        assert_eq!(backend.inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_http_posts_json_and_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .and(body_partial_json(json!({
                "prompt": "a child riding a dragon",
                "reference_image": BASE64.encode(b"ref"),
                "seed": 42,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG fake".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpBackend::new(format!("{}/generate", server.uri()), Duration::from_secs(5)).unwrap();
        let image = backend.generate(&request()).await.unwrap();
        assert_eq!(image, b"\x89PNG fake");
    }

    #[tokio::test]
    async fn test_http_status_classification() {
        let server = MockServer::start().await;
        for (route, status) in [("/busy", 503), ("/limited", 429), ("/slow", 408), ("/bad", 400), ("/gone", 404)] {
            Mock::given(method("POST"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
        }

        for (route, retryable) in [("/busy", true), ("/limited", true), ("/slow", true), ("/bad", false), ("/gone", false)] {
            let backend = HttpBackend::new(format!("{}{route}", server.uri()), Duration::from_secs(5)).unwrap();
            let err = backend.generate(&request()).await.unwrap_err();
            assert_eq!(err.is_retryable(), retryable, "{route}: {err}");
        }
    }

    #[tokio::test]
    async fn test_http_timeout_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"late".to_vec()).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let backend = HttpBackend::new(server.uri(), Duration::from_millis(50)).unwrap();
        assert!(backend.generate(&request()).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_retrying_http_recovers_from_503() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let http = HttpBackend::new(server.uri(), Duration::from_secs(5)).unwrap();
        let backend = RetryingBackend::new(http, 2).with_backoff(Duration::from_millis(1), Duration::from_millis(1));
        assert_eq!(backend.generate(&request()).await.unwrap(), b"ok");
    }
}
