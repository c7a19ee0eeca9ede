//! TTS dispatcher
//!
//! The only component that talks to TTS backends. Turns one
//! `(model, voice, text)` into one `audio/wav` blob using the backend pool,
//! a shared bearer-token rotator, and a bounded retry schedule.

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::TtsConfig;
use crate::error::ProxyError;
use crate::tts::pool::BackendPool;

/// Floor for the per-request timeout when the deadline is nearly spent.
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Base delay between retries; doubles per attempt.
const BACKOFF_BASE_MS: u64 = 250;

/// Backoff ceiling.
const BACKOFF_MAX_MS: u64 = 2_000;

/// Round-robin bearer-token rotator shared across all synthesis requests.
/// Advances on every draw, not on success.
pub struct TokenRotator {
    tokens: Vec<String>,
    next: AtomicUsize,
}

impl TokenRotator {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens,
            next: AtomicUsize::new(0),
        }
    }

    pub fn next_token(&self) -> Option<&str> {
        if self.tokens.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.tokens.len();
        Some(&self.tokens[i])
    }
}

/// Stateless synthesis front-end; all mutable state lives in the pool and
/// the token rotator.
pub struct Dispatcher {
    http: reqwest::Client,
    pool: Arc<BackendPool>,
    tokens: TokenRotator,
    retry_count: u32,
    extra_body: Option<Value>,
}

impl Dispatcher {
    pub fn new(pool: Arc<BackendPool>, config: &TtsConfig) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::new(),
            pool,
            tokens: TokenRotator::new(config.api_keys.clone()),
            retry_count: config.retry_count,
            extra_body: config.extra_body.clone(),
        })
    }

    /// Synthesize `text` into WAV bytes before `deadline`.
    ///
    /// Backend errors rotate to the next backend with exponential backoff;
    /// a non-429 4xx is terminal because resending the same body cannot
    /// succeed.
    pub async fn synthesize(
        &self,
        model: &str,
        voice: &str,
        text: &str,
        deadline: Instant,
    ) -> Result<Bytes, ProxyError> {
        let attempts = self.retry_count + 1;
        let body = self.build_body(model, voice, text);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            let lease = self.pool.acquire(deadline).await?;
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(MIN_REQUEST_TIMEOUT);
            let url = format!("{}/v1/audio/speech", lease.url());

            let mut request = self.http.post(&url).json(&body).timeout(remaining);
            if let Some(token) = self.tokens.next_token() {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let is_audio = resp
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .is_some_and(|v| v.starts_with("audio/"));
                        match resp.bytes().await {
                            Ok(bytes) if is_audio && !bytes.is_empty() => {
                                lease.report_success();
                                debug!(url = %url, bytes = bytes.len(), "TTS synthesis ok");
                                return Ok(bytes);
                            }
                            Ok(bytes) => {
                                lease.report_failure();
                                last_error = format!(
                                    "backend returned 2xx with unusable body ({} bytes, audio={})",
                                    bytes.len(),
                                    is_audio
                                );
                            }
                            Err(e) => {
                                lease.report_failure();
                                last_error = format!("failed reading audio body: {}", e);
                            }
                        }
                    } else if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                        // The backend is healthy; the request is the problem.
                        lease.report_success();
                        let detail = resp.text().await.unwrap_or_default();
                        return Err(ProxyError::BadRequest(format!(
                            "TTS backend rejected request ({}): {}",
                            status,
                            truncate(&detail, 200)
                        )));
                    } else {
                        lease.report_failure();
                        last_error = format!("TTS backend returned {}", status);
                    }
                }
                Err(e) => {
                    lease.report_failure();
                    last_error = e.to_string();
                }
            }
            drop(lease);

            if attempt + 1 < attempts {
                let backoff = backoff_with_jitter(attempt);
                warn!(
                    attempt = attempt + 1,
                    error = %last_error,
                    backoff_ms = backoff.as_millis() as u64,
                    "TTS attempt failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(ProxyError::Upstream(format!(
            "TTS synthesis failed after {} attempts: {}",
            attempts, last_error
        )))
    }

    fn build_body(&self, model: &str, voice: &str, text: &str) -> Value {
        let mut body = json!({});
        if let Some(Value::Object(extra)) = &self.extra_body {
            for (k, v) in extra {
                body[k.as_str()] = v.clone();
            }
        }
        body["model"] = json!(model);
        body["input"] = json!(text);
        body["voice"] = json!(voice);
        body["response_format"] = json!("wav");
        body
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    use rand::Rng;
    let base = (BACKOFF_BASE_MS << attempt.min(8)).min(BACKOFF_MAX_MS);
    let factor: f64 = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((base as f64 * factor) as u64)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
