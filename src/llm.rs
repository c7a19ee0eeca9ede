//! Upstream chat-completion client with SSE fan-out
//!
//! Always streams from the upstream, relaying every SSE event byte-exact to
//! a channel the handler owns while extracting the assistant text deltas
//! for the prefetch side-channel. The relay path never lossy-decodes: what
//! came off the wire is what the client gets, in order. Side-channel
//! parsing failures are swallowed (logged at debug); the relay is sacred.

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ProxyError;

/// Maximum silence between upstream SSE chunks before the stream is
/// declared dead. The overall body transfer has no total timeout.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Streaming-termination sentinel used by OpenAI-compatible upstreams.
const DONE_MARKER: &str = "[DONE]";

/// Client for the chat-completion upstream.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    headers_timeout: Duration,
}

/// An open upstream stream, ready to relay. Splitting open from relay lets
/// the chat handler turn pre-stream failures into a proper 502 instead of
/// an empty 200.
#[derive(Debug)]
pub struct LlmStream {
    response: reqwest::Response,
}

impl LlmClient {
    pub fn new(base_url: String, api_key: String, headers_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            headers_timeout,
        }
    }

    /// Forward a chat request upstream with `stream: true` forced, waiting
    /// only for response headers. The request body must already have the
    /// proxy-only fields stripped.
    pub async fn open_chat_stream(&self, mut body: Value) -> Result<LlmStream, ProxyError> {
        body["stream"] = json!(true);

        let send = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.headers_timeout, send)
            .await
            .map_err(|_| ProxyError::Upstream("timed out waiting for upstream headers".to_string()))?
            .map_err(|e| ProxyError::Upstream(format!("upstream request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProxyError::Upstream(format!(
                "upstream returned {}: {}",
                status,
                detail.chars().take(300).collect::<String>()
            )));
        }

        Ok(LlmStream { response })
    }
}

impl LlmStream {
    /// Relay SSE events to `chunk_tx` byte-exact and in order, invoking
    /// `on_text` with each assistant content delta.
    ///
    /// Returns `Cancelled` when the chunk receiver goes away (client
    /// disconnect), `Upstream` on idle timeout or transport error — after
    /// relaying whatever had already arrived.
    pub async fn relay(
        self,
        chunk_tx: mpsc::Sender<Bytes>,
        mut on_text: impl FnMut(&str),
    ) -> Result<(), ProxyError> {
        let mut stream = self.response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();

        loop {
            let chunk = match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
                Err(_) => {
                    flush_residual(&mut buf, &chunk_tx, &mut on_text).await?;
                    return Err(ProxyError::Upstream("upstream went idle mid-stream".to_string()));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    flush_residual(&mut buf, &chunk_tx, &mut on_text).await?;
                    return Err(ProxyError::Upstream(format!("upstream stream error: {}", e)));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            buf.extend_from_slice(&chunk);
            while let Some(end) = event_boundary(&buf) {
                let event = Bytes::from(buf.drain(..end).collect::<Vec<u8>>());
                if chunk_tx.send(event.clone()).await.is_err() {
                    return Err(ProxyError::Cancelled);
                }
                extract_deltas(&event, &mut on_text);
            }
        }

        flush_residual(&mut buf, &chunk_tx, &mut on_text).await?;
        Ok(())
    }
}

/// End offset of the first complete SSE event (terminated by a blank line).
fn event_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2)
}

async fn flush_residual(
    buf: &mut Vec<u8>,
    chunk_tx: &mpsc::Sender<Bytes>,
    on_text: &mut impl FnMut(&str),
) -> Result<(), ProxyError> {
    if buf.is_empty() {
        return Ok(());
    }
    let event = Bytes::from(std::mem::take(buf));
    if chunk_tx.send(event.clone()).await.is_err() {
        return Err(ProxyError::Cancelled);
    }
    extract_deltas(&event, on_text);
    Ok(())
}

/// Pull `choices[0].delta.content` out of each `data:` line. Events that
/// are not JSON, carry no content, or are the `[DONE]` sentinel contribute
/// nothing; they were already relayed verbatim.
fn extract_deltas(event: &[u8], on_text: &mut impl FnMut(&str)) {
    let text = String::from_utf8_lossy(event);
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim_start();
        if data.is_empty() || data == DONE_MARKER {
            continue;
        }
        let value: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping non-JSON SSE payload");
                continue;
            }
        };
        let content = value
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str());
        if let Some(content) = content {
            if !content.is_empty() {
                on_text(content);
            }
        }
    }
}
