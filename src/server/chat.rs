//! Chat-completion endpoint
//!
//! Forwards the chat request upstream (always streaming) and relays the SSE
//! events to the client unchanged while the segmenter cuts the assistant
//! text into sentences and submits each one to the synthesis cache. A slow
//! or broken TTS path never delays the relay: submission is fire-and-forget.

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::segment::SentenceSegmenter;
use crate::server::AppState;
use crate::tts::TtsCache;

/// Per-stream prefetch context: segments text deltas and submits completed
/// sentences for synthesis.
struct Prefetcher {
    segmenter: SentenceSegmenter,
    cache: Arc<TtsCache>,
    enabled: bool,
    model: String,
    voice: String,
}

impl Prefetcher {
    fn feed(&mut self, delta: &str) {
        for sentence in self.segmenter.feed(delta) {
            self.submit(&sentence);
        }
    }

    fn finish(mut self) {
        if let Some(rest) = self.segmenter.flush() {
            self.submit(&rest);
        }
    }

    fn submit(&self, sentence: &str) {
        if self.enabled {
            self.cache.submit(&self.model, &self.voice, sentence);
        }
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(mut body): Json<Value>,
) -> Result<Response, ProxyError> {
    let request_id = Uuid::new_v4();
    let obj = body
        .as_object_mut()
        .ok_or_else(|| ProxyError::BadRequest("request body must be a JSON object".to_string()))?;

    // Proxy-only fields are stripped before forwarding.
    let tts_enabled = obj
        .remove("tts_enabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let tts_model = obj
        .remove("tts_model")
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| state.config.tts.default_model.clone());
    let tts_voice = obj
        .remove("tts_voice")
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| state.config.tts.default_voice.clone());

    let client_wants_stream = obj.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    info!(
        %request_id,
        model = %model,
        tts_enabled,
        stream = client_wants_stream,
        "chat completion request"
    );

    // Pre-stream upstream failures become a proper 502.
    let upstream = state.llm.open_chat_stream(body).await?;

    let mut prefetcher = Prefetcher {
        segmenter: SentenceSegmenter::new(
            state.config.segment.min_len,
            state.config.segment.max_len,
        ),
        cache: Arc::clone(&state.cache),
        enabled: tts_enabled,
        model: tts_model,
        voice: tts_voice,
    };

    if client_wants_stream {
        let (tx, rx) = mpsc::channel::<Bytes>(64);
        tokio::spawn(async move {
            let result = upstream.relay(tx, |delta| prefetcher.feed(delta)).await;
            match result {
                Ok(()) => {
                    // Flush only on clean end-of-stream; an aborted stream
                    // leaves a half-generated sentence that must not reach
                    // TTS.
                    prefetcher.finish();
                    debug!(%request_id, "chat stream complete");
                }
                Err(ProxyError::Cancelled) => debug!(%request_id, "client disconnected"),
                Err(e) => warn!(%request_id, error = %e, "chat stream ended with upstream error"),
            }
        });

        let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
        Response::builder()
            .header(CONTENT_TYPE, "text/event-stream; charset=utf-8")
            .header(CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .map_err(|e| ProxyError::Internal(e.to_string()))
    } else {
        // Client asked for a non-stream response: buffer the assistant
        // text, but the segmenter still runs live so prefetch overlaps
        // with generation.
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let mut assistant_text = String::new();
        let result = upstream
            .relay(tx, |delta| {
                assistant_text.push_str(delta);
                prefetcher.feed(delta);
            })
            .await;
        let _ = drain.await;
        // Errors return before the flush: a truncated reply must not
        // submit its trailing fragment for synthesis.
        result?;
        prefetcher.finish();

        let response = json!({
            "id": format!("chatcmpl-{}", request_id.simple()),
            "object": "chat.completion",
            "created": Utc::now().timestamp(),
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": assistant_text },
                "finish_reason": "stop",
            }],
        });
        Ok(Json(response).into_response())
    }
}
