//! Speech synthesis endpoint
//!
//! OpenAI-compatible `POST /v1/audio/speech`. Usually the requested
//! sentence was already prefetched during the chat stream and this is a
//! pure cache hit; otherwise it waits on the in-flight synthesis or starts
//! one.

use axum::body::Body;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct SpeechRequest {
    pub model: Option<String>,
    pub input: String,
    pub voice: Option<String>,
    /// Accepted for OpenAI compatibility; audio is always WAV and speed
    /// does not affect the fingerprint.
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
}

pub async fn create_speech(
    State(state): State<AppState>,
    Json(req): Json<SpeechRequest>,
) -> Result<Response, ProxyError> {
    let input = req.input.trim();
    if input.is_empty() {
        return Err(ProxyError::BadRequest("input text cannot be empty".to_string()));
    }

    let request_id = Uuid::new_v4();
    let model = req
        .model
        .unwrap_or_else(|| state.config.tts.default_model.clone());
    let voice = req
        .voice
        .unwrap_or_else(|| state.config.tts.default_voice.clone());

    if req.response_format.as_deref().is_some_and(|f| f != "wav") || req.speed.is_some() {
        debug!(
            %request_id,
            format = ?req.response_format,
            speed = ?req.speed,
            "ignoring compatibility-only request fields"
        );
    }

    info!(
        %request_id,
        model = %model,
        voice = %voice,
        input_len = input.chars().count(),
        "speech request"
    );

    let deadline = Instant::now() + state.config.request_timeout();
    let audio = state.cache.get(&model, &voice, input, deadline).await?;

    Response::builder()
        .header(CONTENT_TYPE, "audio/wav")
        .body(Body::from(audio))
        .map_err(|e| ProxyError::Internal(e.to_string()))
}
