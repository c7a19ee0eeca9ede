//! Operational surface: health, cache counters, and model discovery
//!
//! Every handler here answers from in-memory snapshots and never blocks on
//! I/O, so health checks stay honest while upstreams misbehave.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::server::AppState;

/// Service info
pub async fn index(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "service": crate::NAME,
        "version": crate::VERSION,
        "description": "latency-hiding TTS prefetch proxy",
        "started_at": state.started_at.to_rfc3339(),
        "endpoints": {
            "POST /v1/chat/completions": "chat passthrough with TTS prefetch (bearer auth)",
            "POST /v1/audio/speech": "synthesize or fetch cached audio (bearer auth)",
            "GET /health": "backend and cache health",
            "GET /cache/stats": "cache counters",
            "POST /cache/clear": "drop all cached audio",
            "GET /v1/models": "chat model list",
            "GET /v1/audio/models": "TTS model list",
        },
    }))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "status": "healthy",
        "uptime_secs": uptime_secs,
        "backends": state.pool.stats(),
        "cache": state.cache.stats(),
    }))
}

pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.stats())
}

pub async fn cache_clear(State(state): State<AppState>) -> impl IntoResponse {
    let cleared = state.cache.clear();
    Json(json!({ "cleared": cleared }))
}

/// Chat models are proxied verbatim; the upstream owns the real catalog.
pub async fn list_models(State(_state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "object": "list",
        "data": [],
        "note": "chat models are passed through to the configured upstream",
    }))
}

pub async fn list_audio_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.config.tts.default_model,
            "object": "model",
            "voices": [state.config.tts.default_voice],
        }],
    }))
}
