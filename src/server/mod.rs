//! HTTP server: state, routing, and startup

pub mod auth;
pub mod chat;
pub mod ops;
pub mod speech;

use anyhow::{Context, Result};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::llm::LlmClient;
use crate::tts::{BackendPool, Dispatcher, TtsCache};

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub llm: LlmClient,
    pub cache: Arc<TtsCache>,
    pub pool: Arc<BackendPool>,
    pub started_at: DateTime<Utc>,
}

/// Wire up the pool, dispatcher, cache, and upstream client from config.
pub fn build_state(config: Config) -> AppState {
    let config = Arc::new(config);
    let pool = BackendPool::new(&config.tts.backends, config.tts.max_concurrent);
    let dispatcher = Dispatcher::new(Arc::clone(&pool), &config.tts);
    let cache = TtsCache::new(
        dispatcher,
        config.cache.max_size,
        config.cache_ttl(),
        config.request_timeout(),
    );
    let llm = LlmClient::new(
        config.upstream.base_url.clone(),
        config.upstream.api_key.clone(),
        config.request_timeout(),
    );
    AppState {
        config,
        llm,
        cache,
        pool,
        started_at: Utc::now(),
    }
}

/// Assemble the router: the two OpenAI-compatible endpoints sit behind the
/// bearer check; health and cache ops are open.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/audio/speech", post(speech::create_speech))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    let public = Router::new()
        .route("/", get(ops::index))
        .route("/health", get(ops::health))
        .route("/cache/stats", get(ops::cache_stats))
        .route("/cache/clear", post(ops::cache_clear))
        .route("/v1/models", get(ops::list_models))
        .route("/v1/audio/models", get(ops::list_audio_models));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and block until shutdown.
pub async fn start(config: Config) -> Result<()> {
    let state = build_state(config);
    state.cache.start_sweeper();

    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    )
    .parse()
    .context("invalid listen address")?;

    info!(
        backends = state.config.tts.backends.len(),
        upstream = %state.config.upstream.base_url,
        "voxcache listening on {}",
        addr
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
