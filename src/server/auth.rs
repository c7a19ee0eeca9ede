//! Bearer-token authentication
//!
//! The `/v1` endpoints require `Authorization: Bearer <PROXY_API_KEY>`;
//! everything else (health, cache ops, model lists) is open.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::error::ProxyError;
use crate::server::AppState;

pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if token_matches(presented, &state.config.server.api_key) {
        Ok(next.run(request).await)
    } else {
        warn!(path = %request.uri().path(), "rejected request with missing or bad bearer token");
        Err(ProxyError::Auth)
    }
}

fn token_matches(header: Option<&str>, key: &str) -> bool {
    header
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == key)
}
