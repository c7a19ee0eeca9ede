//! Client-visible error taxonomy
//!
//! Every failure that can cross the HTTP boundary is one of these variants;
//! handlers return `Result<_, ProxyError>` and the `IntoResponse` impl maps
//! each variant to its status code and a JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing or mismatched bearer token.
    #[error("unauthorized")]
    Auth,

    /// The request itself is unusable; retrying it will not help.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// LLM or TTS upstream failed after retries were exhausted.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// A cache or backend-slot wait exceeded its deadline.
    #[error("deadline exceeded")]
    Timeout,

    /// The client went away mid-stream.
    #[error("client disconnected")]
    Cancelled,

    /// Invariant violation; a bug, not an operational condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::Auth => StatusCode::UNAUTHORIZED,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            // The connection is gone; nobody reads this, but axum needs a
            // response value. 499 matches the common reverse-proxy log code.
            ProxyError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY),
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ProxyError::Auth => "unauthorized",
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::Upstream(_) => "upstream_error",
            ProxyError::Timeout => "timeout",
            ProxyError::Cancelled => "cancelled",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.label(),
            "details": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}
