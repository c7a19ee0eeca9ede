//! Configuration management
//!
//! All settings come from the environment; only the upstream coordinates,
//! the TTS backend list, and our own API key are required. Everything else
//! has a default tuned for a single-instance deployment.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub tts: TtsConfig,
    pub cache: CacheConfig,
    pub segment: SegmentConfig,
    pub server: ServerConfig,
}

/// Coordinates of the streaming chat-completion upstream
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(skip)]
    pub api_key: String,
}

/// TTS backend pool and request shaping
#[derive(Debug, Clone, Serialize)]
pub struct TtsConfig {
    /// Backend base URLs; each serves `POST /v1/audio/speech`.
    pub backends: Vec<String>,
    /// Bearer tokens rotated round-robin across all synthesis requests.
    /// May be empty (backends without auth), one (shared), or many.
    #[serde(skip)]
    pub api_keys: Vec<String>,
    pub default_model: String,
    pub default_voice: String,
    /// Concurrent synthesis requests allowed per backend.
    pub max_concurrent: u32,
    pub request_timeout_secs: u64,
    /// Retries after the first attempt.
    pub retry_count: u32,
    /// Opaque JSON object merged into every synthesis request body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentConfig {
    pub min_len: usize,
    pub max_len: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Key our own clients must present on the `/v1` endpoints.
    #[serde(skip)]
    pub api_key: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("required environment variable {} is not set", key))
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let upstream = UpstreamConfig {
            base_url: env_required("NEWAPI_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            api_key: env_required("NEWAPI_API_KEY")?,
        };

        let backends = split_csv(&env_required("TTS_BACKENDS")?);
        if backends.is_empty() {
            bail!("TTS_BACKENDS must list at least one backend URL");
        }
        for b in &backends {
            url::Url::parse(b).with_context(|| format!("invalid TTS backend URL: {}", b))?;
        }

        let api_keys = std::env::var("TTS_API_KEYS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let extra_body = match std::env::var("TTS_EXTRA_BODY") {
            Ok(raw) if !raw.trim().is_empty() => {
                let value: serde_json::Value =
                    serde_json::from_str(&raw).context("TTS_EXTRA_BODY is not valid JSON")?;
                if !value.is_object() {
                    bail!("TTS_EXTRA_BODY must be a JSON object");
                }
                Some(value)
            }
            _ => None,
        };

        let tts = TtsConfig {
            backends,
            api_keys,
            default_model: env_or("DEFAULT_TTS_MODEL", "tts-1".to_string()),
            default_voice: env_or("DEFAULT_TTS_VOICE", "default".to_string()),
            max_concurrent: env_or("TTS_MAX_CONCURRENT", 3u32).max(1),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 60u64).max(1),
            retry_count: env_or("TTS_RETRY_COUNT", 2u32),
            extra_body,
        };

        let cache = CacheConfig {
            max_size: env_or("CACHE_MAX_SIZE", 1000usize).max(1),
            ttl_secs: env_or("CACHE_TTL_SECS", 3600u64).max(1),
        };

        let min_len = env_or("SEGMENT_MIN_LEN", crate::segment::DEFAULT_MIN_LEN).max(1);
        let segment = SegmentConfig {
            min_len,
            max_len: env_or("SEGMENT_MAX_LEN", crate::segment::DEFAULT_MAX_LEN).max(min_len),
        };

        let server = ServerConfig {
            host: env_or("HOST", "0.0.0.0".to_string()),
            port: env_or("PORT", 8080u16),
            api_key: env_required("PROXY_API_KEY")?,
        };

        Ok(Self {
            upstream,
            tts,
            cache,
            segment,
            server,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.tts.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}
