//! Voxcache - latency-hiding TTS prefetch proxy
//!
//! Sits between a chat client, a streaming chat-completion upstream, and a
//! pool of TTS backends:
//! - relays the upstream SSE stream to the client byte-exact
//! - segments the assistant text into sentences as it streams
//! - speculatively synthesizes each sentence through a single-flight cache
//! - serves `/v1/audio/speech` from that cache, usually instantly
//!
//! # Example
//!
//! ```ignore
//! use voxcache::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     voxcache::server::start(config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod segment;
pub mod server;
pub mod tts;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::ProxyError;
pub use segment::SentenceSegmenter;
pub use server::{build_router, build_state, start as start_server, AppState};
pub use tts::{fingerprint, BackendPool, Dispatcher, TtsCache};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
