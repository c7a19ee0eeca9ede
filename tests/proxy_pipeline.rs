//! End-to-end pipeline tests
//!
//! Stand up mock LLM and TTS upstreams plus the real proxy router on
//! ephemeral ports, then drive the whole flow over HTTP: chat stream →
//! segmenter → prefetch cache → speech endpoint, plus auth and the ops
//! surface.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Json;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};

use voxcache::config::{
    CacheConfig, Config, SegmentConfig, ServerConfig, TtsConfig, UpstreamConfig,
};

const PROXY_KEY: &str = "sk-proxy-test";

const SSE_FIXTURE: &str = "data: {\"id\":\"chatcmpl-1\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"Sentence one. \"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"Sentence two.\"}}]}\n\n\
data: [DONE]\n\n";

const EVENT_ONE: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Sentence one. \"}}]}\n\n";

/// A delta that opens a sentence the assistant never finishes.
const EVENT_PARTIAL: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"and then it got\"}}]}\n\n";

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Mock chat upstream streaming the fixture in small chunks.
async fn spawn_llm() -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let chunks: Vec<Result<Bytes, Infallible>> = SSE_FIXTURE
                .as_bytes()
                .chunks(17)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(tokio_stream::iter(chunks)),
            )
                .into_response()
        }),
    );
    serve(app).await
}

/// Mock chat upstream that emits a finished sentence plus a partial one,
/// then dies with a transport error.
async fn spawn_llm_dying_mid_sentence() -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                Ok(Bytes::from_static(EVENT_ONE.as_bytes())),
                Ok(Bytes::from_static(EVENT_PARTIAL.as_bytes())),
                Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "upstream died",
                )),
            ];
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(tokio_stream::iter(chunks)),
            )
                .into_response()
        }),
    );
    serve(app).await
}

/// Mock chat upstream that emits the same two deltas and then keeps the
/// connection alive with comment events, so only a client disconnect can
/// end the relay.
async fn spawn_llm_stalling_mid_sentence() -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let head = tokio_stream::iter(vec![
                Ok::<Bytes, Infallible>(Bytes::from_static(EVENT_ONE.as_bytes())),
                Ok(Bytes::from_static(EVENT_PARTIAL.as_bytes())),
            ]);
            let pings = futures_util::stream::unfold((), |()| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Some((
                    Ok::<Bytes, Infallible>(Bytes::from_static(b": keep-alive\n\n")),
                    (),
                ))
            });
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(head.chain(pings)),
            )
                .into_response()
        }),
    );
    serve(app).await
}

#[derive(serde::Deserialize)]
struct SpeechBody {
    input: String,
}

/// Mock TTS backend that echoes the input into the "audio" bytes and
/// counts synthesis requests.
async fn spawn_tts(delay: Duration) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let app = Router::new().route(
        "/v1/audio/speech",
        post(move |Json(body): Json<SpeechBody>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                (
                    [(header::CONTENT_TYPE, "audio/wav")],
                    Bytes::from(format!("WAV:{}", body.input)),
                )
            }
        }),
    );
    (serve(app).await, hits)
}

fn proxy_config(llm_url: String, tts_url: String) -> Config {
    Config {
        upstream: UpstreamConfig {
            base_url: llm_url,
            api_key: "upstream-key".to_string(),
        },
        tts: TtsConfig {
            backends: vec![tts_url],
            api_keys: Vec::new(),
            default_model: "tts-1".to_string(),
            default_voice: "default".to_string(),
            max_concurrent: 3,
            request_timeout_secs: 5,
            retry_count: 1,
            extra_body: None,
        },
        cache: CacheConfig {
            max_size: 100,
            ttl_secs: 3600,
        },
        segment: SegmentConfig {
            min_len: 3,
            max_len: 40,
        },
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            api_key: PROXY_KEY.to_string(),
        },
    }
}

async fn spawn_proxy(config: Config) -> String {
    let state = voxcache::build_state(config);
    serve(voxcache::build_router(state)).await
}

async fn spawn_stack(tts_delay: Duration) -> (String, Arc<AtomicUsize>) {
    let llm = spawn_llm().await;
    let (tts, hits) = spawn_tts(tts_delay).await;
    let proxy = spawn_proxy(proxy_config(llm, tts)).await;
    (proxy, hits)
}

#[tokio::test]
async fn test_chat_stream_passthrough_and_prefetch() {
    let (proxy, hits) = spawn_stack(Duration::from_millis(50)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/chat/completions", proxy))
        .bearer_auth(PROXY_KEY)
        .json(&json!({"model": "gpt-x", "messages": [], "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    // Byte-exact passthrough.
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], SSE_FIXTURE.as_bytes());

    // Give the prefetch tasks a moment to finish both sentences.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // Audio for a prefetched sentence is served from cache: no new
    // synthesis request reaches the backend.
    let audio = client
        .post(format!("{}/v1/audio/speech", proxy))
        .bearer_auth(PROXY_KEY)
        .json(&json!({"model": "tts-1", "input": "Sentence one.", "voice": "default"}))
        .send()
        .await
        .unwrap();
    assert_eq!(audio.status(), 200);
    assert_eq!(
        audio.headers().get(header::CONTENT_TYPE).unwrap(),
        "audio/wav"
    );
    assert_eq!(&audio.bytes().await.unwrap()[..], b"WAV:Sentence one.");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_non_stream_chat_assembles_response() {
    let (proxy, hits) = spawn_stack(Duration::from_millis(20)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/chat/completions", proxy))
        .bearer_auth(PROXY_KEY)
        .json(&json!({"model": "gpt-x", "messages": [], "stream": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["object"], json!("chat.completion"));
    assert_eq!(
        body["choices"][0]["message"]["content"],
        json!("Sentence one. Sentence two.")
    );
    assert_eq!(body["choices"][0]["finish_reason"], json!("stop"));

    // Prefetch ran even though the client did not stream.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_tts_opt_out_skips_prefetch() {
    let (proxy, hits) = spawn_stack(Duration::from_millis(10)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/chat/completions", proxy))
        .bearer_auth(PROXY_KEY)
        .json(&json!({"model": "gpt-x", "messages": [], "stream": true, "tts_enabled": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let _ = resp.bytes().await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_speech_on_demand_synthesis() {
    let (proxy, hits) = spawn_stack(Duration::from_millis(20)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/audio/speech", proxy))
        .bearer_auth(PROXY_KEY)
        .json(&json!({"model": "tts-1", "input": "Cold start sentence."}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(&resp.bytes().await.unwrap()[..], b"WAV:Cold start sentence.");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_speech_rejects_empty_input() {
    let (proxy, _hits) = spawn_stack(Duration::from_millis(5)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/audio/speech", proxy))
        .bearer_auth(PROXY_KEY)
        .json(&json!({"model": "tts-1", "input": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], json!("bad_request"));
}

#[tokio::test]
async fn test_auth_required_on_v1_endpoints_only() {
    let (proxy, _hits) = spawn_stack(Duration::from_millis(5)).await;
    let client = reqwest::Client::new();

    for (path, body) in [
        ("/v1/chat/completions", json!({"model": "m", "messages": []})),
        ("/v1/audio/speech", json!({"model": "tts-1", "input": "hi"})),
    ] {
        let missing = client
            .post(format!("{}{}", proxy, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 401, "missing token on {}", path);

        let wrong = client
            .post(format!("{}{}", proxy, path))
            .bearer_auth("sk-wrong")
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 401, "wrong token on {}", path);
    }

    // Ops surface stays open.
    let health = client
        .get(format!("{}/health", proxy))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], json!("healthy"));
    assert_eq!(body["backends"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cache_stats_and_clear() {
    let (proxy, hits) = spawn_stack(Duration::from_millis(10)).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/v1/audio/speech", proxy))
        .bearer_auth(PROXY_KEY)
        .json(&json!({"model": "tts-1", "input": "counted once"}))
        .send()
        .await
        .unwrap();

    let stats: Value = client
        .get(format!("{}/cache/stats", proxy))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["size"], json!(1));
    assert_eq!(stats["misses"], json!(1));

    let cleared: Value = client
        .post(format!("{}/cache/clear", proxy))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["cleared"], json!(1));

    // After a clear the same input synthesizes again.
    client
        .post(format!("{}/v1/audio/speech", proxy))
        .bearer_auth(PROXY_KEY)
        .json(&json!({"model": "tts-1", "input": "counted once"}))
        .send()
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_upstream_failure_maps_to_bad_gateway() {
    let llm = serve(Router::new().route(
        "/v1/chat/completions",
        post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
    ))
    .await;
    let (tts, _hits) = spawn_tts(Duration::from_millis(5)).await;
    let proxy = spawn_proxy(proxy_config(llm, tts)).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", proxy))
        .bearer_auth(PROXY_KEY)
        .json(&json!({"model": "m", "messages": [], "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], json!("upstream_error"));
}

#[tokio::test]
async fn test_upstream_death_mid_sentence_discards_partial() {
    let llm = spawn_llm_dying_mid_sentence().await;
    let (tts, hits) = spawn_tts(Duration::from_millis(10)).await;
    let proxy = spawn_proxy(proxy_config(llm, tts)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/chat/completions", proxy))
        .bearer_auth(PROXY_KEY)
        .json(&json!({"model": "gpt-x", "messages": [], "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Everything received before the upstream died was still relayed.
    let body = resp.bytes().await.unwrap();
    assert!(body.starts_with(EVENT_ONE.as_bytes()));
    assert!(body.ends_with(EVENT_PARTIAL.as_bytes()));

    tokio::time::sleep(Duration::from_millis(250)).await;

    // The finished sentence was prefetched; the half-generated one never
    // reached a backend or the cache.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let stats: Value = client
        .get(format!("{}/cache/stats", proxy))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["size"], json!(1));
    assert_eq!(stats["pending"], json!(0));
}

#[tokio::test]
async fn test_client_disconnect_mid_sentence_discards_partial() {
    let llm = spawn_llm_stalling_mid_sentence().await;
    let (tts, hits) = spawn_tts(Duration::from_millis(10)).await;
    let proxy = spawn_proxy(proxy_config(llm, tts)).await;
    let client = reqwest::Client::new();

    let mut resp = client
        .post(format!("{}/v1/chat/completions", proxy))
        .bearer_auth(PROXY_KEY)
        .json(&json!({"model": "gpt-x", "messages": [], "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Read until the partial delta has arrived, then hang up.
    let mut seen: Vec<u8> = Vec::new();
    while let Some(chunk) = resp.chunk().await.unwrap() {
        seen.extend_from_slice(&chunk);
        if seen
            .windows(EVENT_PARTIAL.len())
            .any(|w| w == EVENT_PARTIAL.as_bytes())
        {
            break;
        }
    }
    drop(resp);

    tokio::time::sleep(Duration::from_millis(300)).await;

    // The disconnect abandoned the relay; already-submitted synthesis
    // finished, but the trailing fragment was never flushed into the
    // cache.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let stats: Value = client
        .get(format!("{}/cache/stats", proxy))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["size"], json!(1));
    assert_eq!(stats["pending"], json!(0));
}

#[tokio::test]
async fn test_models_endpoints_are_open_and_static() {
    let (proxy, _hits) = spawn_stack(Duration::from_millis(5)).await;
    let client = reqwest::Client::new();

    let models: Value = client
        .get(format!("{}/v1/models", proxy))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models["object"], json!("list"));

    let audio_models: Value = client
        .get(format!("{}/v1/audio/models", proxy))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(audio_models["data"][0]["id"], json!("tts-1"));
}
