//! Single-flight synthesis cache
//!
//! Maps a fingerprint to an audio artifact with at-most-one concurrent
//! synthesis per fingerprint. Completed audio is kept under LRU + TTL
//! bounds; pending entries are exempt from both so in-flight work is never
//! orphaned. All map mutations happen under one mutex that is never held
//! across I/O or waits; synthesis runs in spawned tasks and broadcasts its
//! outcome through a per-entry watch channel.

use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::tts::dispatch::Dispatcher;
use crate::tts::fingerprint::fingerprint;

/// Outcome broadcast to everyone waiting on a fingerprint.
#[derive(Debug, Clone)]
enum Outcome {
    Pending,
    Ready(Bytes),
    Failed(String),
}

struct Entry {
    /// Distinguishes this entry from a same-fingerprint successor created
    /// after `clear`; a finishing synthesizer only stores into its own
    /// generation.
    generation: u64,
    model: String,
    voice: String,
    text: String,
    created_at: Instant,
    completed_at: Option<Instant>,
    audio: Option<Bytes>,
    waiters: u32,
    tx: watch::Sender<Outcome>,
}

impl Entry {
    fn is_pending(&self) -> bool {
        self.audio.is_none()
    }
}

struct CacheInner {
    /// Insertion/access-ordered map: the LRU list and the entry map are the
    /// same structure, so they cannot fall out of lock-step.
    entries: LruCache<String, Entry>,
    hits: u64,
    misses: u64,
    evictions_lru: u64,
    evictions_ttl: u64,
}

/// Cache counters for the ops surface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub pending: usize,
    pub waiters: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions_lru: u64,
    pub evictions_ttl: u64,
}

pub struct TtsCache {
    inner: Mutex<CacheInner>,
    dispatcher: Arc<Dispatcher>,
    max_size: usize,
    ttl: Duration,
    /// Deadline budget handed to each background synthesis.
    synth_timeout: Duration,
    generation: AtomicU64,
}

enum Claim {
    Hit(Bytes),
    Wait(u64, watch::Receiver<Outcome>),
    Absent,
}

impl TtsCache {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        max_size: usize,
        ttl: Duration,
        synth_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                hits: 0,
                misses: 0,
                evictions_lru: 0,
                evictions_ttl: 0,
            }),
            dispatcher,
            max_size: max_size.max(1),
            ttl,
            synth_timeout,
            generation: AtomicU64::new(0),
        })
    }

    /// Fire-and-forget prefetch. Idempotent: a fingerprint that is already
    /// pending or completed is left alone.
    pub fn submit(self: &Arc<Self>, model: &str, voice: &str, text: &str) {
        let fp = fingerprint(model, voice, text);
        let spawn = {
            let mut inner = self.inner.lock().unwrap();
            if inner.entries.contains(&fp) {
                None
            } else {
                let (generation, tx, _rx) =
                    self.insert_pending(&mut inner, fp.clone(), model, voice, text, 0);
                Some((generation, tx))
            }
        };
        if let Some((generation, tx)) = spawn {
            debug!(fingerprint = %&fp[..12], text_len = text.chars().count(), "prefetching sentence");
            self.spawn_synthesis(fp, model, voice, text, generation, tx);
        }
    }

    /// Resolve a fingerprint to audio, waiting for in-flight synthesis or
    /// starting one if the fingerprint is absent.
    pub async fn get(
        self: &Arc<Self>,
        model: &str,
        voice: &str,
        text: &str,
        deadline: Instant,
    ) -> Result<Bytes, ProxyError> {
        let fp = fingerprint(model, voice, text);

        let (generation, rx) = {
            let mut inner = self.inner.lock().unwrap();
            let claim = match inner.entries.get_mut(&fp) {
                Some(entry) => match entry.audio.clone() {
                    Some(bytes) => Claim::Hit(bytes),
                    None => {
                        entry.waiters += 1;
                        Claim::Wait(entry.generation, entry.tx.subscribe())
                    }
                },
                None => Claim::Absent,
            };
            match claim {
                Claim::Hit(bytes) => {
                    inner.hits += 1;
                    return Ok(bytes);
                }
                Claim::Wait(generation, rx) => {
                    inner.hits += 1;
                    (generation, rx)
                }
                Claim::Absent => {
                    inner.misses += 1;
                    let (generation, tx, rx) =
                        self.insert_pending(&mut inner, fp.clone(), model, voice, text, 1);
                    drop(inner);
                    self.spawn_synthesis(fp.clone(), model, voice, text, generation, tx);
                    (generation, rx)
                }
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = tokio::time::timeout(remaining, wait_outcome(rx)).await;
        self.release_waiter(&fp, generation);

        match outcome {
            Err(_) => Err(ProxyError::Timeout),
            Ok(Outcome::Ready(bytes)) => Ok(bytes),
            Ok(Outcome::Failed(msg)) => Err(ProxyError::Upstream(msg)),
            Ok(Outcome::Pending) => Err(ProxyError::Internal(
                "completion signal resolved while still pending".to_string(),
            )),
        }
    }

    /// Drop every entry. In-flight synthesizers keep running; their results
    /// are discarded when they try to store into a missing generation.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.entries.len();
        inner.entries.clear();
        info!(cleared = n, "cache cleared");
        n
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let pending = inner.entries.iter().filter(|(_, e)| e.is_pending()).count();
        let waiters = inner
            .entries
            .iter()
            .map(|(_, e)| e.waiters as u64)
            .sum();
        CacheStats {
            size: inner.entries.len(),
            pending,
            waiters,
            hits: inner.hits,
            misses: inner.misses,
            evictions_lru: inner.evictions_lru,
            evictions_ttl: inner.evictions_ttl,
        }
    }

    /// Remove completed entries older than the TTL. Pending entries are
    /// exempt. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| !e.is_pending() && e.created_at.elapsed() > self.ttl)
            .map(|(fp, e)| {
                debug!(
                    model = %e.model,
                    voice = %e.voice,
                    text_len = e.text.chars().count(),
                    "expiring cached audio"
                );
                fp.clone()
            })
            .collect();
        for fp in &expired {
            inner.entries.pop(fp);
        }
        inner.evictions_ttl += expired.len() as u64;
        expired.len()
    }

    /// Start the background TTL sweeper. Holds only a weak handle so the
    /// cache can still be dropped.
    pub fn start_sweeper(self: &Arc<Self>) {
        let period = (self.ttl / 10).max(Duration::from_secs(30));
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    info!(removed, "TTL sweep evicted expired audio");
                }
            }
        });
    }

    fn insert_pending(
        &self,
        inner: &mut CacheInner,
        fp: String,
        model: &str,
        voice: &str,
        text: &str,
        waiters: u32,
    ) -> (u64, watch::Sender<Outcome>, watch::Receiver<Outcome>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(Outcome::Pending);
        inner.entries.push(
            fp,
            Entry {
                generation,
                model: model.to_string(),
                voice: voice.to_string(),
                text: text.to_string(),
                created_at: Instant::now(),
                completed_at: None,
                audio: None,
                waiters,
                tx: tx.clone(),
            },
        );
        (generation, tx, rx)
    }

    fn spawn_synthesis(
        self: &Arc<Self>,
        fp: String,
        model: &str,
        voice: &str,
        text: &str,
        generation: u64,
        tx: watch::Sender<Outcome>,
    ) {
        let cache = Arc::clone(self);
        let (model, voice, text) = (model.to_string(), voice.to_string(), text.to_string());
        tokio::spawn(async move {
            let deadline = Instant::now() + cache.synth_timeout;
            let result = cache.dispatcher.synthesize(&model, &voice, &text, deadline).await;
            cache.store_result(&fp, generation, &tx, result);
        });
    }

    fn store_result(
        &self,
        fp: &str,
        generation: u64,
        tx: &watch::Sender<Outcome>,
        result: Result<Bytes, ProxyError>,
    ) {
        {
            let mut inner = self.inner.lock().unwrap();
            let owned = inner
                .entries
                .peek(fp)
                .is_some_and(|e| e.generation == generation);
            match (&result, owned) {
                (Ok(bytes), true) => {
                    // get_mut also moves the entry to the LRU tail.
                    let entry = inner.entries.get_mut(fp).unwrap();
                    entry.audio = Some(bytes.clone());
                    entry.completed_at = Some(Instant::now());
                    let elapsed = entry
                        .completed_at
                        .map(|done| done.duration_since(entry.created_at))
                        .unwrap_or_default();
                    debug!(
                        fingerprint = %&fp[..12],
                        elapsed_ms = elapsed.as_millis() as u64,
                        "synthesis completed"
                    );
                    Self::evict_overflow(&mut inner, self.max_size);
                }
                (Err(_), true) => {
                    // Failed entries never rest in the map; the next submit
                    // retries fresh.
                    inner.entries.pop(fp);
                }
                (_, false) => {
                    debug!(fingerprint = %&fp[..12], "discarding orphaned synthesis result");
                }
            }
        }
        // Broadcast outside the lock; waiters that predate a clear still
        // learn the outcome through the channel they already hold.
        match result {
            Ok(bytes) => {
                tx.send_replace(Outcome::Ready(bytes));
            }
            Err(e) => {
                tx.send_replace(Outcome::Failed(e.to_string()));
            }
        }
    }

    /// Evict from the LRU head until within bounds, skipping (and keeping)
    /// pending entries.
    fn evict_overflow(inner: &mut CacheInner, max_size: usize) {
        let mut pending_stash = Vec::new();
        let mut evicted = 0u64;
        while inner.entries.len() > max_size {
            match inner.entries.pop_lru() {
                Some((fp, entry)) if entry.is_pending() => pending_stash.push((fp, entry)),
                Some(_) => evicted += 1,
                None => break,
            }
        }
        for (fp, entry) in pending_stash {
            inner.entries.push(fp, entry);
        }
        inner.evictions_lru += evicted;
    }

    fn release_waiter(&self, fp: &str, generation: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.peek_mut(fp) {
            if entry.generation == generation {
                entry.waiters = entry.waiters.saturating_sub(1);
            }
        }
    }
}

async fn wait_outcome(mut rx: watch::Receiver<Outcome>) -> Outcome {
    loop {
        let current = rx.borrow_and_update().clone();
        if !matches!(current, Outcome::Pending) {
            return current;
        }
        if rx.changed().await.is_err() {
            return Outcome::Failed("synthesis task went away".to_string());
        }
    }
}
