//! TTS backend pool
//!
//! Tracks per-backend load and health, gates concurrency, and puts
//! repeatedly failing backends into a timed cooldown so the dispatcher
//! stops offering them traffic they will only drop.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ProxyError;

/// Consecutive failures before a backend is put into cooldown.
const COOLDOWN_THRESHOLD: u32 = 3;

/// First cooldown period; doubles per further failure up to the ceiling.
const COOLDOWN_BASE_SECS: u64 = 30;

/// Cooldown ceiling.
const COOLDOWN_MAX_SECS: u64 = 300;

#[derive(Debug)]
struct BackendState {
    url: String,
    max_concurrent: u32,
    in_flight: u32,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
}

/// Point-in-time backend snapshot for `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStat {
    pub url: String,
    pub in_flight: u32,
    pub max_concurrent: u32,
    pub consecutive_failures: u32,
    pub cooling_down: bool,
    pub total_requests: u64,
    pub total_failures: u64,
}

/// Pool of TTS backends with slot-gated acquisition.
#[derive(Debug)]
pub struct BackendPool {
    inner: Mutex<Vec<BackendState>>,
    notify: Notify,
}

/// A held backend slot. Dropping it releases the slot; success/failure
/// reporting is explicit because only the dispatcher can classify the
/// HTTP outcome.
#[derive(Debug)]
pub struct BackendLease {
    pool: Arc<BackendPool>,
    index: usize,
    url: String,
}

impl BackendPool {
    pub fn new(urls: &[String], max_concurrent: u32) -> Arc<Self> {
        let backends = urls
            .iter()
            .map(|url| BackendState {
                url: url.clone(),
                max_concurrent,
                in_flight: 0,
                consecutive_failures: 0,
                cooldown_until: None,
                total_requests: 0,
                total_failures: 0,
            })
            .collect();
        Arc::new(Self {
            inner: Mutex::new(backends),
            notify: Notify::new(),
        })
    }

    /// Acquire the least-loaded healthy backend, waiting for a slot (or a
    /// cooldown expiry) up to `deadline`.
    pub async fn acquire(self: &Arc<Self>, deadline: Instant) -> Result<BackendLease, ProxyError> {
        let mut notified = std::pin::pin!(self.notify.notified());
        loop {
            // Register interest before checking, so a release that lands
            // between the check and the await still wakes us.
            notified.as_mut().enable();
            let next_expiry = {
                let mut inner = self.inner.lock().unwrap();
                match Self::select(&inner) {
                    Some(index) => {
                        let b = &mut inner[index];
                        b.in_flight += 1;
                        b.total_requests += 1;
                        return Ok(BackendLease {
                            pool: Arc::clone(self),
                            index,
                            url: b.url.clone(),
                        });
                    }
                    None => Self::earliest_cooldown_expiry(&inner),
                }
            };

            let wake_at = next_expiry.map_or(deadline, |e| e.min(deadline));
            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(wake_at) => {
                    if Instant::now() >= deadline {
                        return Err(ProxyError::Timeout);
                    }
                }
            }
            notified.set(self.notify.notified());
        }
    }

    /// Selection policy: skip cooling backends and full backends, then pick
    /// the fewest in-flight; ties broken by fewest consecutive failures,
    /// then fewest total requests.
    fn select(backends: &[BackendState]) -> Option<usize> {
        let now = Instant::now();
        let mut best: Option<usize> = None;
        for (i, b) in backends.iter().enumerate() {
            if b.cooldown_until.is_some_and(|until| until > now) {
                continue;
            }
            if b.in_flight >= b.max_concurrent {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(j) => {
                    let cur = &backends[j];
                    let candidate = (b.in_flight, b.consecutive_failures, b.total_requests);
                    let incumbent = (cur.in_flight, cur.consecutive_failures, cur.total_requests);
                    if candidate < incumbent {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }
        best
    }

    fn earliest_cooldown_expiry(backends: &[BackendState]) -> Option<Instant> {
        let now = Instant::now();
        backends
            .iter()
            .filter_map(|b| b.cooldown_until)
            .filter(|&until| until > now)
            .min()
    }

    fn release(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner[index].in_flight = inner[index].in_flight.saturating_sub(1);
        drop(inner);
        self.notify.notify_waiters();
    }

    fn report_success(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        let b = &mut inner[index];
        b.consecutive_failures = 0;
        b.cooldown_until = None;
        drop(inner);
        self.notify.notify_waiters();
    }

    fn report_failure(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        let b = &mut inner[index];
        b.consecutive_failures += 1;
        b.total_failures += 1;
        if b.consecutive_failures >= COOLDOWN_THRESHOLD {
            let exp = (b.consecutive_failures - COOLDOWN_THRESHOLD).min(4);
            let secs = (COOLDOWN_BASE_SECS << exp).min(COOLDOWN_MAX_SECS);
            b.cooldown_until = Some(Instant::now() + std::time::Duration::from_secs(secs));
            tracing::warn!(
                url = %b.url,
                failures = b.consecutive_failures,
                cooldown_secs = secs,
                "TTS backend entering cooldown"
            );
        }
    }

    /// Snapshot for the ops surface; never blocks on I/O.
    pub fn stats(&self) -> Vec<BackendStat> {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        inner
            .iter()
            .map(|b| BackendStat {
                url: b.url.clone(),
                in_flight: b.in_flight,
                max_concurrent: b.max_concurrent,
                consecutive_failures: b.consecutive_failures,
                cooling_down: b.cooldown_until.is_some_and(|until| until > now),
                total_requests: b.total_requests,
                total_failures: b.total_failures,
            })
            .collect()
    }
}

impl BackendLease {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn report_success(&self) {
        self.pool.report_success(self.index);
    }

    pub fn report_failure(&self) {
        self.pool.report_failure(self.index);
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(n: usize, max_concurrent: u32) -> Arc<BackendPool> {
        let urls: Vec<String> = (0..n).map(|i| format!("http://tts{}:8000", i)).collect();
        BackendPool::new(&urls, max_concurrent)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[tokio::test]
    async fn test_least_loaded_selection() {
        let pool = pool(2, 3);
        let a = pool.acquire(soon()).await.unwrap();
        let b = pool.acquire(soon()).await.unwrap();
        assert_ne!(a.url(), b.url());
    }

    #[tokio::test]
    async fn test_concurrency_gate_and_release() {
        let pool = pool(1, 1);
        let lease = pool.acquire(soon()).await.unwrap();
        let err = pool.acquire(soon()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout));

        drop(lease);
        assert!(pool.acquire(soon()).await.is_ok());
        let stats = pool.stats();
        assert_eq!(stats[0].in_flight, 1);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_cap() {
        let pool = pool(2, 2);
        let mut leases = Vec::new();
        for _ in 0..4 {
            leases.push(pool.acquire(soon()).await.unwrap());
        }
        for stat in pool.stats() {
            assert!(stat.in_flight <= stat.max_concurrent);
            assert_eq!(stat.in_flight, 2);
        }
        assert!(pool.acquire(soon()).await.is_err());
    }

    #[tokio::test]
    async fn test_failures_tip_the_tie_break() {
        let pool = pool(2, 3);
        {
            let lease = pool.acquire(soon()).await.unwrap();
            assert_eq!(lease.url(), "http://tts0:8000");
            lease.report_failure();
        }
        // Equal in-flight; backend 0 now carries a failure, so 1 wins.
        let lease = pool.acquire(soon()).await.unwrap();
        assert_eq!(lease.url(), "http://tts1:8000");
    }

    #[tokio::test]
    async fn test_cooldown_after_three_failures() {
        let pool = pool(1, 3);
        for _ in 0..3 {
            let lease = pool.acquire(soon()).await.unwrap();
            lease.report_failure();
        }
        let stats = pool.stats();
        assert_eq!(stats[0].consecutive_failures, 3);
        assert!(stats[0].cooling_down);
        assert_eq!(stats[0].total_failures, 3);

        // The only backend is cooling, so acquisition times out.
        let err = pool.acquire(soon()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout));
    }

    #[tokio::test]
    async fn test_success_clears_cooldown() {
        let pool = pool(1, 3);
        for _ in 0..3 {
            let lease = pool.acquire(soon()).await.unwrap();
            lease.report_failure();
        }
        assert!(pool.stats()[0].cooling_down);

        pool.report_success(0);
        let stats = pool.stats();
        assert!(!stats[0].cooling_down);
        assert_eq!(stats[0].consecutive_failures, 0);
        assert!(pool.acquire(soon()).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let pool = pool(1, 1);
        let lease = pool.acquire(soon()).await.unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            pool2.acquire(Instant::now() + Duration::from_secs(2)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);
        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }
}
