//! Adaptive per-host rate limiting (E1) and adaptive worker concurrency (E2).
//!
//! Both limiters react to the same signal — an upstream 429 — but at different
//! granularities: the rate limiter slows down requests to one host, the
//! concurrency limiter shrinks the whole worker pool's ceiling regardless of
//! which host triggered it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

const FLOOR_MS: f64 = 500.0;
const CEILING_MS: f64 = 120_000.0;
const SUCCESS_STREAK_FOR_DECAY: u32 = 10;
const DECAY_FACTOR: f64 = 0.9;
const SUCCESS_STREAK_FOR_RAISE: usize = 25;
const RAISE_COOLDOWN: Duration = Duration::from_secs(60);

struct HostState {
    current_delay_ms: f64,
    consecutive_429s: u32,
    consecutive_successes: u32,
    last_429_at: Option<Instant>,
    last_request_at: Option<Instant>,
}

impl HostState {
    fn new(base_delay_ms: f64) -> Self {
        Self { current_delay_ms: base_delay_ms, consecutive_429s: 0, consecutive_successes: 0, last_429_at: None, last_request_at: None }
    }
}

/// Per-host adaptive delay, keyed on host string (`url.host_str()`).
pub struct HostRateLimiter {
    base_delay_ms: f64,
    hosts: Mutex<HashMap<String, HostState>>,
}

impl HostRateLimiter {
    pub fn new(base_delay_ms: u64) -> Self {
        Self { base_delay_ms: base_delay_ms as f64, hosts: Mutex::new(HashMap::new()) }
    }

    /// Sleep the amount of time required before the next request to `host`,
    /// then marks the request as having happened now.
    pub async fn wait_for(&self, host: &str) {
        let wait_ms = {
            let mut hosts = self.hosts.lock().await;
            let state = hosts.entry(host.to_string()).or_insert_with(|| HostState::new(self.base_delay_ms));
            let now = Instant::now();
            let elapsed_ms = state.last_request_at.map(|t| now.duration_since(t).as_secs_f64() * 1000.0).unwrap_or(f64::MAX);
            let remaining = (state.current_delay_ms - elapsed_ms).max(0.0);
            state.last_request_at = Some(now);
            remaining
        };

        if wait_ms > 0.0 {
            let jittered_ms = wait_ms * jitter_multiplier();
            tokio::time::sleep(Duration::from_millis(jittered_ms.round() as u64)).await;
        }
    }

    /// Record a successful (non-429) response from `host`.
    pub async fn record_success(&self, host: &str) {
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.to_string()).or_insert_with(|| HostState::new(self.base_delay_ms));
        state.consecutive_429s = 0;
        state.consecutive_successes += 1;
        if state.consecutive_successes >= SUCCESS_STREAK_FOR_DECAY {
            state.current_delay_ms = (state.current_delay_ms * DECAY_FACTOR).max(FLOOR_MS);
            state.consecutive_successes = 0;
        }
    }

    /// Record a 429 response from `host`, escalating its delay.
    pub async fn record_rate_limit(&self, host: &str) {
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.to_string()).or_insert_with(|| HostState::new(self.base_delay_ms));
        state.consecutive_successes = 0;

        let now = Instant::now();
        let since_last_429 = state.last_429_at.map(|t| now.duration_since(t));
        let mut multiplier = match since_last_429 {
            Some(d) if d < Duration::from_secs(30) => 2.0,
            Some(d) if d < Duration::from_secs(60) => 1.5,
            _ => 1.25,
        };

        state.consecutive_429s += 1;
        if state.consecutive_429s >= 3 {
            multiplier *= 1.5;
        }

        state.current_delay_ms = (state.current_delay_ms * multiplier).min(CEILING_MS);
        state.last_429_at = Some(now);
    }
}

/// xorshift-ish mixer over the current time and a monotonic counter. Good
/// enough for jitter; not meant to be cryptographically random.
fn jitter_multiplier() -> f64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().subsec_nanos() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = nanos.wrapping_mul(2_654_435_761).wrapping_add(counter.wrapping_mul(40_503));
    let fraction = (mixed % 1_000_000) as f64 / 1_000_000.0;
    0.8 + fraction * 0.4
}

/// Adaptive worker pool size, bounded to `[min_workers, max_workers]`.
///
/// Wraps a [`Semaphore`] whose permit count tracks the current ceiling:
/// raising the ceiling adds permits, lowering it forgets them.
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    ceiling: AtomicUsize,
    min_workers: usize,
    max_workers: usize,
    success_streak: AtomicUsize,
    last_rate_limit_at: Mutex<Option<Instant>>,
}

impl ConcurrencyLimiter {
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        let min_workers = min_workers.max(1);
        let max_workers = max_workers.max(min_workers);
        Self {
            semaphore: Arc::new(Semaphore::new(min_workers)),
            ceiling: AtomicUsize::new(min_workers),
            min_workers,
            max_workers,
            success_streak: AtomicUsize::new(0),
            last_rate_limit_at: Mutex::new(None),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling.load(Ordering::SeqCst)
    }

    /// Acquire a permit that can be held across a `tokio::spawn`ed task.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.semaphore.clone().acquire_owned().await.expect("concurrency semaphore is never closed")
    }

    pub async fn record_success(&self) {
        let streak = self.success_streak.fetch_add(1, Ordering::SeqCst) + 1;
        if streak < SUCCESS_STREAK_FOR_RAISE {
            return;
        }
        let window_clear = {
            let last = self.last_rate_limit_at.lock().await;
            last.map(|t| t.elapsed() >= RAISE_COOLDOWN).unwrap_or(true)
        };
        if !window_clear {
            return;
        }
        let ceiling = self.ceiling.load(Ordering::SeqCst);
        if ceiling < self.max_workers {
            self.ceiling.store(ceiling + 1, Ordering::SeqCst);
            self.semaphore.add_permits(1);
        }
        self.success_streak.store(0, Ordering::SeqCst);
    }

    pub async fn record_rate_limit(&self) {
        self.success_streak.store(0, Ordering::SeqCst);
        *self.last_rate_limit_at.lock().await = Some(Instant::now());

        let ceiling = self.ceiling.load(Ordering::SeqCst);
        let new_ceiling = (ceiling / 2).max(self.min_workers);
        if new_ceiling < ceiling {
            let forgotten = self.semaphore.forget_permits(ceiling - new_ceiling);
            self.ceiling.store(ceiling - forgotten, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_waits_close_to_configured_delay() {
        let limiter = HostRateLimiter::new(50);
        let host = "docs.example.com";
        let start = Instant::now();
        limiter.wait_for(host).await;
        limiter.wait_for(host).await;
        assert!(start.elapsed() >= Duration::from_millis(35));
    }

    #[tokio::test]
    async fn rate_limiter_escalates_on_429_and_decays_on_success() {
        let limiter = HostRateLimiter::new(1000);
        let host = "docs.example.com";
        limiter.record_rate_limit(host).await;
        let delay_after_429 = {
            let hosts = limiter.hosts.lock().await;
            hosts.get(host).unwrap().current_delay_ms
        };
        assert!(delay_after_429 > 1000.0);

        for _ in 0..10 {
            limiter.record_success(host).await;
        }
        let delay_after_decay = {
            let hosts = limiter.hosts.lock().await;
            hosts.get(host).unwrap().current_delay_ms
        };
        assert!(delay_after_decay < delay_after_429);
    }

    #[tokio::test]
    async fn concurrency_limiter_raises_ceiling_after_success_streak() {
        let limiter = ConcurrencyLimiter::new(1, 4);
        assert_eq!(limiter.ceiling(), 1);
        for _ in 0..25 {
            limiter.record_success().await;
        }
        assert_eq!(limiter.ceiling(), 2);
    }

    #[tokio::test]
    async fn concurrency_limiter_halves_ceiling_on_rate_limit() {
        let limiter = ConcurrencyLimiter::new(1, 8);
        for _ in 0..25 {
            limiter.record_success().await;
        }
        for _ in 0..25 {
            limiter.record_success().await;
        }
        assert!(limiter.ceiling() >= 2);
        let before = limiter.ceiling();
        limiter.record_rate_limit().await;
        assert!(limiter.ceiling() <= before / 2 + 1);
        assert!(limiter.ceiling() >= 1);
    }
}
