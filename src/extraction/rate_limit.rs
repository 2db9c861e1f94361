//! Token bucket shared by every caller of a rate-limited external capability.
//!
//! Callers `acquire()` a token before each outbound request. When the bucket
//! is empty the caller sleeps until the next token is due instead of sending
//! the request and relying on 429 backpressure.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Slowest refill accepted: one token every 1000 seconds.
const MIN_REFILL_PER_SEC: f64 = 1e-3;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A refilling token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket holding `capacity` tokens, refilled continuously
    /// at `refill_per_sec`.
    ///
    /// Rates below one token per 1000 seconds, and non-finite rates, are
    /// raised to that floor.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        let refill_per_sec = if refill_per_sec.is_finite() {
            refill_per_sec.max(MIN_REFILL_PER_SEC)
        } else {
            MIN_REFILL_PER_SEC
        };
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket allowing `requests_per_minute` sustained with bursts of `burst`.
    pub fn per_minute(requests_per_minute: u32, burst: u32) -> Self {
        Self::new(burst, f64::from(requests_per_minute.max(1)) / 60.0)
    }

    /// Take a token if one is available.
    ///
    /// Returns `None` on success, or the time until the next token is due.
    fn check(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - state.tokens;
            Some(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        self.check().is_none()
    }

    /// Wait until a token is available, then take it.
    pub async fn acquire(&self) {
        while let Some(wait) = self.check() {
            tracing::debug!(
                stage = "rate_limited",
                wait_ms = wait.as_millis() as u64,
                "Waiting for rate limit token"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available, rounded down.
    pub fn available(&self) -> u32 {
        let state = self.state.lock();
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        (state.tokens + elapsed * self.refill_per_sec)
            .min(self.capacity)
            .floor() as u32
    }
}
