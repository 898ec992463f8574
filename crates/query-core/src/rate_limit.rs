//! Admission control: a global concurrency semaphore combined with
//! per-key steady-rate token buckets.
//!
//! `Acquire` blocks until both constraints admit and honours cancellation;
//! on cancellation it returns without having consumed a permit or a
//! token, which falls out naturally from Rust's drop semantics — the
//! local `OwnedSemaphorePermit` held across the `select!` is dropped
//! (and the slot released) the moment an early-return path is taken.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{ClassifiedError, Layer};

/// Admission-control configuration. Zero means "unbounded"/"unmetered"
/// for the respective axis, per spec §4.3.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub max_concurrent_requests: u64,
    pub requests_per_minute_per_key: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 0,
            requests_per_minute_per_key: 0,
        }
    }
}

/// Steady-rate token bucket: burst capacity equal to the configured rate,
/// refilling continuously at `rate / 60` tokens per second.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(requests_per_minute: u64) -> Self {
        let capacity = requests_per_minute as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_next_token(&self) -> Duration {
        if self.refill_per_sec <= 0.0 {
            return Duration::from_secs(u64::MAX / 2);
        }
        let deficit = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.refill_per_sec)
    }
}

/// Opaque handle proving admission was granted. Must be released exactly
/// once via [`RateLimiter::release`].
pub struct AdmissionTicket {
    permit: Option<OwnedSemaphorePermit>,
    key: String,
    released: bool,
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if !self.released && self.permit.is_some() {
            tracing::warn!(key = %self.key, "admission ticket dropped without explicit release");
        }
    }
}

pub struct RateLimiter {
    semaphore: Option<Arc<Semaphore>>,
    max_concurrent: u64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    requests_per_minute_per_key: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let semaphore = if config.max_concurrent_requests == 0 {
            None
        } else {
            Some(Arc::new(Semaphore::new(config.max_concurrent_requests as usize)))
        };
        Self {
            semaphore,
            max_concurrent: config.max_concurrent_requests,
            buckets: Mutex::new(HashMap::new()),
            requests_per_minute_per_key: config.requests_per_minute_per_key,
        }
    }

    /// Block until both the global slot and the per-key token are
    /// available, or until `ctx` is cancelled.
    pub async fn acquire(
        &self,
        ctx: &CancellationToken,
        key: &str,
    ) -> Result<AdmissionTicket, ClassifiedError> {
        let permit = match &self.semaphore {
            Some(sem) => {
                let sem = sem.clone();
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => {
                        return Err(ClassifiedError::cancelled(Layer::Orchestrator, "rate_limiter"));
                    }
                    res = sem.acquire_owned() => Some(res.expect("rate limiter semaphore is never closed")),
                }
            }
            None => None,
        };

        if self.requests_per_minute_per_key > 0 {
            loop {
                let wait = {
                    let mut buckets = self.buckets.lock().await;
                    let bucket = buckets
                        .entry(key.to_string())
                        .or_insert_with(|| TokenBucket::new(self.requests_per_minute_per_key));
                    let now = Instant::now();
                    if bucket.try_take(now) {
                        None
                    } else {
                        Some(bucket.time_until_next_token())
                    }
                };

                match wait {
                    None => break,
                    Some(d) => {
                        tokio::select! {
                            biased;
                            _ = ctx.cancelled() => {
                                return Err(ClassifiedError::cancelled(Layer::Orchestrator, "rate_limiter"));
                            }
                            _ = tokio::time::sleep(d.max(Duration::from_millis(1))) => {}
                        }
                    }
                }
            }
        }

        Ok(AdmissionTicket {
            permit,
            key: key.to_string(),
            released: false,
        })
    }

    /// Return the global slot. Must be called exactly once per successful
    /// `acquire`.
    pub fn release(&self, mut ticket: AdmissionTicket) {
        ticket.released = true;
    }

    /// Number of tickets currently outstanding against the global ceiling.
    /// Returns 0 when the limiter is unbounded (no ceiling is tracked).
    pub fn outstanding(&self) -> usize {
        match &self.semaphore {
            Some(sem) => (self.max_concurrent as usize).saturating_sub(sem.available_permits()),
            None => 0,
        }
    }
}
