use std::{ops::Deref, sync::Arc};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::args::RateLimiterArgs;

#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    /// Sustained refill rate in tokens per second
    pub refill_per_second: f64,
    /// Bucket capacity (burst size)
    pub burst: u32,
}

impl From<RateLimiterArgs> for RateLimiterConfig {
    fn from(args: RateLimiterArgs) -> Self {
        Self {
            refill_per_second: args.client_qps,
            burst: args.client_burst,
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            refill_per_second: 10.0,
            burst: 20,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiterInner {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

/// In-process token bucket throttling calls to the cluster store.
///
/// The bucket starts full and refills continuously at `refill_per_second`,
/// never exceeding `burst` tokens.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

impl Deref for RateLimiter {
    type Target = RateLimiterInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Tokens available after `elapsed` of refill, capped at the burst size.
fn refilled(tokens: f64, elapsed: Duration, config: &RateLimiterConfig) -> f64 {
    let replenished = tokens + elapsed.as_secs_f64() * config.refill_per_second;
    replenished.min(config.burst as f64)
}

/// How long until one full token has accumulated.
fn time_until_token(tokens: f64, config: &RateLimiterConfig) -> Duration {
    let missing = (1.0 - tokens).max(0.0);
    if config.refill_per_second <= 0.0 {
        return Duration::from_secs(1);
    }
    Duration::from_secs_f64(missing / config.refill_per_second)
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                state: Mutex::new(BucketState {
                    tokens: config.burst as f64,
                    last_refill: Instant::now(),
                }),
                config,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    /// Takes one token, sleeping until the bucket has refilled when empty.
    /// Returns the number of tokens left in the bucket.
    pub async fn acquire(&self) -> f64 {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.tokens = refilled(state.tokens, now - state.last_refill, &self.config);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return state.tokens;
                }
                time_until_token(state.tokens, &self.config)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Takes one token only if immediately available.
    pub async fn try_acquire(&self) -> Option<f64> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.tokens = refilled(state.tokens, now - state.last_refill, &self.config);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Some(state.tokens)
        } else {
            None
        }
    }

    pub async fn tokens_remaining(&self) -> f64 {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.tokens = refilled(state.tokens, now - state.last_refill, &self.config);
        state.last_refill = now;
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(qps: f64, burst: u32) -> RateLimiterConfig {
        RateLimiterConfig {
            refill_per_second: qps,
            burst,
        }
    }

    #[test]
    fn refill_is_capped_at_burst() {
        let c = config(10.0, 5);
        assert_eq!(refilled(0.0, Duration::from_secs(60), &c), 5.0);
    }

    #[test]
    fn refill_accumulates_linearly() {
        let c = config(2.0, 100);
        let tokens = refilled(1.0, Duration::from_millis(1500), &c);
        assert!((tokens - 4.0).abs() < 1e-9);
    }

    #[test]
    fn wait_time_covers_missing_fraction() {
        let c = config(4.0, 10);
        assert_eq!(time_until_token(0.0, &c), Duration::from_millis(250));
        assert_eq!(time_until_token(0.5, &c), Duration::from_millis(125));
        assert_eq!(time_until_token(1.5, &c), Duration::ZERO);
    }

    #[tokio::test]
    async fn burst_is_served_immediately() {
        // No refill at all: the arithmetic stays exact.
        let limiter = RateLimiter::new(config(0.0, 2));
        assert_eq!(limiter.acquire().await, 1.0);
        assert_eq!(limiter.acquire().await, 0.0);
        assert!(limiter.try_acquire().await.is_none());
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let limiter = RateLimiter::new(config(1000.0, 1));
        limiter.acquire().await;
        // The bucket is empty now; at 1000 qps this resolves after ~1 ms.
        limiter.acquire().await;
    }

    #[tokio::test]
    async fn try_acquire_refuses_when_drained() {
        let limiter = RateLimiter::new(config(0.001, 1));
        assert!(limiter.try_acquire().await.is_some());
        assert!(limiter.try_acquire().await.is_none());
    }
}
