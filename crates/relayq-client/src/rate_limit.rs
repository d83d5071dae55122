/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Token-bucket rate limiting for throttled publishes.
//!
//! Buckets exist per org and optionally per `(org, user)`; the org bucket
//! is drained first. The backpressure controller decides *when* a publish
//! must pass through here (stages 2+ for the affected priorities); the
//! buckets decide *how long* it waits.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use relayq_config::ProducerConfig;

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub tokens_per_sec: f64,
    pub bucket_size: u32,
}

/// Token bucket over a monotonic clock with async waits.
pub struct TokenBucket {
    tokens_per_sec: f64,
    bucket_size: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    #[must_use]
    pub fn new(config: TokenBucketConfig) -> TokenBucket {
        TokenBucket {
            tokens_per_sec: config.tokens_per_sec.max(0.0),
            bucket_size: f64::from(config.bucket_size).max(0.0),
            state: Mutex::new(BucketState {
                tokens: f64::from(config.bucket_size),
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        if self.tokens_per_sec > 0.0 {
            state.tokens = (state.tokens + elapsed * self.tokens_per_sec).min(self.bucket_size);
        }
    }

    /// Acquire one token, waiting for a refill when the bucket is dry.
    /// Returns the time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Duration::ZERO;
        }
        if self.tokens_per_sec <= 0.0 {
            // A zero rate means the bucket is disabled, not infinite delay.
            return Duration::ZERO;
        }
        let needed = 1.0 - state.tokens;
        let delay = Duration::from_secs_f64(needed / self.tokens_per_sec);
        tokio::time::sleep(delay).await;
        self.refill(&mut state);
        state.tokens = (state.tokens - 1.0).max(0.0);
        delay
    }
}

/// Per-org and per-user buckets. Org buckets apply first, then user.
pub struct AsyncRateLimiter {
    org_config: Option<TokenBucketConfig>,
    user_config: Option<TokenBucketConfig>,
    org_buckets: Mutex<HashMap<String, std::sync::Arc<TokenBucket>>>,
    user_buckets: Mutex<HashMap<String, std::sync::Arc<TokenBucket>>>,
}

impl AsyncRateLimiter {
    #[must_use]
    pub fn new(
        org_config: Option<TokenBucketConfig>,
        user_config: Option<TokenBucketConfig>,
    ) -> AsyncRateLimiter {
        AsyncRateLimiter {
            org_config,
            user_config,
            org_buckets: Mutex::new(HashMap::new()),
            user_buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn org_bucket(&self, org_id: &str) -> Option<std::sync::Arc<TokenBucket>> {
        let config = self.org_config?;
        let mut buckets = self.org_buckets.lock().await;
        Some(
            buckets
                .entry(org_id.to_string())
                .or_insert_with(|| std::sync::Arc::new(TokenBucket::new(config)))
                .clone(),
        )
    }

    async fn user_bucket(&self, org_id: &str, user_id: &str) -> Option<std::sync::Arc<TokenBucket>> {
        let config = self.user_config?;
        let mut buckets = self.user_buckets.lock().await;
        Some(
            buckets
                .entry(format!("{org_id}:{user_id}"))
                .or_insert_with(|| std::sync::Arc::new(TokenBucket::new(config)))
                .clone(),
        )
    }

    /// Acquire from the org bucket then the user bucket. Returns the total
    /// wait, which is also recorded on the throttle metrics.
    pub async fn acquire(&self, org_id: &str, user_id: &str) -> Duration {
        let mut waited = Duration::ZERO;
        if let Some(bucket) = self.org_bucket(org_id).await {
            waited += bucket.acquire().await;
        }
        if let Some(bucket) = self.user_bucket(org_id, user_id).await {
            waited += bucket.acquire().await;
        }
        if waited > Duration::ZERO {
            metrics::counter!("rate_limit_throttled_total").increment(1);
            metrics::histogram!("rate_limit_wait_seconds").record(waited.as_secs_f64());
        }
        waited
    }
}

/// Build the limiter from config; `None` when rate limiting is disabled or
/// no bucket is configured.
#[must_use]
pub fn build_rate_limiter(config: &ProducerConfig) -> Option<AsyncRateLimiter> {
    if !config.rate_limit_enabled {
        return None;
    }
    let org = (config.org_tokens_per_sec > 0.0 && config.org_bucket_size > 0).then(|| {
        TokenBucketConfig {
            tokens_per_sec: config.org_tokens_per_sec,
            bucket_size: config.org_bucket_size,
        }
    });
    let user = (config.user_tokens_per_sec > 0.0 && config.user_bucket_size > 0).then(|| {
        TokenBucketConfig {
            tokens_per_sec: config.user_tokens_per_sec,
            bucket_size: config.user_bucket_size,
        }
    });
    if org.is_none() && user.is_none() {
        return None;
    }
    Some(AsyncRateLimiter::new(org, user))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_grants_up_to_burst_without_wait() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            tokens_per_sec: 10.0,
            bucket_size: 3,
        });
        for _ in 0..3 {
            assert_eq!(bucket.acquire().await, Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn test_bucket_waits_when_dry() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            tokens_per_sec: 1_000.0,
            bucket_size: 1,
        });
        assert_eq!(bucket.acquire().await, Duration::ZERO);
        let waited = bucket.acquire().await;
        assert!(waited > Duration::ZERO, "second acquire should wait");
        assert!(waited < Duration::from_millis(100), "wait should be ~1ms at 1000/s");
    }

    #[tokio::test]
    async fn test_zero_rate_does_not_block() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            tokens_per_sec: 0.0,
            bucket_size: 1,
        });
        assert_eq!(bucket.acquire().await, Duration::ZERO);
        assert_eq!(bucket.acquire().await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_limiter_isolates_orgs() {
        let limiter = AsyncRateLimiter::new(
            Some(TokenBucketConfig {
                tokens_per_sec: 1_000.0,
                bucket_size: 1,
            }),
            None,
        );
        // Draining acme's bucket must not slow globex.
        limiter.acquire("acme", "u").await;
        let waited = limiter.acquire("globex", "u").await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[test]
    fn test_build_respects_disabled_flag() {
        let mut config = ProducerConfig::default();
        config.rate_limit_enabled = false;
        assert!(build_rate_limiter(&config).is_none());
    }

    #[test]
    fn test_build_requires_a_configured_bucket() {
        let mut config = ProducerConfig::default();
        config.org_tokens_per_sec = 0.0;
        config.user_tokens_per_sec = 0.0;
        assert!(build_rate_limiter(&config).is_none());
        config.org_tokens_per_sec = 10.0;
        assert!(build_rate_limiter(&config).is_some());
    }
}
