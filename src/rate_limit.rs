// Per-source admission budgets, independent of event content.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Token bucket state for one source.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Token-bucket rate limiter, one bucket per distinct source.
///
/// Buckets are created lazily on first sight of a source and live in sharded
/// LRU caches so that source-identifier churn cannot grow memory without
/// bound. The call never blocks: it is an immediate accept/reject.
pub struct RateLimiter {
    shards: Vec<Mutex<LruCache<String, TokenBucket>>>,
    events_per_sec: f64,
    burst: f64,
}

impl RateLimiter {
    /// Config is assumed validated (`EngineConfig::validate`).
    pub fn new(config: &RateLimitConfig) -> Self {
        let per_shard = (config.max_sources / config.shards).max(1);
        let cap = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..config.shards)
            .map(|_| Mutex::new(LruCache::new(cap)))
            .collect();

        Self {
            shards,
            events_per_sec: config.events_per_sec,
            burst: f64::from(config.burst),
        }
    }

    /// Try to admit one event from `source` at `now`.
    ///
    /// Refills tokens proportional to elapsed time (capped at burst), then
    /// consumes one. Returns false, without consuming, when the budget is
    /// exhausted. An empty source carries no identity and bypasses limiting.
    pub async fn allow(&self, source: &str, now: DateTime<Utc>) -> bool {
        if source.is_empty() {
            return true;
        }

        let mut shard = self.shards[self.shard_for(source)].lock().await;

        if !shard.contains(source) {
            // New source starts with a full burst.
            shard.push(
                source.to_string(),
                TokenBucket {
                    tokens: self.burst,
                    last_refill: now,
                },
            );
        }
        let Some(bucket) = shard.get_mut(source) else {
            return true;
        };

        // Refills are monotonic; a caller clock that stepped backwards adds
        // nothing rather than draining the bucket.
        let elapsed = (now - bucket.last_refill).num_milliseconds() as f64 / 1000.0;
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.events_per_sec).min(self.burst);
            bucket.last_refill = now;
        }

        if bucket.tokens < 1.0 {
            debug!(source, "rate limit exceeded");
            return false;
        }

        bucket.tokens -= 1.0;
        true
    }

    /// Number of sources currently tracked, across all shards.
    pub async fn tracked_sources(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.len();
        }
        total
    }

    fn shard_for(&self, source: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}
