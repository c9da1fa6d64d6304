// Time-bucketed, LRU-bounded duplicate detection within a sliding window.
//
// Two structures per shard reference each entry: the LRU map (lookup and the
// hard memory cap) and the bucket sets (batch expiry). Both mutate under the
// shard lock, so an entry can never exist in one and not the other.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DedupConfig;
use crate::fingerprint::Fingerprint;

/// Occurrence state for one fingerprint. Owned exclusively by the store.
#[derive(Debug, Clone)]
pub struct OccurrenceEntry {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    /// Bucket index of the most recent touch. The entry dies when this
    /// bucket expires or when the LRU cap evicts it, whichever happens first.
    bucket: i64,
}

/// Result of an atomic lookup-or-insert.
#[derive(Debug, Clone)]
pub enum Observed {
    /// First occurrence of this fingerprint within the window.
    New,
    /// A repeat; read-only snapshot of the entry after the touch.
    Seen {
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
        count: u64,
    },
}

struct StoreShard {
    entries: LruCache<Fingerprint, OccurrenceEntry>,
    buckets: HashMap<i64, HashSet<Fingerprint>>,
}

/// Sliding-window occurrence store, sharded by fingerprint.
pub struct WindowedStore {
    shards: Vec<Mutex<StoreShard>>,
    window_secs: i64,
    bucket_secs: i64,
}

impl WindowedStore {
    /// Config is assumed validated (`EngineConfig::validate`).
    pub fn new(config: &DedupConfig) -> Self {
        let per_shard = (config.max_entries / config.shards).max(1);
        let cap = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..config.shards)
            .map(|_| {
                Mutex::new(StoreShard {
                    entries: LruCache::new(cap),
                    buckets: HashMap::new(),
                })
            })
            .collect();

        Self {
            shards,
            window_secs: config.window_secs as i64,
            bucket_secs: config.effective_bucket_secs() as i64,
        }
    }

    /// Atomic check-then-insert for one fingerprint.
    ///
    /// Exactly one of any set of concurrent calls for the same fingerprint
    /// observes `New`; the rest observe `Seen`. Expired buckets are drained
    /// before the lookup, so expiry cost is amortized over calls instead of
    /// needing a timer. The window slides: a repeat touches LRU recency,
    /// bumps the count and moves the entry to the current bucket, so a
    /// fingerprint under sustained duplicates never readmits until a full
    /// quiet window passes. `last_seen` never moves backward on out-of-order
    /// timestamps.
    pub async fn observe(&self, fp: Fingerprint, now: DateTime<Utc>) -> Observed {
        let mut shard = self.shards[fp.shard(self.shards.len())].lock().await;

        self.expire_buckets(&mut shard, now);

        // Stale check: the slack bucket can keep an entry alive slightly past
        // the window, but one quiet for a full window must readmit.
        let stale = shard
            .entries
            .peek(&fp)
            .map(|entry| (now - entry.last_seen).num_seconds() >= self.window_secs)
            .unwrap_or(false);
        if stale {
            self.remove(&mut shard, fp);
            return self.insert(&mut shard, fp, now);
        }

        let bucket_now = self.bucket_index(now);
        let mut rebucket = None;

        // get_mut() also promotes the entry to most-recently-used.
        if let Some(entry) = shard.entries.get_mut(&fp) {
            entry.count += 1;
            if now > entry.last_seen {
                entry.last_seen = now;
                if entry.bucket < bucket_now {
                    rebucket = Some(entry.bucket);
                    entry.bucket = bucket_now;
                }
            }
            let observed = Observed::Seen {
                first_seen: entry.first_seen,
                last_seen: entry.last_seen,
                count: entry.count,
            };
            // The touch slid the entry forward; keep the bucket sets in step.
            if let Some(old_bucket) = rebucket {
                if let Some(set) = shard.buckets.get_mut(&old_bucket) {
                    set.remove(&fp);
                    if set.is_empty() {
                        shard.buckets.remove(&old_bucket);
                    }
                }
                shard.buckets.entry(bucket_now).or_default().insert(fp);
            }
            return observed;
        }

        self.insert(&mut shard, fp, now)
    }

    /// Drain expired buckets in every shard, regardless of traffic. Shards
    /// that receive no observations never drain themselves, so the engine's
    /// periodic maintenance pass calls this.
    pub async fn expire(&self, now: DateTime<Utc>) {
        for shard in &self.shards {
            let mut shard = shard.lock().await;
            self.expire_buckets(&mut shard, now);
        }
    }

    /// Number of live entries across all shards.
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.entries.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn bucket_index(&self, t: DateTime<Utc>) -> i64 {
        t.timestamp().div_euclid(self.bucket_secs)
    }

    fn insert(&self, shard: &mut StoreShard, fp: Fingerprint, now: DateTime<Utc>) -> Observed {
        let bucket = self.bucket_index(now);
        let entry = OccurrenceEntry {
            first_seen: now,
            last_seen: now,
            count: 1,
            bucket,
        };

        // The LRU cap may push out the least-recently-touched entry; it must
        // leave its bucket set in the same mutation.
        if let Some((evicted_fp, evicted)) = shard.entries.push(fp, entry) {
            if evicted_fp != fp {
                debug!(fingerprint = %evicted_fp, "entry evicted by LRU cap");
                if let Some(set) = shard.buckets.get_mut(&evicted.bucket) {
                    set.remove(&evicted_fp);
                    if set.is_empty() {
                        shard.buckets.remove(&evicted.bucket);
                    }
                }
            }
        }
        shard.buckets.entry(bucket).or_default().insert(fp);

        Observed::New
    }

    fn remove(&self, shard: &mut StoreShard, fp: Fingerprint) {
        if let Some(entry) = shard.entries.pop(&fp) {
            if let Some(set) = shard.buckets.get_mut(&entry.bucket) {
                set.remove(&fp);
                if set.is_empty() {
                    shard.buckets.remove(&entry.bucket);
                }
            }
        }
    }

    /// Drop whole buckets that have slid out of the window, removing every
    /// fingerprint they list from the entry map in one pass.
    fn expire_buckets(&self, shard: &mut StoreShard, now: DateTime<Utc>) {
        let cutoff = self.bucket_index(now) - self.window_secs.div_euclid(self.bucket_secs) - 1;

        if shard.buckets.keys().all(|&b| b > cutoff) {
            return;
        }

        let expired: Vec<i64> = shard
            .buckets
            .keys()
            .filter(|&&b| b <= cutoff)
            .copied()
            .collect();

        let mut dropped = 0usize;
        for bucket in expired {
            if let Some(set) = shard.buckets.remove(&bucket) {
                for fp in set {
                    // Only remove the entry if it still belongs to this
                    // bucket; a readmitted fingerprint lives in a newer one.
                    let belongs = shard
                        .entries
                        .peek(&fp)
                        .map(|e| e.bucket == bucket)
                        .unwrap_or(false);
                    if belongs {
                        shard.entries.pop(&fp);
                        dropped += 1;
                    }
                }
            }
        }
        if dropped > 0 {
            debug!(dropped, "expired dedup entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sha2::{Digest, Sha256};

    fn store(window_secs: u64, bucket_secs: u64, max_entries: usize) -> WindowedStore {
        WindowedStore::new(&DedupConfig {
            window_secs,
            bucket_secs,
            max_entries,
            shards: 4,
        })
    }

    fn fp(label: &str) -> Fingerprint {
        let digest = Sha256::digest(label.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Fingerprint::from_bytes(bytes)
    }

    #[tokio::test]
    async fn test_first_observation_is_new() {
        let store = store(60, 10, 100);
        let now = Utc::now();

        assert!(matches!(store.observe(fp("a"), now).await, Observed::New));
        assert!(matches!(
            store.observe(fp("a"), now).await,
            Observed::Seen { count: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_are_independent() {
        let store = store(60, 10, 100);
        let now = Utc::now();

        assert!(matches!(store.observe(fp("a"), now).await, Observed::New));
        assert!(matches!(store.observe(fp("b"), now).await, Observed::New));
    }

    #[tokio::test]
    async fn test_readmit_after_quiet_window() {
        let store = store(60, 10, 100);
        let t0 = Utc::now();

        assert!(matches!(store.observe(fp("a"), t0).await, Observed::New));

        // Quiet past window plus epsilon: treated as new
        let t1 = t0 + Duration::seconds(61);
        assert!(matches!(store.observe(fp("a"), t1).await, Observed::New));
    }

    #[tokio::test]
    async fn test_window_slides_on_each_duplicate() {
        let store = store(60, 10, 100);
        let t0 = Utc::now();

        assert!(matches!(store.observe(fp("a"), t0).await, Observed::New));

        // Touches every 30s keep sliding the window forward, so the entry
        // never goes stale while duplicates keep arriving.
        for i in 1..=10 {
            let t = t0 + Duration::seconds(i * 30);
            assert!(matches!(store.observe(fp("a"), t).await, Observed::Seen { .. }));
        }

        // A full quiet window after the last touch readmits
        let quiet = t0 + Duration::seconds(10 * 30 + 61);
        assert!(matches!(store.observe(fp("a"), quiet).await, Observed::New));
    }

    #[tokio::test]
    async fn test_bucket_expiry_drops_old_entries() {
        let store = store(60, 10, 1000);
        let t0 = Utc::now();

        for i in 0..50 {
            store.observe(fp(&format!("fp-{}", i)), t0).await;
        }
        assert_eq!(store.len().await, 50);

        // Two windows later one maintenance pass drains every shard
        let t1 = t0 + Duration::seconds(130);
        store.expire(t1).await;
        assert_eq!(store.len().await, 0);

        assert!(matches!(store.observe(fp("fresh"), t1).await, Observed::New));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_expiry_spares_recently_touched_entries() {
        let store = store(60, 10, 1000);
        let t0 = Utc::now();

        store.observe(fp("busy"), t0).await;
        store.observe(fp("idle"), t0).await;

        // "busy" keeps getting duplicates; "idle" goes quiet
        store.observe(fp("busy"), t0 + Duration::seconds(50)).await;
        store.observe(fp("busy"), t0 + Duration::seconds(100)).await;

        store.expire(t0 + Duration::seconds(130)).await;
        assert!(matches!(
            store.observe(fp("busy"), t0 + Duration::seconds(131)).await,
            Observed::Seen { .. }
        ));
        assert!(matches!(
            store.observe(fp("idle"), t0 + Duration::seconds(131)).await,
            Observed::New
        ));
    }

    #[tokio::test]
    async fn test_lru_cap_bounds_entry_count() {
        let store = store(3600, 60, 40);
        let now = Utc::now();

        for i in 0..500 {
            store.observe(fp(&format!("fp-{}", i)), now).await;
        }

        assert!(store.len().await <= 40);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_touched() {
        // Single shard so eviction order is fully deterministic
        let store = WindowedStore::new(&DedupConfig {
            window_secs: 3600,
            bucket_secs: 60,
            max_entries: 2,
            shards: 1,
        });
        let now = Utc::now();

        store.observe(fp("old"), now).await;
        store.observe(fp("warm"), now).await;

        // Touch "old" so "warm" becomes least recently used
        let later = now + Duration::seconds(1);
        assert!(matches!(
            store.observe(fp("old"), later).await,
            Observed::Seen { .. }
        ));

        // Third insert evicts "warm"; the freshly touched "old" survives
        store.observe(fp("new"), later).await;
        assert!(matches!(
            store.observe(fp("old"), later).await,
            Observed::Seen { .. }
        ));
        assert!(matches!(store.observe(fp("warm"), later).await, Observed::New));
    }

    #[tokio::test]
    async fn test_out_of_order_timestamp_still_matches() {
        let store = store(60, 10, 100);
        let t0 = Utc::now();

        store.observe(fp("a"), t0).await;

        let earlier = t0 - Duration::seconds(5);
        match store.observe(fp("a"), earlier).await {
            Observed::Seen { last_seen, .. } => {
                // last_seen must not move backward
                assert_eq!(last_seen, t0);
            }
            Observed::New => panic!("out-of-order duplicate must still match"),
        }
    }

    #[tokio::test]
    async fn test_occurrence_count_accumulates() {
        let store = store(60, 10, 100);
        let now = Utc::now();

        store.observe(fp("a"), now).await;
        for expected in 2..=10u64 {
            match store.observe(fp("a"), now).await {
                Observed::Seen { count, .. } => assert_eq!(count, expected),
                Observed::New => panic!("expected duplicate"),
            }
        }
    }
}
