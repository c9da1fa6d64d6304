// Rolling-window duplicate counters. Converts silent suppression into one
// periodic summary per fingerprint so recurring conditions stay visible.

use std::collections::HashMap;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::AggregationConfig;
use crate::fingerprint::Fingerprint;

/// One rolling aggregation window for a fingerprint.
#[derive(Debug, Clone)]
struct AggregateWindow {
    window_start: DateTime<Utc>,
    count: u64,
    last_seen: DateTime<Utc>,
}

/// Accumulated duplicates ready for one summary emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateEmit {
    pub count: u64,
    pub window_start: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Windowed duplicate counter, sharded like the store but independent of it:
/// a fingerprint keeps accumulating here even after its dedup entry expires,
/// since aggregation answers "how often recently", not "is this a duplicate".
pub struct Aggregator {
    shards: Vec<Mutex<HashMap<Fingerprint, AggregateWindow>>>,
    window_secs: i64,
    enabled: bool,
    max_per_shard: usize,
}

impl Aggregator {
    /// Config is assumed validated (`EngineConfig::validate`).
    pub fn new(config: &AggregationConfig) -> Self {
        let shards = (0..config.shards).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            window_secs: config.window_secs as i64,
            enabled: config.enabled,
            max_per_shard: (config.max_windows / config.shards).max(1),
        }
    }

    /// Record one duplicate of `fp` at `now`.
    ///
    /// Returns the accumulated count and window bounds when the aggregation
    /// period has elapsed (checked lazily on this call), resetting the
    /// counter for a fresh window. Returns None while the window is still
    /// open, or always when aggregation is disabled.
    pub async fn record_duplicate(&self, fp: Fingerprint, now: DateTime<Utc>) -> Option<AggregateEmit> {
        if !self.enabled {
            return None;
        }

        let mut shard = self.shards[fp.shard(self.shards.len())].lock().await;

        let window = shard.entry(fp).or_insert_with(|| AggregateWindow {
            window_start: now,
            count: 0,
            last_seen: now,
        });

        window.count += 1;
        if now > window.last_seen {
            window.last_seen = now;
        }

        if (now - window.window_start).num_seconds() >= self.window_secs {
            let emit = AggregateEmit {
                count: window.count,
                window_start: window.window_start,
                last_seen: window.last_seen,
            };
            window.count = 0;
            window.window_start = now;
            window.last_seen = now;
            debug!(fingerprint = %fp, count = emit.count, "aggregate window emitted");
            return Some(emit);
        }

        None
    }

    /// Count a freshly admitted fingerprint. Used when the engine is
    /// configured to count the admitted event itself rather than starting at
    /// the first duplicate. A readmission joins the live window if one is
    /// still accumulating; never-emitted counts are not discarded.
    pub async fn note_admitted(&self, fp: Fingerprint, now: DateTime<Utc>) {
        if !self.enabled {
            return;
        }

        let mut shard = self.shards[fp.shard(self.shards.len())].lock().await;
        shard
            .entry(fp)
            .and_modify(|window| {
                window.count += 1;
                if now > window.last_seen {
                    window.last_seen = now;
                }
            })
            .or_insert_with(|| AggregateWindow {
                window_start: now,
                count: 1,
                last_seen: now,
            });
    }

    /// Drop windows with no activity for two aggregation periods, and apply
    /// the hard cap by shedding the oldest windows if a shard is still over
    /// it afterwards.
    pub async fn cleanup(&self, now: DateTime<Utc>) {
        if !self.enabled {
            return;
        }

        let cutoff = now - chrono::Duration::seconds(self.window_secs * 2);
        let mut removed = 0usize;

        for shard in &self.shards {
            let mut shard = shard.lock().await;
            let before = shard.len();
            shard.retain(|_, w| w.last_seen >= cutoff);
            removed += before - shard.len();

            if shard.len() > self.max_per_shard {
                let mut by_age: Vec<(Fingerprint, DateTime<Utc>)> =
                    shard.iter().map(|(fp, w)| (*fp, w.last_seen)).collect();
                by_age.sort_by_key(|(_, seen)| *seen);
                let excess = shard.len() - self.max_per_shard;
                for (fp, _) in by_age.into_iter().take(excess) {
                    shard.remove(&fp);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(removed, "aggregation windows cleaned up");
        }
    }

    /// Number of live aggregation windows across all shards.
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sha2::{Digest, Sha256};

    fn aggregator(window_secs: u64, enabled: bool) -> Aggregator {
        Aggregator::new(&AggregationConfig {
            enabled,
            window_secs,
            count_admitted: false,
            max_windows: 64,
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
    async fn test_no_emission_before_window_elapses() {
        let agg = aggregator(300, true);
        let t0 = Utc::now();

        for i in 0..100 {
            let t = t0 + Duration::seconds(i);
            assert!(agg.record_duplicate(fp("a"), t).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_emission_carries_count_and_bounds() {
        let agg = aggregator(300, true);
        let t0 = Utc::now();

        for i in 0..9 {
            assert!(agg
                .record_duplicate(fp("a"), t0 + Duration::seconds(i))
                .await
                .is_none());
        }

        let emit = agg
            .record_duplicate(fp("a"), t0 + Duration::seconds(300))
            .await
            .expect("window elapsed, must emit");
        assert_eq!(emit.count, 10);
        assert_eq!(emit.window_start, t0);
        assert_eq!(emit.last_seen, t0 + Duration::seconds(300));
    }

    #[tokio::test]
    async fn test_window_resets_after_emission() {
        let agg = aggregator(60, true);
        let t0 = Utc::now();

        agg.record_duplicate(fp("a"), t0).await;
        let t1 = t0 + Duration::seconds(60);
        assert!(agg.record_duplicate(fp("a"), t1).await.is_some());

        // Fresh window: counting restarts
        let t2 = t1 + Duration::seconds(1);
        assert!(agg.record_duplicate(fp("a"), t2).await.is_none());

        let t3 = t1 + Duration::seconds(60);
        let emit = agg.record_duplicate(fp("a"), t3).await.expect("second window");
        assert_eq!(emit.count, 2);
        assert_eq!(emit.window_start, t1);
    }

    #[tokio::test]
    async fn test_disabled_aggregation_never_emits() {
        let agg = aggregator(1, false);
        let t0 = Utc::now();

        for i in 0..100 {
            assert!(agg
                .record_duplicate(fp("a"), t0 + Duration::seconds(i))
                .await
                .is_none());
        }
        assert!(agg.is_empty().await);
    }

    #[tokio::test]
    async fn test_note_admitted_primes_count() {
        let agg = aggregator(60, true);
        let t0 = Utc::now();

        agg.note_admitted(fp("a"), t0).await;
        let emit = agg
            .record_duplicate(fp("a"), t0 + Duration::seconds(60))
            .await
            .expect("window elapsed");
        // Admitted event plus one duplicate
        assert_eq!(emit.count, 2);
    }

    #[tokio::test]
    async fn test_readmission_joins_live_window() {
        let agg = aggregator(300, true);
        let t0 = Utc::now();

        agg.note_admitted(fp("a"), t0).await;
        for i in 1..=3 {
            agg.record_duplicate(fp("a"), t0 + Duration::seconds(i)).await;
        }

        // The dedup entry expired and the fingerprint was readmitted while
        // the aggregation window was still open; the count keeps growing.
        agg.note_admitted(fp("a"), t0 + Duration::seconds(90)).await;

        let emit = agg
            .record_duplicate(fp("a"), t0 + Duration::seconds(300))
            .await
            .expect("window elapsed");
        assert_eq!(emit.count, 6);
        assert_eq!(emit.window_start, t0);
    }

    #[tokio::test]
    async fn test_fingerprints_count_independently() {
        let agg = aggregator(60, true);
        let t0 = Utc::now();

        agg.record_duplicate(fp("a"), t0).await;
        agg.record_duplicate(fp("a"), t0).await;
        agg.record_duplicate(fp("b"), t0).await;

        let t1 = t0 + Duration::seconds(60);
        let emit_a = agg.record_duplicate(fp("a"), t1).await.expect("a emits");
        assert_eq!(emit_a.count, 3);
        let emit_b = agg.record_duplicate(fp("b"), t1).await.expect("b emits");
        assert_eq!(emit_b.count, 2);
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_windows() {
        let agg = aggregator(60, true);
        let t0 = Utc::now();

        for i in 0..20 {
            agg.record_duplicate(fp(&format!("fp-{}", i)), t0).await;
        }
        assert_eq!(agg.len().await, 20);

        // Nothing idle yet
        agg.cleanup(t0 + Duration::seconds(60)).await;
        assert_eq!(agg.len().await, 20);

        // All idle for over two periods
        agg.cleanup(t0 + Duration::seconds(121)).await;
        assert!(agg.is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_enforces_window_cap() {
        let agg = Aggregator::new(&AggregationConfig {
            enabled: true,
            window_secs: 3600,
            count_admitted: false,
            max_windows: 8,
            shards: 1,
        });
        let t0 = Utc::now();

        for i in 0..50 {
            agg.record_duplicate(fp(&format!("fp-{}", i)), t0 + Duration::seconds(i))
                .await;
        }

        agg.cleanup(t0 + Duration::seconds(60)).await;
        assert!(agg.len().await <= 8);
    }
}
