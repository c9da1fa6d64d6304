// Orchestrating façade: one decide() call per candidate event, composing
// rate limiting, fingerprinting, windowed dedup and aggregation.

use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::aggregate::Aggregator;
use crate::config::{ConfigError, EngineConfig};
use crate::events::{CandidateEvent, Decision};
use crate::fingerprint::FingerprintBuilder;
use crate::rate_limit::RateLimiter;
use crate::store::{Observed, WindowedStore};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Running counters for decisions made by the engine.
#[derive(Debug, Clone, Default)]
pub struct DedupStats {
    pub events_processed: u64,
    pub admitted: u64,
    pub suppressed: u64,
    pub aggregate_emitted: u64,
    pub rate_limited: u64,
}

/// The event deduplication engine.
///
/// Construct once at process start and share the handle with every producer;
/// there is no ambient singleton. All state is process-local and rebuilt
/// from empty on restart, so duplicates may briefly reappear after one.
pub struct Deduper {
    limiter: RateLimiter,
    fingerprints: FingerprintBuilder,
    store: WindowedStore,
    aggregator: Aggregator,
    count_admitted: bool,
    stats: RwLock<DedupStats>,
    last_cleanup: Mutex<Instant>,
}

impl Deduper {
    /// Build an engine from validated configuration. Invalid values are
    /// rejected here, once; the per-event path is infallible.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        info!(
            window_secs = config.dedup.window_secs,
            bucket_secs = config.dedup.effective_bucket_secs(),
            max_entries = config.dedup.max_entries,
            rate = config.rate_limit.events_per_sec,
            burst = config.rate_limit.burst,
            aggregation = config.aggregation.enabled,
            "dedup engine initialized"
        );

        Ok(Self {
            limiter: RateLimiter::new(&config.rate_limit),
            fingerprints: FingerprintBuilder::new(config.fingerprint.clone()),
            store: WindowedStore::new(&config.dedup),
            aggregator: Aggregator::new(&config.aggregation),
            count_admitted: config.aggregation.count_admitted,
            stats: RwLock::new(DedupStats::default()),
            last_cleanup: Mutex::new(Instant::now()),
        })
    }

    /// Decide the fate of one candidate event using the current wall clock.
    pub async fn decide(&self, event: &CandidateEvent) -> Decision {
        self.decide_at(event, Utc::now()).await
    }

    /// Decide the fate of one candidate event at an explicit instant.
    ///
    /// The timestamp is expected to be monotonic from the caller's view;
    /// an out-of-order timestamp still matches its duplicate but never moves
    /// the entry's last-seen backward.
    pub async fn decide_at(&self, event: &CandidateEvent, now: DateTime<Utc>) -> Decision {
        // Cheap rejection first: the fingerprint is never computed for an
        // event that is over its source budget.
        if !self.limiter.allow(&event.source, now).await {
            self.record(|s| s.rate_limited += 1).await;
            return Decision::RateLimited;
        }

        let fp = self.fingerprints.fingerprint(event);

        let decision = match self.store.observe(fp, now).await {
            Observed::New => {
                if self.count_admitted {
                    self.aggregator.note_admitted(fp, now).await;
                }
                debug!(fingerprint = %fp, source = %event.source, "event admitted");
                Decision::Admit
            }
            Observed::Seen { .. } => match self.aggregator.record_duplicate(fp, now).await {
                Some(emit) => Decision::AggregateEmit {
                    count: emit.count,
                    first_seen: emit.window_start,
                    last_seen: emit.last_seen,
                },
                None => Decision::Suppress,
            },
        };

        match &decision {
            Decision::Admit => self.record(|s| s.admitted += 1).await,
            Decision::Suppress => self.record(|s| s.suppressed += 1).await,
            Decision::AggregateEmit { .. } => self.record(|s| s.aggregate_emitted += 1).await,
            Decision::RateLimited => {}
        }

        self.cleanup_if_needed(now).await;

        decision
    }

    /// Snapshot of the decision counters.
    pub async fn stats(&self) -> DedupStats {
        self.stats.read().await.clone()
    }

    async fn record(&self, update: impl FnOnce(&mut DedupStats)) {
        let mut stats = self.stats.write().await;
        stats.events_processed += 1;
        update(&mut stats);
    }

    /// Interval-gated maintenance: sweep idle aggregation windows and drain
    /// expired store buckets in every shard, including shards that receive
    /// no traffic and so never expire inline.
    async fn cleanup_if_needed(&self, now: DateTime<Utc>) {
        let mut last_cleanup = self.last_cleanup.lock().await;
        if last_cleanup.elapsed() < CLEANUP_INTERVAL {
            return;
        }
        *last_cleanup = Instant::now();
        drop(last_cleanup);

        self.aggregator.cleanup(now).await;
        self.store.expire(now).await;

        let entries = self.store.len().await;
        let windows = self.aggregator.len().await;
        let sources = self.limiter.tracked_sources().await;
        info!(entries, windows, sources, "dedup engine cleanup");
    }
}
