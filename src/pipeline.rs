// Channel-driven pipeline: drains candidate events from source adapters,
// runs each through the engine, and hands admitted/summary records to the
// durable-storage sink.

use std::sync::Arc;
use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::deduper::Deduper;
use crate::events::{CandidateEvent, Decision, SignalRecord};

/// Boundary to the durable-storage writer. The engine never performs I/O
/// itself; whatever implements this does.
#[async_trait::async_trait]
pub trait RecordSink: Send + Sync {
    async fn persist(&self, record: SignalRecord) -> Result<()>;
}

pub struct Pipeline {
    deduper: Arc<Deduper>,
    sink: Arc<dyn RecordSink>,
}

impl Pipeline {
    pub fn new(deduper: Arc<Deduper>, sink: Arc<dyn RecordSink>) -> Self {
        Self { deduper, sink }
    }

    /// Consume events until the channel closes. Sink failures are logged and
    /// skipped; one bad write must not stall every producer behind the
    /// channel.
    pub async fn run(&self, mut events: mpsc::Receiver<CandidateEvent>) -> Result<()> {
        info!("pipeline started");

        while let Some(event) = events.recv().await {
            match self.deduper.decide(&event).await {
                Decision::Admit => {
                    let record = SignalRecord::from_admitted(&event);
                    if let Err(e) = self.sink.persist(record).await {
                        error!("failed to persist admitted record: {:#}", e);
                    }
                }
                Decision::AggregateEmit { count, first_seen, last_seen } => {
                    let record = SignalRecord::summary(&event, count, first_seen, last_seen);
                    if let Err(e) = self.sink.persist(record).await {
                        error!("failed to persist summary record: {:#}", e);
                    }
                }
                Decision::Suppress => {
                    debug!(source = %event.source, "duplicate suppressed");
                }
                Decision::RateLimited => {
                    debug!(source = %event.source, "event rate limited");
                }
            }
        }

        let stats = self.deduper.stats().await;
        info!(
            processed = stats.events_processed,
            admitted = stats.admitted,
            suppressed = stats.suppressed,
            summaries = stats.aggregate_emitted,
            rate_limited = stats.rate_limited,
            "pipeline finished"
        );
        Ok(())
    }
}
