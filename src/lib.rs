// Security signal deduplication engine
pub mod config;
pub mod events;
pub mod fingerprint;
pub mod rate_limit;
pub mod store;
pub mod aggregate;
pub mod deduper;
pub mod pipeline;

pub use config::{Config, ConfigError, EngineConfig};
pub use deduper::{DedupStats, Deduper};
pub use events::{CandidateEvent, Decision, SignalRecord};
