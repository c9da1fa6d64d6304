use serde::{Deserialize, Serialize};
use anyhow::{Result, Context};
use std::path::PathBuf;
use thiserror::Error;

/// Rejected engine configuration. Fatal at construction time; the engine
/// never fails per-event.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("dedup window must be greater than zero")]
    ZeroDedupWindow,
    #[error("bucket width must be greater than zero")]
    ZeroBucketWidth,
    #[error("bucket width {bucket_secs}s exceeds dedup window {window_secs}s")]
    BucketWiderThanWindow { bucket_secs: u64, window_secs: u64 },
    #[error("max retained entries must be greater than zero")]
    ZeroMaxEntries,
    #[error("per-source rate must be greater than zero")]
    ZeroRate,
    #[error("burst capacity must be greater than zero")]
    ZeroBurst,
    #[error("max tracked sources must be greater than zero")]
    ZeroMaxSources,
    #[error("aggregation window must be greater than zero")]
    ZeroAggregationWindow,
    #[error("shard count must be greater than zero")]
    ZeroShards,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

/// Configuration for the dedup engine proper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub dedup: DedupConfig,
    pub rate_limit: RateLimitConfig,
    pub aggregation: AggregationConfig,
    pub fingerprint: FingerprintConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Sliding window during which a fingerprint is considered seen.
    pub window_secs: u64,
    /// Width of each expiry bucket. Zero means auto: 10% of the window with
    /// a 10 second floor.
    pub bucket_secs: u64,
    /// Hard cap on live occurrence entries across all shards.
    pub max_entries: usize,
    /// Number of independent lock domains for the store.
    pub shards: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained events per second admitted per source.
    pub events_per_sec: f64,
    /// Token bucket capacity per source.
    pub burst: u32,
    /// Cap on distinct sources tracked; least-recently-seen sources are
    /// evicted beyond this.
    pub max_sources: usize,
    /// Number of independent lock domains for source buckets.
    pub shards: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub enabled: bool,
    /// Rolling window over which duplicate counts accumulate before one
    /// summary emission.
    pub window_secs: u64,
    /// Whether the initial admitted event counts toward the aggregate, or
    /// counting starts at the first duplicate.
    pub count_admitted: bool,
    /// Hard cap on live aggregation windows.
    pub max_windows: usize,
    /// Number of independent lock domains for aggregation state.
    pub shards: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintConfig {
    /// Detail keys that participate in the content fingerprint. Everything
    /// else in details, and the free-text message, is ignored.
    pub critical_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::find_config_file()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .add_source(config::Environment::with_prefix("SIGDEDUP").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.engine.validate()?;

        Ok(config)
    }

    fn find_config_file() -> Result<PathBuf> {
        let possible_paths = vec![
            PathBuf::from("sigdedup.yaml"),
            PathBuf::from("sigdedup.yml"),
            PathBuf::from("/etc/sigdedup/config.yaml"),
            PathBuf::from("/usr/local/etc/sigdedup/config.yaml"),
        ];

        for path in possible_paths {
            if path.exists() {
                return Ok(path);
            }
        }

        // Create default config if none found
        let default_config = Self::default();
        let config_content = serde_yaml::to_string(&default_config)
            .context("Failed to serialize default config")?;

        std::fs::write("sigdedup.yaml", config_content)
            .context("Failed to write default config")?;

        Ok(PathBuf::from("sigdedup.yaml"))
    }
}

impl EngineConfig {
    /// Validate values the engine cannot operate with. Called once at
    /// construction; per-event calls never revalidate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup.window_secs == 0 {
            return Err(ConfigError::ZeroDedupWindow);
        }
        if self.dedup.max_entries == 0 {
            return Err(ConfigError::ZeroMaxEntries);
        }
        if self.dedup.shards == 0 {
            return Err(ConfigError::ZeroShards);
        }
        let bucket_secs = self.dedup.effective_bucket_secs();
        if bucket_secs == 0 {
            return Err(ConfigError::ZeroBucketWidth);
        }
        if bucket_secs > self.dedup.window_secs {
            return Err(ConfigError::BucketWiderThanWindow {
                bucket_secs,
                window_secs: self.dedup.window_secs,
            });
        }
        if self.rate_limit.events_per_sec <= 0.0 {
            return Err(ConfigError::ZeroRate);
        }
        if self.rate_limit.burst == 0 {
            return Err(ConfigError::ZeroBurst);
        }
        if self.rate_limit.max_sources == 0 {
            return Err(ConfigError::ZeroMaxSources);
        }
        if self.rate_limit.shards == 0 {
            return Err(ConfigError::ZeroShards);
        }
        if self.aggregation.enabled && self.aggregation.window_secs == 0 {
            return Err(ConfigError::ZeroAggregationWindow);
        }
        if self.aggregation.shards == 0 {
            return Err(ConfigError::ZeroShards);
        }
        Ok(())
    }
}

impl DedupConfig {
    /// Resolve the configured bucket width, applying the auto rule when the
    /// value is zero: 10% of the window, floored at 10 seconds, never wider
    /// than the window itself.
    pub fn effective_bucket_secs(&self) -> u64 {
        if self.bucket_secs != 0 {
            return self.bucket_secs;
        }
        let auto = (self.window_secs / 10).max(10);
        auto.min(self.window_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                directory: PathBuf::from("./logs"),
            },
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dedup: DedupConfig {
                window_secs: 60,
                bucket_secs: 0,
                max_entries: 10_000,
                shards: 16,
            },
            rate_limit: RateLimitConfig {
                events_per_sec: 100.0,
                burst: 200,
                max_sources: 1_000,
                shards: 16,
            },
            aggregation: AggregationConfig {
                enabled: true,
                window_secs: 300,
                count_admitted: false,
                max_windows: 10_000,
                shards: 16,
            },
            fingerprint: FingerprintConfig {
                critical_fields: vec![
                    "vulnerabilityID".to_string(),
                    "rule".to_string(),
                    "policy".to_string(),
                    "reason".to_string(),
                    "auditID".to_string(),
                    "checkId".to_string(),
                ],
            },
        }
    }
}
