use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use sigdedup::config::Config;
use sigdedup::deduper::Deduper;
use sigdedup::events::{CandidateEvent, SignalRecord};
use sigdedup::pipeline::{Pipeline, RecordSink};

/// Writes each persisted record as one JSON line on stdout.
struct StdoutSink;

#[async_trait::async_trait]
impl RecordSink for StdoutSink {
    async fn persist(&self, record: SignalRecord) -> Result<()> {
        println!("{}", serde_json::to_string(&record)?);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config)?;

    info!("Starting sigdedup v{}", env!("CARGO_PKG_VERSION"));

    let deduper = Arc::new(Deduper::new(config.engine)?);
    let pipeline = Pipeline::new(deduper.clone(), Arc::new(StdoutSink));

    let (tx, rx) = mpsc::channel::<CandidateEvent>(1024);

    // Reader task: one JSON event per stdin line, until EOF or ctrl-c
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<CandidateEvent>(&line) {
                                Ok(event) => {
                                    if tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!("skipping malformed event: {}", e),
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!("stdin read error: {}", e);
                            break;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }
    });

    pipeline.run(rx).await?;
    reader.await?;

    let stats = deduper.stats().await;
    info!(
        processed = stats.events_processed,
        admitted = stats.admitted,
        suppressed = stats.suppressed,
        summaries = stats.aggregate_emitted,
        rate_limited = stats.rate_limited,
        "sigdedup shutting down"
    );
    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    // Create log directory if it doesn't exist
    std::fs::create_dir_all(&config.logging.directory)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("sigdedup")
        .filename_suffix("log")
        .build(&config.logging.directory)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .json();

    // Records go to stdout, logs to stderr
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(())
}
