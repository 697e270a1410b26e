//! KGX CLI - Command-line interface
//!
//! Usage:
//!   kgx extract <path> [--config <file>] [--workers <n>]
//!   kgx check-config <file>

use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;

use kgx_core::{
    BatchEnvelope, EngineConfig, EventPayload, EventState, EventType, LexiconModel, Result,
    TokenBatch,
};
use kgx_engine::{AutoScaler, ExtractionEngine, ResourceManager, Subscriber};

#[derive(Parser)]
#[command(name = "kgx")]
#[command(about = "Knowledge-graph extraction engine CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract triples from a text file
    Extract {
        /// Path to a UTF-8 text file
        path: String,

        /// TOML configuration file
        #[arg(long)]
        config: Option<String>,

        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Validate a configuration file
    CheckConfig {
        /// TOML configuration file
        path: String,
    },
}

/// Prints each graph event as a JSON line
struct StdoutSink;

#[async_trait]
impl Subscriber for StdoutSink {
    async fn handle_event(&self, state: &EventState) -> Result<()> {
        if let EventPayload::Graph(triple) = &state.payload {
            println!("{}", serde_json::to_string(triple).map_err(anyhow::Error::from)?);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout-sink"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Extract {
            path,
            config,
            workers,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(workers) = workers {
                config.num_workers = workers;
            }

            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                        tracing_subscriber::EnvFilter::new(&config.logging.level)
                    }),
                )
                .init();

            extract(path, config).await?;
        }
        Commands::CheckConfig { path } => {
            let config = EngineConfig::from_file(&path)?;
            config.validate()?;
            println!("configuration ok: {path}");
        }
    }

    Ok(())
}

fn load_config(path: Option<&str>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    Ok(config.with_env_override()?)
}

async fn extract(path: String, config: EngineConfig) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&path)?;
    let num_workers = config.num_workers;

    let manager = Arc::new(ResourceManager::with_host_probe(1, num_workers.max(1)));
    let mut scaler = AutoScaler::new(manager);

    let model = Arc::new(LexiconModel::new());
    let engine = ExtractionEngine::builder(config, model)
        .termination(scaler.termination().clone())
        .build();

    engine.subscribe(EventType::Graph, Arc::new(StdoutSink)).await;

    let producer = engine.producer().map_err(anyhow::Error::from)?;
    producer
        .send(BatchEnvelope::Batch(TokenBatch::new(
            path.clone(),
            vec![text],
        )))
        .await?;
    producer
        .send(BatchEnvelope::FileDone {
            source: path.clone(),
        })
        .await?;
    drop(producer);
    engine.close_input();

    scaler.register(engine.clone(), num_workers);
    scaler.run().await.map_err(anyhow::Error::from)?;

    let snapshot = engine.report().snapshot();
    info!(
        batches = snapshot.batches_processed,
        pairs = snapshot.pairs_generated,
        triples = snapshot.triples_emitted,
        "extraction complete"
    );

    Ok(())
}
