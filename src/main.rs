use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;

use biometric_sentinel::config;
use biometric_sentinel::ingest::load_events;
use biometric_sentinel::models::Event;
use biometric_sentinel::utils::logging::init_logger;
use biometric_sentinel::ScoringService;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Score a JSON array of events and print the verdicts
    Score {
        /// File holding a JSON array of events
        #[arg(short, long)]
        input: PathBuf,

        /// Fuse density and sequence verdicts
        #[arg(long)]
        hybrid: bool,
    },

    /// Feed recorded event logs through the engine in batches
    Replay {
        /// Log file or directory of .json / .log files
        #[arg(short, long)]
        path: PathBuf,

        #[arg(long)]
        hybrid: bool,

        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        /// Only read files whose name contains this string
        #[arg(long)]
        filter: Option<String>,
    },

    /// Print the lifecycle state of every model manager
    Status,
}

#[derive(Debug, Default, Serialize)]
struct ReplaySummary {
    events: usize,
    batches: usize,
    anomalies: usize,
    by_modality: BTreeMap<String, ModalityTally>,
}

#[derive(Debug, Default, Serialize)]
struct ModalityTally {
    events: usize,
    anomalies: usize,
}

impl ReplaySummary {
    fn record(&mut self, modality: &str, is_anomaly: bool) {
        self.events += 1;
        let tally = self.by_modality.entry(modality.to_string()).or_default();
        tally.events += 1;
        if is_anomaly {
            self.anomalies += 1;
            tally.anomalies += 1;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration; it carries the log level
    let config = config::load_config()?;

    // Initialize logging
    init_logger(&config.log_level);
    info!("Model directory: {}", config.model_dir.display());
    let service = ScoringService::new(&config);

    match cli.command {
        Command::Score { input, hybrid } => {
            let raw = fs::read_to_string(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let events: Vec<Event> = serde_json::from_str(&raw)
                .with_context(|| format!("Expected a JSON array of events in {}", input.display()))?;
            info!("Scoring {} events from {}", events.len(), input.display());

            let output = if hybrid {
                serde_json::to_string_pretty(&service.score_hybrid(events).await?)?
            } else {
                serde_json::to_string_pretty(&service.score(events).await?)?
            };
            println!("{}", output);
        }
        Command::Replay {
            path,
            hybrid,
            batch_size,
            filter,
        } => {
            if batch_size == 0 {
                bail!("--batch-size must be at least 1");
            }

            let events = load_events(&path, filter.as_deref())?;
            info!(
                "Replaying {} events in batches of {} ({} mode)",
                events.len(),
                batch_size,
                if hybrid { "hybrid" } else { "density" }
            );

            let mut summary = ReplaySummary::default();
            for batch in events.chunks(batch_size) {
                summary.batches += 1;
                if hybrid {
                    for verdict in service.score_hybrid(batch.to_vec()).await? {
                        summary.record(&verdict.modality, verdict.is_anomaly_combined);
                    }
                } else {
                    for verdict in service.score(batch.to_vec()).await? {
                        summary.record(&verdict.modality, verdict.is_anomaly);
                    }
                }
            }

            info!(
                "Replay finished: {} anomalies in {} events",
                summary.anomalies, summary.events
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Status => {
            let status = service.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
