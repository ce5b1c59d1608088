use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tickvault::config::{CONFIG_ENV, StudyConfig};
use tickvault::pipeline::{self, ALL_SYMBOLS, SignalSource};
use tickvault::report::{StudyReport, ValidationSummary};
use tickvault::{snapshot, validate};

#[derive(Parser)]
#[command(name = "tickvault", version, about = "Trade-tick store and signal study runner")]
struct Cli {
    /// Study config (TOML). Defaults apply when omitted.
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Restrict the run to one symbol.
    #[arg(long, global = true)]
    symbol: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate signals against forward returns and print the report.
    Analyze {
        /// Read signals from this feature-file variant instead of computing them.
        #[arg(long)]
        features: Option<String>,

        /// Do not write a result snapshot.
        #[arg(long)]
        no_snapshot: bool,
    },
    /// Write one feature file per indexed day.
    ComputeSignals,
    /// Check every indexed blob and report missing days.
    Validate,
    /// Re-print the report of the last snapshot.
    Report,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = StudyConfig::resolve(cli.config.as_deref()).context("loading config")?;
    let symbol = cli.symbol.as_deref();
    let started = Instant::now();

    match cli.command {
        Command::Analyze { features, no_snapshot } => {
            let source = features.map_or(SignalSource::Live, SignalSource::Features);
            let study = pipeline::analyze(&config, symbol, &source)?;
            print!("{}", StudyReport(&study));
            if !no_snapshot {
                let snap = snapshot::write_snapshot(&config.data_root, &study)?;
                info!(hash = %snap.object_hash, "saved");
            }
        }
        Command::ComputeSignals => {
            let run = pipeline::compute_signals(&config, symbol)?;
            println!(
                "wrote {} feature files ({} rows) to variant {}",
                run.files, run.rows, config.feature_variant
            );
            if run.summary.failed > 0 {
                bail!("{} feature files could not be written", run.summary.failed);
            }
        }
        Command::Validate => {
            let today = chrono::Local::now().date_naive();
            let report = validate::validate(&config, symbol, today)?;
            print!("{}", ValidationSummary(&report));
            if !report.is_clean() {
                bail!("validation found {} issues", report.issue_count());
            }
        }
        Command::Report => {
            let label = symbol.unwrap_or(ALL_SYMBOLS);
            let (snap, study) = snapshot::read_snapshot(&config.data_root, label)
                .with_context(|| format!("no readable snapshot for {label}"))?;
            info!(hash = %snap.object_hash, timestamp = snap.timestamp, "loaded snapshot");
            print!("{}", StudyReport(&study));
        }
    }

    info!(elapsed_ms = started.elapsed().as_millis() as u64, "done");
    Ok(())
}
