//! cirrusd — the Cirrus autoscaler binary.
//!
//! Offline tooling around the autoscaler core:
//! - `validate` parses and checks an autoscaler config
//! - `plan` runs one dry-run scheduling pass over a JSON cluster file
//!
//! # Usage
//!
//! ```text
//! cirrusd validate --config autoscaler.toml
//! cirrusd plan --config autoscaler.toml --snapshot cluster.json
//! cirrusd plan --config autoscaler.toml --snapshot cluster.json --tick
//! ```

mod plan;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use cirrus_core::AutoscalerConfig;
use cirrus_reconciler::Reconciler;

#[derive(Parser)]
#[command(name = "cirrusd", about = "Cirrus cluster autoscaler")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check an autoscaler config file.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run one scheduling pass and print the decision as JSON.
    Plan {
        #[arg(long)]
        config: PathBuf,

        /// JSON file with `instances` and `snapshot`.
        #[arg(long)]
        snapshot: PathBuf,

        /// Run a full reconcile tick on an in-memory store and print the
        /// resulting actions instead of the raw scheduler reply.
        #[arg(long)]
        tick: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Plan {
            config,
            snapshot,
            tick,
        } => {
            let config = AutoscalerConfig::from_file(&config)?;
            let input = plan::load_input(&snapshot)?;
            let output = if tick {
                serde_json::to_string_pretty(&plan::tick(&config, &input)?)?
            } else {
                serde_json::to_string_pretty(&plan::schedule(&config, &input)?)?
            };
            println!("{output}");
            Ok(())
        }
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,cirrusd=debug,cirrus=debug"))?;
    // Logs go to stderr so plan output stays parseable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let config = AutoscalerConfig::from_file(&path)?;
    let reconciler = Reconciler::new(&config)?;
    for (name, machine) in reconciler.machine_types() {
        info!(
            machine_type = %name,
            min = machine.min_worker_nodes,
            max = machine.max_worker_nodes,
            hash = %machine.config_hash(),
            "machine type"
        );
    }
    info!(
        path = %path.display(),
        machine_types = reconciler.machine_types().len(),
        max_worker_nodes = config.max_worker_nodes(),
        "config is valid"
    );
    Ok(())
}
