use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

use steward::run::Classification;

#[derive(Parser)]
#[command(name = "steward")]
#[command(version, about = "Change-request orchestrator with verified phase chains")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to steward.toml. Defaults to ./steward.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the state root (run records, lease table, archive).
    #[arg(long, global = true)]
    pub state_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a change-request ticket through a phase chain
    Run {
        /// External ticket reference (e.g. an issue number)
        #[arg(long)]
        ticket: String,

        /// Chain name; defaults from the classification
        #[arg(long)]
        chain: Option<String>,

        /// chore, bug, or feature
        #[arg(long, default_value = "feature")]
        classification: Classification,
    },
    /// Resume an interrupted run from its last completed phase
    Resume {
        run_id: String,
    },
    /// Mark a run for termination at the next phase boundary
    Cancel {
        run_id: String,
    },
    /// Show one run, or all non-archived runs
    Status {
        run_id: Option<String>,
    },
    /// Classify every run's health; exit non-zero unless all are healthy
    Health {
        /// Archive runs whose ticket is closed and merge confirmed
        #[arg(long)]
        archive: bool,
    },
    /// Inspect a failed run and offer forced completion (with confirmation)
    Recover {
        run_id: String,
    },
    /// List active leases
    Leases {
        /// Reclaim stale leases whose owners are no longer running
        #[arg(long)]
        sweep: bool,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "steward=debug" } else { "steward=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cmd::load_config(&cli)?;

    match &cli.command {
        Commands::Run {
            ticket,
            chain,
            classification,
        } => cmd::cmd_run(config, ticket, chain.as_deref(), *classification).await,
        Commands::Resume { run_id } => cmd::cmd_resume(config, run_id).await,
        Commands::Cancel { run_id } => cmd::cmd_cancel(config, run_id),
        Commands::Status { run_id } => cmd::cmd_status(config, run_id.as_deref()),
        Commands::Health { archive } => {
            let exit_code = cmd::cmd_health(config, *archive).await?;
            std::process::exit(exit_code);
        }
        Commands::Recover { run_id } => cmd::cmd_recover(config, run_id).await,
        Commands::Leases { sweep } => cmd::cmd_leases(config, *sweep),
    }
}
