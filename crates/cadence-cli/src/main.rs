use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{handle, simulate, topology};

/// Command-line driver for the Cadence replication core
#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Coordinator configuration file (TOML)
    #[arg(long, env = "CADENCE_CONFIG")]
    pub config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a replication scenario on an in-process cluster
    Simulate(simulate::SimulateArgs),
    /// Decode or compose transaction handles
    Handle(handle::HandleArgs),
    /// Inspect a static cluster topology
    Topology(topology::TopologyArgs),
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "cadence_core=debug,cadence_cli=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "cadence_core=warn,cadence_cli=info".into())
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let output = commands::OutputContext {
        json: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Simulate(args) => simulate::execute(args, cli.config.as_deref(), &output),
        Commands::Handle(args) => handle::execute(args, &output),
        Commands::Topology(args) => topology::execute(args, &output),
    }
}
