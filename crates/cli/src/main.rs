//! Green core controller CLI
//!
//! A command-line tool for starting the controller's monitoring loop,
//! inspecting core states and usage, and switching cores by hand.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cores, usage};

/// Green core controller CLI
#[derive(Parser)]
#[command(name = "gcctl")]
#[command(author, version, about = "CLI for the green core controller", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via GREENCORE_API_URL env var)
    #[arg(long, env = "GREENCORE_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the monitoring loop (no-op if already running)
    Begin,

    /// Show core states for the fleet or a single core
    Status {
        /// Core id in the form <host>:<index>
        #[arg(long, short)]
        core: Option<String>,
    },

    /// List sleeping cores
    Sleeping,

    /// Toggle a dynamic core between awake and asleep
    Switch {
        /// Core id in the form <host>:<index>
        core_id: String,
    },

    /// Show per-core utilization
    Usage,
}

async fn run(cli: Cli) -> Result<()> {
    let client = client::ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Begin => cores::begin(&client, cli.format).await,
        Commands::Status { core } => cores::status(&client, core, cli.format).await,
        Commands::Sleeping => cores::sleeping(&client, cli.format).await,
        Commands::Switch { core_id } => cores::switch(&client, &core_id, cli.format).await,
        Commands::Usage => usage::show_usage(&client, cli.format).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
