use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "fleet-connector")]
#[command(version, about = "Keeps a robot fleet synchronized with a fleet-management platform")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the fleet configuration file
    #[arg(short, long, global = true, default_value = "fleet.yaml", env = "FLEET_CONNECTOR_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a simulated fleet over the in-memory transport until Ctrl-C
    Run {
        /// Stop automatically after this many seconds
        #[arg(long)]
        duration: Option<f64>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write an example configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    // A missing .env file is fine; credentials may come from the real environment.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { duration } => cmd::cmd_run(&cli, *duration)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
