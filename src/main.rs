//! Shelver - files finished downloads into a Plex-style library.
//!
//! Configuration comes from the environment (and `.env`); see
//! `shelver::config::Config` for the recognized variables.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use shelver::app;
use shelver::config::{Config, LogFormat};
use shelver::services::logging;

#[derive(Parser, Debug)]
#[command(name = "shelver", author, version, about, disable_help_subcommand = true)]
struct Cli {
    /// Log output format: pretty or json (overrides LOG_FORMAT)
    #[arg(long, global = true, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch SOURCE_DIR and organize items as they finish downloading
    Watch {
        /// Also queue everything already present in the source directory
        #[arg(long)]
        scan_existing: bool,
    },
    /// Organize the given files or folders once and exit
    Organize {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Print the placement plan without touching the filesystem
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the effective configuration and check for ffprobe
    Check,
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    logging::init(config.log_format)?;
    let config = Arc::new(config);

    match cli.command {
        Command::Watch { scan_existing } => {
            tracing::info!("Starting shelver");
            app::run_watch(config, scan_existing).await?;
        }
        Command::Organize { paths, dry_run } => {
            let failures = app::run_organize(config, paths, dry_run).await?;
            if failures > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Check => app::check(&config).await?,
    }

    Ok(ExitCode::SUCCESS)
}
