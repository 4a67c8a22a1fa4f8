//! uiverify CLI - Main Entry Point
//!
//! Runs browser verification scenarios and validates scenario files.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use uiverify_cli::commands::{run, validate};
use uiverify_cli::output;

/// uiverify - browser-driven UI verification
#[derive(Parser)]
#[command(name = "uiverify")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Harness configuration file (defaults apply when it does not exist)
    #[arg(long, env = "UIVERIFY_CONFIG", default_value = "uiverify.toml", global = true)]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scenarios in a real browser
    Run(run::RunArgs),

    /// Parse and validate scenarios without running them
    Validate(validate::ValidateArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let ok = match cli.command {
        Commands::Run(args) => run::execute(args, &cli.config, cli.format).await?,
        Commands::Validate(args) => validate::execute(args, cli.format)?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
