//! previewd - on-demand preview builds
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use previewd::cli::{Cli, Commands};
use previewd::config::{Config, ConfigManager};
use previewd::error::PreviewResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> PreviewResult<()> {
    let cli = Cli::parse();

    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config);
    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::Serve(args) => previewd::cli::commands::serve(args, &config).await,
        Commands::Resolve(args) => previewd::cli::commands::resolve(args, &config).await,
        Commands::Config(args) => {
            previewd::cli::commands::config(args, &config_manager, &config).await
        }
    }
}

/// 0 = info, 1 = debug, 2+ = trace; `RUST_LOG` wins when set
fn init_logging(verbose: u8, config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("previewd=info"),
        1 => EnvFilter::new("previewd=debug"),
        _ => EnvFilter::new("previewd=trace"),
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}
