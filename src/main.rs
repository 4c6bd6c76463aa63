//! Flowline main entry point
//!
//! Thin launcher: load the configuration, pick the named pipeline, run its
//! server until SIGINT.

use clap::Parser;
use flowline::config::load_config_with_hash;
use flowline::pipelines::{self, PIPELINES};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Flowline: a task-group execution engine for chained crawl pipelines
#[derive(Parser, Debug)]
#[command(name = "flowline")]
#[command(version)]
#[command(about = "Queue-chained crawling pipeline service", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Which pipeline this process runs
    #[arg(short, long, value_name = "NAME")]
    pipeline: String,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    if !PIPELINES.contains(&cli.pipeline.as_str()) {
        anyhow::bail!(
            "unknown pipeline '{}', expected one of: {}",
            cli.pipeline,
            PIPELINES.join(", ")
        );
    }

    tracing::info!("loading configuration from {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)?;
    tracing::info!("configuration loaded (hash: {})", config_hash);

    let registry = Arc::new(pipelines::registry_from_config(&config.platform));
    let server = pipelines::build_server(&cli.pipeline, &config, registry)?;

    tracing::info!("starting pipeline {}", cli.pipeline);
    server.run().await?;
    tracing::info!("pipeline {} stopped", cli.pipeline);
    Ok(())
}

/// Sets up the tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("flowline=info,warn"),
            1 => EnvFilter::new("flowline=debug,info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
