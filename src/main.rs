#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::Parser;
use release_bot::{daemon, Commands, Config};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// Chat-driven release agent: `/status` and serialized `/update` deploys for
/// an allow-listed set of operators.
#[derive(Parser, Debug)]
#[command(name = "release-bot")]
#[command(version)]
#[command(about = "Trigger repository deploys from chat.", long_about = None)]
struct Cli {
    /// TOML config file (default: ~/.release-bot/config.toml if present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging - respects RUST_LOG, defaults to INFO. Stdout is reserved for
    // replies in console mode.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = match Config::load(cli.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            return Err(e).context("release-bot cannot start");
        }
    };

    match cli.command {
        Commands::Run => daemon::run(config).await,
        Commands::Console { identity } => daemon::run_console(config, identity).await,
        Commands::Status => {
            let result = daemon::run_status_once(&config).await;
            println!("{}", result.output);
            if !result.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Deploy => {
            // Notifications, including the transcript, are printed as they go.
            if !daemon::run_deploy_once(&config).await.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Config => {
            println!("{config}");
            Ok(())
        }
    }
}
