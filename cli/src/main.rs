// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # quotad
//!
//! Server and command line client for the share quota service.
//!
//! ## Commands
//!
//! - `quotad serve` - Run the `quota-sets` API with the expiry sweeper
//! - `quotad quota show|defaults|detail|update|delete` - Talk to a running server
//! - `quotad config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use quotad_cli::commands::{self, ConfigCommand, QuotaCommand};
use quotad_cli::daemon;
use quotad_core::domain::quota_config::QuotaConfigManifest;

/// quotad - hierarchical share quotas with two-phase reservations
#[derive(Parser)]
#[command(name = "quotad")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "QUOTAD_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// HTTP API port (default: from config, else 8786)
    #[arg(long, global = true, env = "QUOTAD_PORT")]
    port: Option<u16>,

    /// HTTP API host (default: from config, else 127.0.0.1)
    #[arg(long, global = true, env = "QUOTAD_HOST")]
    host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "QUOTAD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text or json)
    #[arg(long, global = true, env = "QUOTAD_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the quota API server
    #[command(name = "serve")]
    Serve,

    /// Query and change quotas on a running server
    #[command(name = "quota")]
    Quota {
        #[command(subcommand)]
        command: QuotaCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    match cli.command.take() {
        Some(Commands::Serve) => {
            let config = QuotaConfigManifest::load_or_default(cli.config.clone())
                .context("Failed to load configuration")?;

            let logging = config
                .spec
                .observability
                .as_ref()
                .and_then(|o| o.logging.as_ref());
            let level = cli
                .log_level
                .clone()
                .or_else(|| logging.map(|l| l.level.clone()))
                .unwrap_or_else(|| "info".to_string());
            let format = cli
                .log_format
                .clone()
                .or_else(|| logging.map(|l| l.format.clone()))
                .unwrap_or_else(|| "text".to_string());
            init_logging(&level, &format)?;

            info!("Starting quotad server");
            daemon::start_server(config, cli.host, cli.port).await
        }
        Some(Commands::Quota { command }) => {
            init_cli_logging(&cli)?;
            let host = cli.host.unwrap_or_else(|| "127.0.0.1".to_string());
            let port = cli.port.unwrap_or(8786);
            commands::quota::handle_command(command, &host, port).await
        }
        Some(Commands::Config { command }) => {
            init_cli_logging(&cli)?;
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

fn init_cli_logging(cli: &Cli) -> Result<()> {
    init_logging(
        cli.log_level.as_deref().unwrap_or("warn"),
        cli.log_format.as_deref().unwrap_or("text"),
    )
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().init(),
        "text" => builder.compact().init(),
        other => anyhow::bail!("Unknown log format '{}': expected 'text' or 'json'", other),
    }

    Ok(())
}
