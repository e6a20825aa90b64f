//! clusterlbd: the cluster load-balancer daemon.
//!
//! Single binary that assembles the clusterlb subsystems:
//! - Cluster store (in memory, optionally persisted with redb)
//! - Manager engine behind the MCMP control endpoint
//! - Worker registry and reconciliation watchdog
//! - Per-worker health monitor
//!
//! # Usage
//!
//! ```text
//! clusterlbd serve --config /etc/clusterlb/clusterlb.toml --listen 0.0.0.0:6666
//! ```

mod serve;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use clusterlb_core::ClusterConfig;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,clusterlb=debug";

#[derive(Parser)]
#[command(name = "clusterlbd", about = "Cluster load-balancer daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the control endpoint and run the watchdog.
    Serve {
        /// TOML configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Control listen address, overriding `[listen].control`.
        #[arg(long)]
        listen: Option<String>,

        /// Log output format.
        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&PathBuf>, listen: Option<String>) -> anyhow::Result<ClusterConfig> {
    let mut config = match path {
        Some(path) => ClusterConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ClusterConfig::default(),
    };
    if let Some(listen) = listen {
        config.listen.control = listen;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            log_format,
        } => {
            init_tracing(log_format);
            let config = load_config(config.as_ref(), listen)?;
            serve::run(config).await
        }
    }
}
