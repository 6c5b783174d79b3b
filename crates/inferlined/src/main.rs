//! inferlined — the inferline serving daemon.
//!
//! Single binary that assembles the serving core:
//! - Result cache
//! - Executor slot pool + model binding
//! - Batching queue
//! - Metrics aggregator + resource sampler
//! - Autoscaler
//! - Alert evaluator
//! - HTTP API
//!
//! # Usage
//!
//! ```text
//! inferlined serve --config /etc/inferline/inferline.toml --port 8000
//! inferlined check-config --config /etc/inferline/inferline.toml
//! ```

mod sampler;
mod serve;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use inferline_core::ServeConfig;

#[derive(Parser)]
#[command(name = "inferlined", about = "inferline model-serving daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true, env = "INFERLINE_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve predictions over HTTP.
    Serve {
        /// Configuration file; defaults apply when omitted.
        #[arg(long, short, env = "INFERLINE_CONFIG")]
        config: Option<PathBuf>,

        /// Port to listen on, overriding `server.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Restarts of this process so far, overriding `metrics.restart_count`.
        #[arg(long, env = "INFERLINE_RESTART_COUNT")]
        restart_count: Option<u32>,
    },
    /// Validate a configuration file and print the resolved settings.
    CheckConfig {
        #[arg(long, short)]
        config: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,inferlined=debug,inferline=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            port,
            restart_count,
        } => {
            let mut config = match config {
                Some(path) => ServeConfig::from_file(&path)?,
                None => ServeConfig::default(),
            };
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(n) = restart_count {
                config.metrics.restart_count = n;
            }
            serve::run(config).await
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = ServeConfig::from_file(path)?;
    let slots = config.executor.slot_count();
    if slots == 0 {
        anyhow::bail!("executor budget leaves no room for a single slot");
    }
    println!("{}: ok ({slots} executor slots)", path.display());
    println!();
    print!("{}", config.to_toml_string()?);
    Ok(())
}
