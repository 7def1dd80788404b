mod config_commands;
mod job_commands;
mod next_commands;
mod node;
mod node_commands;

use std::path::{Path, PathBuf};

use {
    anyhow::Result,
    cadence_config::CadenceConfig,
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "cadence", about = "Cadence, cluster job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of ./cadence.toml and the user config dir).
    #[arg(long, global = true, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a scheduler node (default when no subcommand is provided).
    Run,
    /// Print upcoming execution times of a schedule.
    Next(next_commands::NextArgs),
    /// Manage stored job definitions.
    Jobs {
        #[command(subcommand)]
        action: job_commands::JobAction,
    },
    /// Sweep once and print this node's scheduling stats as JSON.
    Stats {
        /// Also print metrics in Prometheus text format.
        #[arg(long)]
        prometheus: bool,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Load the config file (explicit path or discovered), then apply
/// `CADENCE_*` environment overrides.
pub(crate) fn load_config(path: Option<&Path>) -> Result<CadenceConfig> {
    let config = match path {
        Some(path) => cadence_config::load_config(path)?,
        None => cadence_config::discover_and_load(),
    };
    Ok(cadence_config::apply_env_overrides(config)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "cadence starting");

    let config_path = cli.config.as_deref();
    match cli.command {
        None | Some(Commands::Run) => node_commands::run(load_config(config_path)?, config_path).await,
        Some(Commands::Next(args)) => next_commands::handle_next(args),
        Some(Commands::Jobs { action }) => {
            job_commands::handle_jobs(action, &load_config(config_path)?).await
        },
        Some(Commands::Stats { prometheus }) => {
            node_commands::stats(load_config(config_path)?, prometheus).await
        },
        Some(Commands::Config { action }) => config_commands::handle_config(action, config_path),
    }
}
