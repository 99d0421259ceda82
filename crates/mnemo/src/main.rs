//! Mnemo engine daemon - periodic tier maintenance

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mnemo_engine::config::Config;
use mnemo_engine::error::Result;
use mnemo_engine::events::TracingEventSink;
use mnemo_engine::manager::MemoryManager;
use mnemo_engine::memory::types::Tier;
use mnemo_engine::storage::{InMemoryTier, InMemoryTierConfig, TierSet};

/// Seconds between maintenance checks when not given on the command line
const DEFAULT_TICK_SECONDS: u64 = 5;

/// Mnemo engine - tiered memory consolidation daemon
#[derive(Parser)]
#[command(name = "mnemo-engine")]
#[command(about = "Runs decay, forgetting and promotion across memory tiers")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the maintenance loop until interrupted (default command)
    Run {
        /// Seconds between maintenance checks
        #[arg(long, default_value_t = DEFAULT_TICK_SECONDS)]
        tick_seconds: u64,
    },
    /// Validate the configuration and print it as TOML
    #[command(name = "check-config")]
    CheckConfig,
}

impl Cli {
    /// The requested command; a bare invocation runs the loop with defaults
    fn command_or_default(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run {
            tick_seconds: DEFAULT_TICK_SECONDS,
        })
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command_or_default() {
        Command::Run { tick_seconds } => serve(cli.config, tick_seconds).await,
        Command::CheckConfig => check_config(cli.config),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mnemo_engine=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = config_path {
        tracing::info!("Loading config from: {}", path.display());
        return Config::load(&path);
    }

    let default_paths = [
        dirs::home_dir().map(|h| h.join(".mnemo").join("engine.toml")),
        dirs::config_dir().map(|c| c.join("mnemo").join("engine.toml")),
        Some(PathBuf::from("engine.toml")),
    ];

    for path in default_paths.iter().flatten() {
        if path.exists() {
            tracing::info!("Loading config from: {}", path.display());
            return Config::load(path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

fn check_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;
    println!("{}", config.to_toml_string()?);
    Ok(())
}

fn in_memory_tiers(config: &Config) -> TierSet {
    let build = |tier: Tier| {
        let capacity = config.resource_limits.get(tier).max_items;
        let tier_config = InMemoryTierConfig {
            max_strength: config.strength_model.get(tier).max_strength,
            ..InMemoryTierConfig::default()
        }
        .with_capacity_hint(capacity);
        Arc::new(InMemoryTier::with_config(tier, tier_config))
    };
    TierSet::new(build(Tier::Short), build(Tier::Medium), build(Tier::Long))
}

async fn serve(config_path: Option<PathBuf>, tick_seconds: u64) -> Result<()> {
    tracing::info!("Starting Mnemo engine");

    let config = load_config(config_path)?;
    tracing::debug!("Config loaded: {:?}", config);

    let tiers = in_memory_tiers(&config);
    let manager = MemoryManager::new(config, tiers, Arc::new(TracingEventSink))?;

    let mut ticker = tokio::time::interval(Duration::from_secs(tick_seconds.max(1)));
    tracing::info!(tick_seconds, "Maintenance loop running, press Ctrl-C to stop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(report) = manager.maybe_run_maintenance().await {
                    tracing::info!(
                        decayed = report.total_decayed(),
                        removed = report.total_removed(),
                        consolidated = report.total_consolidated(),
                        errors = report.errors.len(),
                        "Maintenance report"
                    );
                    for error in &report.errors {
                        tracing::warn!(%error, "Maintenance error");
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    let snapshot = manager.capacity_snapshot().await?;
    for (tier, capacity) in &snapshot.tiers {
        tracing::info!(tier = %tier, count = capacity.count, "Final tier occupancy");
    }
    Ok(())
}
