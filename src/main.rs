//! Operator entry point for spawnwatch.
//!
//! The map service client is supplied by the embedding application through
//! `ScannerBuilder::build`, so this binary covers the offline side: checking
//! a configuration and inspecting what the store has learned so far.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use spawnwatch::scanner::estimator::Confidence;
use spawnwatch::scanner::geo::Bounds;
use spawnwatch::scanner::{DeadlineEstimator, ScanConfig, SightingStore, SpawnRegistry, SqliteStore};
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "spawnwatch", about = "Offline tools for the spawnwatch scanner")]
struct Cli {
    /// TOML configuration file (defaults are used when omitted)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Database URL, overrides the one in the configuration file
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Validate the configuration and report the scheduling capacity
    Check,
    /// Summarize the spawn points and deadline samples in the store
    Inspect,
}

impl Cli {
    fn load_config(&self) -> Result<ScanConfig> {
        let mut config = match &self.config {
            Some(path) => ScanConfig::from_file(path)?,
            None => {
                warn!("No config file given, using defaults");
                ScanConfig::default()
            }
        };
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    match cli.command {
        Commands::Check => check(&config),
        Commands::Inspect => inspect(&config).await,
    }
}

/// Validate the configuration and report the scheduling capacity it implies.
fn check(config: &ScanConfig) -> Result<()> {
    config.validate()?;
    let slots = config.worker_count();
    let usable = config.identities.iter().filter(|i| i.is_usable()).count();
    let bounds = Bounds::from_corners(config.map_start, config.map_end);

    info!("Area {} with {} worker slots", bounds.fingerprint(), slots);
    info!(
        "{} identities configured, {} usable, {} proxies",
        config.identities.len(),
        usable,
        config.proxies.len()
    );
    info!(
        "{} bootstrap points at {}m spacing",
        bounds.bootstrap_points(config.bootstrap_radius).len(),
        config.bootstrap_radius
    );
    if usable < slots {
        bail!("{} usable identities cannot fill {} slots", usable, slots);
    }
    if usable == slots {
        warn!("No spare identities: swaps will wait until one is released");
    }
    info!("Configuration OK");
    Ok(())
}

/// Summarize the persisted spawn points and deadline samples.
async fn inspect(config: &ScanConfig) -> Result<()> {
    let store = SqliteStore::new(&config.database_url).await?;
    if !store.health_check().await? {
        bail!("store at {} is not healthy", config.database_url);
    }

    let registry = SpawnRegistry::new(Bounds::from_corners(config.map_start, config.map_end));
    registry.load_records(store.load_spawns().await.context("Failed to load spawn points")?);

    let estimator = DeadlineEstimator::new(config.last_migration);
    let samples = store.all_samples().await.context("Failed to load seen samples")?;
    let mut spawn_ids: Vec<_> = samples.iter().map(|(id, _)| *id).collect();
    spawn_ids.sort_unstable();
    spawn_ids.dedup();
    estimator.load(samples);

    let (mut tight, mut wide) = (0usize, 0usize);
    for spawn_id in &spawn_ids {
        match estimator.estimate(*spawn_id, None).confidence {
            Confidence::Tight => tight += 1,
            Confidence::Wide | Confidence::Unsampled => wide += 1,
        }
    }

    info!(
        "{} timed spawns, {} untimed spawns, {} cell points",
        registry.timed_len(),
        registry.mystery_len(),
        registry.cell_point_len()
    );
    info!(
        "{} spawns with samples: {} tight windows, {} wide or unsampled",
        estimator.sampled_spawns(),
        tight,
        wide
    );
    Ok(())
}
