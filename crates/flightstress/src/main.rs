//! FlightCache stress driver - hammers get-or-load from many threads

mod scenario;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use flightcache::{CacheConfig, CacheManager, MemoryStore, RegistryKind};
use tracing::{info, warn};

use crate::scenario::Scenario;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Registry {
    /// Dedicated lock map
    Keyed,
    /// Locks stored next to the data under `locker@<key>`
    Store,
}

impl From<Registry> for RegistryKind {
    fn from(registry: Registry) -> Self {
        match registry {
            Registry::Keyed => RegistryKind::Keyed,
            Registry::Store => RegistryKind::Store,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON cache config file (flags below override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Concurrent callers per round
    #[arg(long, default_value_t = 10)]
    callers: usize,

    /// Distinct keys the callers spread over
    #[arg(short, long, default_value_t = 1)]
    keys: usize,

    /// Rounds to run; the cache is cleared between rounds
    #[arg(short, long, default_value_t = 1)]
    rounds: usize,

    /// Time each loader execution takes, in milliseconds
    #[arg(long, default_value_t = 200)]
    loader_ms: u64,

    /// Ttl of loaded values, in milliseconds
    #[arg(long, default_value_t = 5000)]
    ttl_ms: u64,

    /// Lock wait bound, in milliseconds
    #[arg(long)]
    lock_timeout_ms: Option<u64>,

    /// Lock registry
    #[arg(long, value_enum)]
    registry: Option<Registry>,

    /// Fail every n-th loader execution (0 = never)
    #[arg(long, default_value_t = 0)]
    fail_every: u64,
}

fn load_config(path: Option<&Path>) -> Result<CacheConfig> {
    let Some(path) = path else {
        return Ok(CacheConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(ms) = args.lock_timeout_ms {
        config.lock_timeout = Duration::from_millis(ms);
    }
    if let Some(registry) = args.registry {
        config.registry = registry.into();
    }

    info!("Starting FlightCache stress v{}", env!("CARGO_PKG_VERSION"));
    info!("Lock timeout: {:?}", config.lock_timeout);
    info!("Lock registry: {:?}", config.registry);
    info!(
        "Callers: {}, keys: {}, rounds: {}",
        args.callers, args.keys, args.rounds
    );

    let scenario = Scenario {
        callers: args.callers,
        keys: args.keys,
        rounds: args.rounds,
        loader_delay: Duration::from_millis(args.loader_ms),
        ttl: Duration::from_millis(args.ttl_ms),
        fail_every: args.fail_every,
    };

    let cache = CacheManager::with_config(Arc::new(MemoryStore::new()), config);
    let report = scenario.run(&cache)?;

    let stats = cache.stats();
    println!("\n📊 RESULTS:");
    println!("   Elapsed:          {:?}", report.elapsed);
    println!("   Found:            {}", report.found);
    println!("   Absent:           {}", report.absent);
    println!("   Load failures:    {}", report.failed);
    println!(
        "   Loader runs:      {} (single-flight ideal: {})",
        report.loader_runs,
        scenario.expected_loads()
    );
    println!("   Lock timeouts:    {}", stats.lock_timeouts());
    println!("   Self-heals:       {}", stats.self_heals());
    println!("   Hit ratio:        {:.2}", stats.hit_ratio());

    if report.loader_runs > scenario.expected_loads() {
        warn!(
            "{} extra loader runs from lock timeouts or failed loads",
            report.loader_runs - scenario.expected_loads()
        );
    }

    Ok(())
}
