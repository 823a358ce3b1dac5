mod cache;
mod cli;
mod clock;
mod commands;
mod config;
mod db;
mod errors;
mod geo;
mod placement;
mod providers;
mod queue;
mod resolver;
mod seed;
mod sites;
mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{CacheCommands, Cli, Commands};
use crate::db::{bootstrap, DatabaseBootstrap, DatabaseContext};

pub use cache::{CacheStore, GeocodeCache, MemoryCacheStore, SqliteCacheStore};
pub use clock::{Clock, TokioClock};
pub use commands::{
    cache_lookup, export_seed, foundation_health, resolve_sites, CacheLookup, DatasetOverview,
    FoundationHealth, ResolveReport,
};
pub use config::{AppConfig, PublicAppConfig};
pub use errors::{AppError, AppResult};
pub use geo::{Bounds, Coordinate};
pub use placement::{Marker, MarkerLayer, PlacementSink};
pub use providers::{
    providers_from_config, GeocodeProvider, MapboxProvider, NominatimProvider, PhotonProvider,
    ProviderKind, ProviderOutcome,
};
pub use queue::{CoordinateRequest, GeocodeQueue, QueueStats};
pub use resolver::{AttemptStatus, ProviderAttempt, ProviderChain, Resolution};
pub use seed::{load_seed_rows, write_seed_file, SeedExport, SeedRow};
pub use sites::{Dataset, DatasetCounts, FilteredStats, Site, SiteFilter, SiteId};
pub use telemetry::{EventJournal, GeocodeEvent};

/// Everything one run of the pipeline needs: the opened cache store, the
/// loaded cache, the provider chain wired into the queue, and the marker
/// layer the queue places resolved sites on.
pub struct AppState {
    config: AppConfig,
    db_path: PathBuf,
    db_bootstrap_recovered: bool,
    cache: Arc<GeocodeCache>,
    seeded_entries: usize,
    provider_names: Vec<String>,
    journal: Arc<EventJournal>,
    layer: Arc<MarkerLayer>,
    queue: GeocodeQueue,
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        let providers = providers_from_config(&config)?;
        Self::with_providers(config, providers, Arc::new(TokioClock))
    }

    pub fn with_providers(
        config: AppConfig,
        providers: Vec<Arc<dyn GeocodeProvider>>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        let DatabaseBootstrap {
            context: DatabaseContext { connection, path },
            recovered,
        } = bootstrap(&config.data_dir, &config.database_file_name)?;
        let journal = Arc::new(EventJournal::open(&config.data_dir, &config)?);

        let store = Arc::new(SqliteCacheStore::new(Arc::new(Mutex::new(connection))));
        let cache = Arc::new(GeocodeCache::load(
            store,
            &config.cache_key,
            &config.legacy_cache_keys,
        ));
        let seed_rows = load_seed_rows(&config.seed_file);
        let seeded_entries = cache.merge_seed(&seed_rows);
        info!(
            cache_entries = cache.len(),
            seeded_entries,
            recovered,
            "geocode cache loaded"
        );

        if let Err(err) = journal.record(GeocodeEvent::CacheSeeded {
            cache_entries: cache.len(),
            seeded_entries,
            db_recovered: recovered,
        }) {
            warn!(?err, "failed to record cache bootstrap event");
        }

        let chain = ProviderChain::new(providers, Arc::clone(&clock))
            .with_retries(config.provider_retries);
        let provider_names = chain.provider_names();
        let layer = Arc::new(MarkerLayer::new());
        let queue = GeocodeQueue::new(
            Arc::clone(&cache),
            chain,
            layer.clone(),
            clock,
            config.geocode_delay(),
        )
        .with_journal(Arc::clone(&journal));

        Ok(Self {
            config,
            db_path: path,
            db_bootstrap_recovered: recovered,
            cache,
            seeded_entries,
            provider_names,
            journal,
            layer,
            queue,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn db_bootstrap_recovered(&self) -> bool {
        self.db_bootstrap_recovered
    }

    pub fn cache(&self) -> &Arc<GeocodeCache> {
        &self.cache
    }

    pub fn seeded_entries(&self) -> usize {
        self.seeded_entries
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.provider_names.clone()
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    pub fn layer(&self) -> &Arc<MarkerLayer> {
        &self.layer
    }

    pub fn queue(&self) -> &GeocodeQueue {
        &self.queue
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,site_map=debug,site_map_lib=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = AppConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.sites_file = data_dir.join("sites.json");
        config.seed_file = data_dir.join("geocoded_sites.json");
        config.data_dir = data_dir;
    }
    if let Some(sites) = cli.sites {
        config.sites_file = sites;
    }
    if let Some(delay_ms) = cli.delay_ms {
        config.geocode_delay_ms = delay_ms;
    }

    let state = AppState::initialize(config)?;
    match cli.command {
        Commands::Resolve { filter } => {
            let report = resolve_sites(&state, &filter.into()).await?;
            print_json(&report)?;
        }
        Commands::Seed { output } => {
            let output = output.unwrap_or_else(|| state.config().seed_file.clone());
            let export = export_seed(&state, &output).await?;
            print_json(&export)?;
        }
        Commands::Cache {
            command: CacheCommands::Get { address },
        } => print_json(&cache_lookup(&state, &address))?,
        Commands::Health => print_json(&foundation_health(&state))?,
    }
    if let Err(err) = state.journal().flush() {
        warn!(?err, "failed to flush geocode event journal");
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
