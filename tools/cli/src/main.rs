//! catalogsync CLI - pushes catalog changes from the ERP database to the
//! shop and its plugins.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use catalogsync_catalog::{Contractors, Discounts, EntityKind, Products, PRODUCTS};
use catalogsync_common::EntityScope;
use catalogsync_remote::{BatchApi, PriceRules, WooCommerceProducts, WordPressUsers};
use catalogsync_source::SqliteSource;
use catalogsync_sync::{
    IdentityStore, JsonStateStore, RunReport, SqliteIdentityStore, SyncCycle, SyncEngine,
    SyncEntity, SyncOptions, SyncScheduler,
};

use config::{Config, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(name = "catalogsync")]
#[command(about = "catalogsync - Incremental ERP to shop catalog sync")]
#[command(version)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "CATALOGSYNC_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging (shortcut for --log-level debug).
    #[arg(short, long)]
    verbose: bool,

    /// Log level: error, warn, info, debug or trace. RUST_LOG wins when set.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enable change tracking on the source tables and create the
    /// identity map.
    Setup,

    /// Push changes since the last successful run.
    Sync(SyncArgs),

    /// Delete every mapped remote record and sync from scratch.
    Regenerate {
        /// Entities to regenerate, comma separated (default: all).
        #[arg(long, value_delimiter = ',')]
        only: Vec<EntityKind>,

        /// Sync products without a price.
        #[arg(long)]
        include_free: bool,
    },

    /// Show the watermark and mapping count of every entity.
    Status,

    /// Sync periodically until interrupted.
    Watch {
        /// Seconds between cycles.
        #[arg(long, default_value_t = 300)]
        interval: u64,

        #[command(flatten)]
        sync: SyncArgs,
    },
}

#[derive(Args, Clone, Default)]
struct SyncArgs {
    /// Forget the identity map and send every record as a creation.
    #[arg(long)]
    rebuild: bool,

    /// Send full payloads instead of diffing against history.
    #[arg(long)]
    force: bool,

    /// Sync products without a price.
    #[arg(long)]
    include_free: bool,

    /// Entities to sync, comma separated (default: all).
    #[arg(long, value_delimiter = ',')]
    only: Vec<EntityKind>,
}

impl SyncArgs {
    fn options(&self) -> SyncOptions {
        SyncOptions {
            rebuild: self.rebuild,
            force: self.force,
        }
    }
}

/// Selected entities in sync order.
fn selected(only: &[EntityKind]) -> Vec<EntityKind> {
    EntityKind::ALL
        .into_iter()
        .filter(|kind| only.is_empty() || only.contains(kind))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug"
    } else {
        cli.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Setup => cmd_setup(&config),
        Commands::Sync(args) => {
            let app = App::open(config)?;
            let outcome = app.run_entities(&args, false).await;
            outcome.finish()
        }
        Commands::Regenerate { only, include_free } => {
            let app = App::open(config)?;
            let args = SyncArgs {
                only,
                include_free,
                ..Default::default()
            };
            let outcome = app.run_entities(&args, true).await;
            outcome.finish()
        }
        Commands::Status => App::open(config)?.status().await,
        Commands::Watch { interval, sync } => cmd_watch(App::open(config)?, interval, sync).await,
    }
}

fn cmd_setup(config: &Config) -> Result<()> {
    info!("Setting up {}", config.source.database.display());
    let source = SqliteSource::open(&config.source.database)
        .with_context(|| format!("Failed to open {}", config.source.database.display()))?;
    for kind in EntityKind::ALL {
        for tracked in kind.tracked_tables() {
            source
                .enable_tracking(&tracked.table)
                .with_context(|| format!("Failed to track {} for {}", tracked.table, kind))?;
            println!("Tracking {} ({})", tracked.table, kind);
        }
    }
    SqliteIdentityStore::open(config.identity_path()).with_context(|| {
        format!(
            "Failed to create the identity map in {}",
            config.identity_path().display()
        )
    })?;
    println!("Identity map ready in {}", config.identity_path().display());
    Ok(())
}

async fn cmd_watch(app: App, interval: u64, args: SyncArgs) -> Result<()> {
    if interval == 0 {
        bail!("--interval must be at least 1 second");
    }
    let app = Arc::new(app);
    let (scheduler, handle) = SyncScheduler::new(Some(Duration::from_secs(interval)));

    let task = tokio::spawn(handle.run(move || {
        let app = app.clone();
        let args = args.clone();
        async move { Ok(app.run_entities(&args, false).await.cycle()) }
    }));

    info!("Watching every {}s, press Ctrl-C to stop", interval);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;
    info!("Stopped");
    Ok(())
}

/// Stores and engine wired from the config.
struct App {
    config: Config,
    engine: SyncEngine,
    identities: Arc<dyn IdentityStore>,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        let source = SqliteSource::open(&config.source.database)
            .with_context(|| format!("Failed to open {}", config.source.database.display()))?;
        let identities: Arc<dyn IdentityStore> = Arc::new(
            SqliteIdentityStore::open(config.identity_path())
                .context("Failed to open the identity map")?,
        );
        let state = Arc::new(JsonStateStore::new(config.state_path()));
        let engine = SyncEngine::new(
            Arc::new(source),
            identities.clone(),
            state,
            config.engine_config(),
        );
        Ok(Self {
            config,
            engine,
            identities,
        })
    }

    fn destination(&self, kind: EntityKind) -> Result<Box<dyn BatchApi>> {
        let api: Box<dyn BatchApi> = match kind {
            EntityKind::Products => Box::new(WooCommerceProducts::new(
                self.config.api_settings("woocommerce")?,
            )?),
            EntityKind::Contractors => {
                Box::new(WordPressUsers::new(self.config.api_settings("wordpress")?)?)
            }
            EntityKind::Discounts => {
                Box::new(PriceRules::new(self.config.api_settings("prices")?)?)
            }
        };
        Ok(api)
    }

    async fn entity(&self, kind: EntityKind, include_free: bool) -> Result<Box<dyn SyncEntity>> {
        let entity: Box<dyn SyncEntity> = match kind {
            EntityKind::Products => Box::new(Products::new(include_free)?),
            EntityKind::Contractors => Box::new(Contractors::new()?),
            EntityKind::Discounts => {
                let products = self
                    .identities
                    .load(&EntityScope::new(PRODUCTS)?)
                    .await
                    .context("Failed to load product mappings")?;
                Box::new(Discounts::new(products)?)
            }
        };
        Ok(entity)
    }

    async fn run_one(&self, kind: EntityKind, args: &SyncArgs, regenerate: bool) -> Result<RunReport> {
        let api = self.destination(kind)?;
        let entity = self.entity(kind, args.include_free).await?;
        let report = if regenerate {
            self.engine
                .regenerate(entity.as_ref(), api.as_ref(), args.options())
                .await
        } else {
            self.engine
                .sync_entity(entity.as_ref(), api.as_ref(), args.options())
                .await
        };
        report.with_context(|| format!("{} run aborted", kind))
    }

    /// Run the selected entities in order. A failing entity does not stop
    /// the ones after it.
    async fn run_entities(&self, args: &SyncArgs, regenerate: bool) -> Outcome {
        let started = Instant::now();
        let mut outcome = Outcome::default();
        for kind in selected(&args.only) {
            match self.run_one(kind, args, regenerate).await {
                Ok(report) => {
                    print_report(&report);
                    outcome.reports.push(report);
                }
                Err(e) => {
                    error!("{:#}", e);
                    outcome.errors.push((kind, e));
                }
            }
        }
        outcome.duration = started.elapsed();
        outcome
    }

    async fn status(&self) -> Result<()> {
        println!("{:<12} {:<28} {:>8}", "entity", "watermark", "mapped");
        for kind in EntityKind::ALL {
            let status = self.engine.status(&EntityScope::new(kind.as_str())?).await?;
            let watermark = status
                .state
                .map(|s| s.watermark.to_string())
                .unwrap_or_else(|| "never synced".to_string());
            println!("{:<12} {:<28} {:>8}", kind, watermark, status.mappings);
        }
        Ok(())
    }
}

fn print_report(report: &RunReport) {
    println!(
        "{:<12} {:<15} created {:<7} updated {:<7} deleted {:<7} skipped {}",
        report.scope.to_string(),
        report.outcome.to_string(),
        report.created.to_string(),
        report.updated.to_string(),
        report.deleted.to_string(),
        report.skipped
    );
    for key in &report.inconsistencies {
        println!("  unmapped remote record: {}", key);
    }
}

/// Result of running the selected entities once.
#[derive(Default)]
struct Outcome {
    reports: Vec<RunReport>,
    errors: Vec<(EntityKind, anyhow::Error)>,
    duration: Duration,
}

impl Outcome {
    fn failed(&self) -> usize {
        self.errors.len() + self.reports.iter().filter(|r| !r.is_success()).count()
    }

    fn cycle(&self) -> SyncCycle {
        SyncCycle {
            entities: self.reports.len() + self.errors.len(),
            failed: self.failed(),
            duration: self.duration,
        }
    }

    fn finish(self) -> Result<()> {
        let failed = self.failed();
        if failed == 0 {
            info!("All entities synced in {:?}", self.duration);
            return Ok(());
        }
        if !self.errors.is_empty() || self.reports.iter().any(RunReport::may_have_orphans) {
            warn!(
                "Some remote records may exist without a mapping; \
                 run 'regenerate' if duplicates appear"
            );
        }
        bail!("{} of {} entity runs failed", failed, self.reports.len() + self.errors.len())
    }
}
