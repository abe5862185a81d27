//! Market Feed Aggregator
//!
//! Operator entry point: runs the scheduler or performs one-off archive
//! and inspection commands against the configured store.

use anyhow::Context;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use marketfeed::{
    aggregate::{
        AggregateStore, InboxSnapshotSource, ProducerSpec, Scheduler, SnapshotFeedProducer, Stagger,
        TopicFeedProducer,
    },
    archive::{AggregateDailySource, ArchiveEngine, ArchiveJob, DailySource, StoredDailySource},
    config::{Config, SectionKind},
    entity::EntityStore,
    prediction::{EvaluationJob, PredictionLedger},
    storage::{self, DocumentStore, TopicStore},
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "marketfeed")]
#[command(about = "Market feed aggregator with tiered archive and prediction scoring")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to marketfeed.toml or ~/.config/marketfeed/config.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run feeds, prediction evaluation and the daily archive
    Run,
    /// Run one archive cycle now
    Archive {
        /// Day to snapshot, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Clean up after an interrupted compaction
    Recover,
    /// Show prediction statistics
    Stats,
    /// Print one entity layer
    Layer {
        /// Entity id (ticker, issuer code)
        entity: String,
        /// Layer name
        layer: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let store = storage::open(&config.storage).await?;

    match cli.command {
        Commands::Run => run(config, store).await,
        Commands::Archive { date } => archive_once(config, store, date).await,
        Commands::Recover => recover(config, store).await,
        Commands::Stats => show_stats(config, store).await,
        Commands::Layer { entity, layer } => show_layer(config, store, &entity, &layer).await,
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("loading config from {}", path)),
        None => match Config::load_default() {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!("{}, using built-in defaults", e);
                Ok(Config::default())
            }
        },
    }
}

fn topic_store(config: &Config, store: Arc<dyn DocumentStore>) -> TopicStore {
    TopicStore::new(store, config.storage.topic_capacity, config.storage.topic_dedup_threshold)
}

/// Engine observing what the running service last persisted
fn offline_archive_engine(config: &Config, store: Arc<dyn DocumentStore>) -> anyhow::Result<ArchiveEngine> {
    let source: Arc<dyn DailySource> = Arc::new(StoredDailySource::new(
        Arc::clone(&store),
        topic_store(config, Arc::clone(&store)),
        config.feeds.sections.clone(),
    ));
    Ok(ArchiveEngine::new(store, source, config.archive.clone())?)
}

async fn run(config: Config, store: Arc<dyn DocumentStore>) -> anyhow::Result<()> {
    tracing::info!("Starting market feed aggregator");

    let aggregate = Arc::new(AggregateStore::new());
    let topics = topic_store(&config, Arc::clone(&store));
    let mut scheduler = Scheduler::new(Arc::clone(&aggregate), Stagger::from(&config.feeds));

    for section in &config.feeds.sections {
        let spec = ProducerSpec::from(section);
        let source_name = section.topic.clone().unwrap_or_else(|| section.name.clone());
        match section.kind {
            SectionKind::List => {
                let producer = TopicFeedProducer::from_store(&source_name, topics.clone(), section.capacity);
                scheduler.register(spec, Arc::new(producer))?;
            }
            SectionKind::Snapshot => {
                let source = Arc::new(InboxSnapshotSource::new(&source_name, Arc::clone(&store)));
                let producer = SnapshotFeedProducer::new(&section.name, source, Arc::clone(&store));
                scheduler.register(spec, Arc::new(producer))?;
            }
        }
    }

    let entities = Arc::new(EntityStore::new(Arc::clone(&store), &config.layers));
    let ledger = Arc::new(PredictionLedger::new(Arc::clone(&store), &config.predictions));
    ledger.load().await?;
    scheduler.register_job(
        Arc::new(EvaluationJob::new(Arc::clone(&ledger), entities)),
        Duration::from_secs(config.predictions.evaluate_interval_secs),
        Duration::from_secs(config.feeds.startup_delay_secs),
    );

    let source = Arc::new(AggregateDailySource::new(Arc::clone(&aggregate)));
    let engine = Arc::new(ArchiveEngine::new(Arc::clone(&store), source, config.archive.clone())?);
    engine.recover().await?;
    tracing::info!("Next archive run at {}", engine.next_run_after(&Local::now()));
    scheduler.register_daily(Arc::new(ArchiveJob::new(Arc::clone(&engine))), engine.run_at());

    scheduler.start();
    tracing::info!(
        "Running {} sections ({}). Press Ctrl+C to stop.",
        aggregate.section_names().len(),
        aggregate.section_names().join(", ")
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.shutdown();
    Ok(())
}

async fn archive_once(config: Config, store: Arc<dyn DocumentStore>, date: Option<NaiveDate>) -> anyhow::Result<()> {
    let engine = offline_archive_engine(&config, store)?;
    let today = date.unwrap_or_else(|| Local::now().date_naive());
    let report = engine.run_cycle(today).await?;

    println!("Archive cycle for {}", today);
    println!("  daily entry: {}", report.daily.as_deref().unwrap_or("-"));
    println!("  events:      {}", report.events);
    println!("  rollups:     {}", report.compaction.written.len());
    for key in &report.compaction.written {
        println!("    {}", key);
    }
    println!("  removed:     {}", report.compaction.deleted);
    Ok(())
}

async fn recover(config: Config, store: Arc<dyn DocumentStore>) -> anyhow::Result<()> {
    let engine = offline_archive_engine(&config, store)?;
    let report = engine.recover().await?;
    println!("Removed {} leftover entries", report.deleted);
    for key in &report.rebuilt {
        println!("Rebuilt {}", key);
    }
    Ok(())
}

async fn show_stats(config: Config, store: Arc<dyn DocumentStore>) -> anyhow::Result<()> {
    let ledger = PredictionLedger::new(store, &config.predictions);
    let active = ledger.load().await?;
    let stats = ledger.stats();

    println!("Active predictions: {}", active);
    println!("Evaluated:          {}", stats.count);
    println!("Mean score:         {:.2}", stats.mean_score);
    println!("Direction accuracy: {:.1}%", stats.direction_accuracy * rust_decimal::Decimal::ONE_HUNDRED);
    for (horizon, bucket) in &stats.by_horizon {
        println!("  {:>3}: {} evaluated, mean {:.2}", horizon.as_str(), bucket.count, bucket.mean_score);
    }
    Ok(())
}

async fn show_layer(config: Config, store: Arc<dyn DocumentStore>, entity: &str, layer: &str) -> anyhow::Result<()> {
    let entities = EntityStore::new(store, &config.layers);
    match entities.layer(entity, layer).await? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("No layer {} for {}", layer, entity),
    }
    Ok(())
}
