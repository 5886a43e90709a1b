use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use quarry_embed::{EmbeddingProvider, FastEmbedProvider};
use quarry_indexer::{
    CoordinatorContext, CoordinatorRegistry, IndexEvent, IndexStatus, IndexingCoordinator,
    SourceType,
    config::{QuarryConfig, load_config},
    coordinator::PipelineSettings,
    events::EventBus,
    progress::IndexProgress,
    segment::keys,
    storage::{
        EmbeddingStore, IndexStateStore, MetadataFilter, SearchHit, SqliteEmbeddingStore,
        SqliteIndexStateStore, connect_pool,
    },
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Incrementally index a project's knowledge sources into a local vector store.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Project configuration file
    #[arg(short, long, default_value = "quarry.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    /// Output format
    #[arg(short, long, default_value = "summary", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an incremental pass over every source
    Index {
        /// Keep applying changes until interrupted
        #[arg(short, long)]
        watch: bool,
    },
    /// Show what the index currently holds
    Status,
    /// Search the index
    Search {
        query: String,
        /// Maximum number of results
        #[arg(short, default_value_t = 10)]
        k: usize,
        /// Only search one source type
        #[arg(long)]
        source: Option<SourceType>,
    },
    /// Remove everything indexed for the project
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[derive(Serialize)]
struct PassReport {
    source_type: SourceType,
    #[serde(flatten)]
    progress: IndexProgress,
}

#[derive(Serialize)]
struct SourceStatus {
    source_type: SourceType,
    files: usize,
    segments: usize,
    last_indexed: Option<String>,
}

struct Stores {
    embeddings: Arc<SqliteEmbeddingStore>,
    states: Arc<SqliteIndexStateStore>,
}

impl Stores {
    async fn open(config: &QuarryConfig) -> anyhow::Result<Self> {
        let pool = connect_pool(&config.project.db_path).await?;
        Ok(Self {
            embeddings: Arc::new(SqliteEmbeddingStore::from_pool(pool.clone()).await?),
            states: Arc::new(SqliteIndexStateStore::from_pool(pool).await?),
        })
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args).await {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let stores = Stores::open(&config).await?;

    match args.command {
        Commands::Index { watch } => index(&config, stores, watch, &args.format).await,
        Commands::Status => status(&config, &stores, &args.format).await,
        Commands::Search { query, k, source } => {
            search(&config, &stores, &query, k, source, &args.format).await
        }
        Commands::Clear => {
            let states = stores.states.clear_project(&config.project.id).await?;
            let vectors = stores
                .embeddings
                .delete_where(&MetadataFilter::new().eq(keys::PROJECT_ID, &config.project.id))
                .await?;
            info!(states, vectors, "Cleared project {}", config.project.id);
            println!(
                "Cleared {} resources and {} segments from {}",
                states, vectors, config.project.id
            );
            Ok(())
        }
    }
}

async fn load_provider(config: &QuarryConfig) -> anyhow::Result<Arc<FastEmbedProvider>> {
    info!("Loading embedding model {}", config.embedding.model);
    let provider = FastEmbedProvider::create(config.embedding.clone())
        .await
        .context("Failed to load the embedding model")?;
    Ok(Arc::new(provider))
}

async fn index(
    config: &QuarryConfig,
    stores: Stores,
    watch: bool,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    if config.sources.is_empty() {
        anyhow::bail!("No [[sources]] configured in {}", config.project.id);
    }
    let provider = load_provider(config).await?;
    let events = EventBus::default();
    let ctx = CoordinatorContext::new(
        config.project.id.clone(),
        provider.clone(),
        stores.embeddings,
        stores.states,
    )
    .with_events(events.clone())
    .with_settings(PipelineSettings::from_config(config, provider.as_ref()));

    let coordinators =
        CoordinatorRegistry::with_defaults().build_all(&ctx, &config.sources, &config.filter)?;
    let log_events = tokio::spawn(log_events(events));

    join_all(coordinators.iter().map(|c| c.start_indexing())).await;
    let reports: Vec<PassReport> = coordinators
        .iter()
        .map(|c| PassReport {
            source_type: c.source_type(),
            progress: c.progress(),
        })
        .collect();
    print_reports(&reports, format)?;

    let failed = reports.iter().any(|r| r.progress.error.is_some());
    if watch && !failed {
        let scope = CancellationToken::new();
        for coordinator in &coordinators {
            coordinator.start_watching(&scope).await?;
        }
        info!("Watching for changes, press Ctrl-C to stop");
        let mut receivers: Vec<_> = coordinators.iter().map(|c| c.subscribe()).collect();
        let all_failed = join_all(
            receivers
                .iter_mut()
                .map(|rx| rx.wait_for(|p| p.status == IndexStatus::Failed)),
        );
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, stopping");
            }
            _ = all_failed => warn!("Every watch has stopped"),
        }
        scope.cancel();
    }

    join_all(coordinators.iter().map(|c| c.close())).await;
    log_events.abort();

    let errors: Vec<String> = coordinators
        .iter()
        .filter_map(|c| {
            c.progress()
                .error
                .map(|e| format!("{}: {}", c.source_type(), e))
        })
        .collect();
    if !errors.is_empty() {
        anyhow::bail!("Indexing failed: {}", errors.join("; "));
    }
    Ok(())
}

async fn log_events(events: EventBus) {
    let mut receiver = events.subscribe();
    loop {
        match receiver.recv().await {
            Ok(IndexEvent::WatchFailed {
                source_type,
                reason,
                ..
            }) => warn!(source = %source_type, "Watch stopped: {}", reason),
            Ok(event) => debug!(?event, "Index event"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "Event log lagged")
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_reports(reports: &[PassReport], format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(reports)?),
        OutputFormat::Summary => {
            for report in reports {
                let progress = &report.progress;
                println!(
                    "{}: {} ({}/{} resources)",
                    report.source_type,
                    progress.status,
                    progress.processed_files,
                    progress.total_files
                );
                if let Some(error) = &progress.error {
                    println!("  error: {error}");
                }
            }
        }
    }
    Ok(())
}

async fn status(
    config: &QuarryConfig,
    stores: &Stores,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let states = stores.states.list_states(&config.project.id).await?;

    let mut by_type: BTreeMap<SourceType, (usize, Option<String>)> = BTreeMap::new();
    for state in &states {
        let entry = by_type.entry(state.source_type).or_default();
        entry.0 += 1;
        let at = state.indexed_at.to_rfc3339();
        if entry.1.as_ref().is_none_or(|latest| *latest < at) {
            entry.1 = Some(at);
        }
    }

    let mut report = Vec::new();
    for (source_type, (files, last_indexed)) in by_type {
        let filter = MetadataFilter::new()
            .eq(keys::PROJECT_ID, &config.project.id)
            .eq(keys::SOURCE_TYPE, source_type.as_str());
        report.push(SourceStatus {
            source_type,
            files,
            segments: stores.embeddings.count(Some(&filter)).await?,
            last_indexed,
        });
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Summary => {
            if report.is_empty() {
                println!("Nothing indexed for {}", config.project.id);
            }
            for source in report {
                println!(
                    "{}: {} resources, {} segments, last indexed {}",
                    source.source_type,
                    source.files,
                    source.segments,
                    source.last_indexed.as_deref().unwrap_or("never")
                );
            }
        }
    }
    Ok(())
}

async fn search(
    config: &QuarryConfig,
    stores: &Stores,
    query: &str,
    k: usize,
    source: Option<SourceType>,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let provider = load_provider(config).await?;
    let embedding = provider.embed_text(query).await?;

    let mut filter = MetadataFilter::new().eq(keys::PROJECT_ID, &config.project.id);
    if let Some(source) = source {
        filter = filter.eq(keys::SOURCE_TYPE, source.as_str());
    }
    let hits = stores.embeddings.search(&embedding, k, Some(&filter)).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&hits)?),
        OutputFormat::Summary => {
            println!("Found {} results:", hits.len());
            for hit in &hits {
                println!("  {:.3} | {}", hit.score, location(hit));
                let preview: String = hit.text.chars().take(120).collect();
                println!("        {}", preview.replace('\n', " "));
            }
        }
    }
    Ok(())
}

fn location(hit: &SearchHit) -> String {
    let path = hit
        .metadata
        .get(keys::FILE_PATH)
        .map(String::as_str)
        .unwrap_or("?");
    match (
        hit.metadata.get(keys::START_LINE),
        hit.metadata.get(keys::END_LINE),
    ) {
        (Some(start), Some(end)) => format!("{path}:{start}-{end}"),
        _ => path.to_string(),
    }
}
