//! Motion Risk Engine CLI
//!
//! Scores motion sample streams and inspects persisted results.

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use motion_risk_engine::{
    config::Config,
    core::CompositeScore,
    feed::{FeedItem, JsonlFeed},
    rank,
    sink::{self, DocumentStore, FileStore},
    telemetry::{create_shared_stats_with_persistence, DropReason, SharedEngineStats},
    Engine, ScorerRegistry, VERSION,
};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "motion-risk")]
#[command(version = VERSION)]
#[command(about = "Context-aware risk scoring for motion streams", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a JSONL stream of motion samples
    Run {
        /// Input file, or - for stdin
        #[arg(long, short, default_value = "-")]
        input: String,

        /// Directory for the file-backed document store
        #[arg(long)]
        store_dir: Option<PathBuf>,

        /// Number of worker shards
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Accept samples over HTTP (requires server feature)
    #[cfg(feature = "server")]
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8710")]
        port: u16,

        /// Directory for the file-backed document store
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },

    /// Check a configuration file and exit
    Validate,

    /// Show configuration
    Config,

    /// Show cumulative engine statistics
    Status,

    /// Rank subjects by their latest composite score
    Rank {
        /// Number of subjects to show
        #[arg(long, short, default_value = "10")]
        limit: usize,

        #[arg(long)]
        store_dir: Option<PathBuf>,
    },

    /// Show the persisted baseline for a subject
    Baseline {
        subject: String,

        #[arg(long)]
        store_dir: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Run {
            input,
            store_dir,
            workers,
        } => cmd_run(config_path, &input, store_dir, workers),
        #[cfg(feature = "server")]
        Commands::Serve { port, store_dir } => cmd_serve(config_path, port, store_dir),
        Commands::Validate => cmd_validate(config_path),
        Commands::Config => cmd_config(config_path),
        Commands::Status => cmd_status(config_path),
        Commands::Rank { limit, store_dir } => cmd_rank(config_path, limit, store_dir),
        Commands::Baseline { subject, store_dir } => cmd_baseline(config_path, &subject, store_dir),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load()?,
    };
    Ok(config)
}

fn stats_path(config: &Config) -> PathBuf {
    config.data_path.join("stats.json")
}

/// Remote store when configured, otherwise files under `store_dir`.
fn open_store(config: &Config) -> anyhow::Result<Arc<dyn DocumentStore>> {
    if let Some(remote) = &config.sink.remote {
        #[cfg(feature = "remote")]
        {
            let store = sink::HttpStore::new(remote.clone())?;
            info!(url = %remote.base_url, producer = store.producer_id(), "Using remote document store");
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "remote"))]
        bail!(
            "remote store {} configured but this build lacks the remote feature",
            remote.base_url
        );
    }

    let dir = config
        .sink
        .store_dir
        .clone()
        .unwrap_or_else(|| config.data_path.join("store"));
    info!(dir = %dir.display(), "Using file document store");
    Ok(Arc::new(FileStore::new(dir)))
}

fn start_engine(config: &Config) -> anyhow::Result<(Engine, SharedEngineStats)> {
    config.ensure_directories()?;
    let stats = create_shared_stats_with_persistence(stats_path(config));
    let store = open_store(config)?;
    let scorers = ScorerRegistry::with_defaults(Duration::from_millis(config.engine.scorer_budget_ms));
    let engine = Engine::start(config, store, scorers, stats.clone())?;
    Ok((engine, stats))
}

fn cmd_run(
    config_path: Option<&Path>,
    input: &str,
    store_dir: Option<PathBuf>,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(dir) = store_dir {
        config.sink.store_dir = Some(dir);
    }
    if let Some(workers) = workers {
        config.engine.workers = workers;
    }
    config.validate()?;

    let reader: Box<dyn BufRead + Send> = if input == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(input).with_context(|| format!("opening {input}"))?;
        Box::new(BufReader::new(file))
    };

    println!("Motion Risk Engine v{VERSION}");
    println!("  Workers: {}", config.engine.workers);
    println!("  Timezone: {}", config.timezone);
    println!();
    println!("Press Ctrl+C to stop.");
    println!();

    let (engine, stats) = start_engine(&config)?;

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone())?;

    let feed = JsonlFeed::spawn(reader, config.engine.shard_capacity);
    while running.load(Ordering::SeqCst) {
        match feed.receiver().recv_timeout(Duration::from_millis(100)) {
            Ok(FeedItem::Sample(sample)) => {
                if let Err(e) = engine.submit(*sample) {
                    warn!("Engine refused sample: {e}");
                    break;
                }
            }
            Ok(FeedItem::Invalid { line, error }) => {
                stats.record_received();
                stats.record_dropped(DropReason::Malformed);
                warn!(line, "Skipping unreadable line: {error}");
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    if !running.load(Ordering::SeqCst) {
        println!();
        println!("Stopping...");
    }

    engine.shutdown();
    drop(feed);

    println!();
    println!("{}", stats.summary());
    Ok(())
}

#[cfg(feature = "server")]
fn cmd_serve(config_path: Option<&Path>, port: u16, store_dir: Option<PathBuf>) -> anyhow::Result<()> {
    use motion_risk_engine::server::{run, ServerConfig};

    let mut config = load_config(config_path)?;
    if let Some(dir) = store_dir {
        config.sink.store_dir = Some(dir);
    }
    config.validate()?;

    // The engine and any blocking store client live outside the runtime
    let (engine, stats) = start_engine(&config)?;
    let engine = Arc::new(engine);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async {
        let (addr, shutdown_tx) = run(ServerConfig::new(port), engine.clone()).await?;
        println!("Listening on http://{addr}");
        println!("Press Ctrl+C to stop.");
        tokio::signal::ctrl_c().await?;
        let _ = shutdown_tx.send(());
        anyhow::Ok(())
    })?;
    drop(runtime);

    engine.shutdown();
    println!();
    println!("{}", stats.summary());
    Ok(())
}

fn cmd_validate(config_path: Option<&Path>) -> anyhow::Result<()> {
    let path = config_path.map(Path::to_path_buf).unwrap_or_else(Config::config_path);
    if !path.exists() {
        bail!("no configuration file at {}", path.display());
    }
    Config::load_from(&path)?;
    println!("Configuration OK: {}", path.display());
    Ok(())
}

fn cmd_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    println!("Configuration");
    println!("=============");
    println!();
    println!(
        "Config file: {:?}",
        config_path.map(Path::to_path_buf).unwrap_or_else(Config::config_path)
    );
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_status(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    println!("Motion Risk Engine Status");
    println!("=========================");
    println!();
    println!("Configuration:");
    println!("  Workers: {}", config.engine.workers);
    println!("  Baseline window: {}s", config.baseline.window.as_secs());
    println!("  Minimum baseline samples: {}", config.baseline.min_samples);
    println!("  Sink queue capacity: {}", config.sink.queue_capacity);
    println!("  Timezone: {}", config.timezone);
    println!();

    let path = stats_path(&config);
    if path.exists() {
        let stats = create_shared_stats_with_persistence(path);
        println!("Cumulative {}", stats.summary());
    } else {
        println!("No previous session data found.");
    }
    Ok(())
}

fn cmd_rank(config_path: Option<&Path>, limit: usize, store_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if store_dir.is_some() {
        config.sink.store_dir = store_dir;
    }
    let store = open_store(&config)?;

    let mut latest: BTreeMap<String, CompositeScore> = BTreeMap::new();
    for score in sink::load_all::<CompositeScore>(store.as_ref(), sink::SCORES)? {
        match latest.get(&score.subject_id) {
            Some(existing) if existing.version >= score.version => {}
            _ => {
                latest.insert(score.subject_id.clone(), score);
            }
        }
    }

    if latest.is_empty() {
        println!("No composite scores found.");
        return Ok(());
    }

    let mut scores: Vec<CompositeScore> = latest.into_values().collect();
    rank(&mut scores);

    println!("{:<4} {:<20} {:<10} {:>6} {:>6}  {}", "#", "Subject", "Context", "Score", "Conf", "Timestamp");
    for (i, score) in scores.iter().take(limit).enumerate() {
        println!(
            "{:<4} {:<20} {:<10} {:>6.3} {:>6.2}  {}",
            i + 1,
            score.subject_id,
            score.context,
            score.value,
            score.confidence,
            score.timestamp.to_rfc3339()
        );
    }
    Ok(())
}

fn cmd_baseline(config_path: Option<&Path>, subject: &str, store_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if store_dir.is_some() {
        config.sink.store_dir = store_dir;
    }
    let store = open_store(&config)?;

    match sink::load_baseline(store.as_ref(), subject)? {
        Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        None => println!("No baseline stored for {subject}."),
    }
    Ok(())
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("setting Ctrl+C handler")
}
