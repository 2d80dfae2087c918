//! CLI entry point for the paperfetch tool.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use paperfetch_core::cli::{Cli, Command, PostponedAction};
use paperfetch_core::download::install_interrupt_handler;
use paperfetch_core::postponed::{BlockClassifier, CircuitBreaker};
use paperfetch_core::state::{MergeOptions, merge_stores};
use paperfetch_core::{
    BatchOrchestrator, CancellationToken, DownloadExecutor, FetchStatus, FetcherConfig, HttpClient,
    PostponementCache, RateLimiter, build_default_chain,
};
use paperfetch_core::DownloadStateStore;
use tracing::{debug, info, warn};

/// How long a graceful shutdown may take before the watchdog force-quits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Cli::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let config = FetcherConfig::load(args.config.as_deref());

    match args.command {
        Command::Fetch {
            identifiers,
            input,
            output_dir,
            workers,
            max_attempts,
            force,
            no_rate_limit,
            quiet,
        } => {
            run_fetch(
                config,
                identifiers,
                input,
                output_dir,
                workers,
                max_attempts,
                force,
                no_rate_limit,
                quiet,
            )
            .await
        }
        Command::Verify => run_verify(config).await,
        Command::Stats => run_stats(config).await,
        Command::Merge {
            source_db,
            source_dir,
            copy,
            dry_run,
        } => run_merge(config, source_db, source_dir, copy, dry_run).await,
        Command::Postponed { action } => run_postponed(config, action).await,
    }
}

#[allow(clippy::too_many_arguments, clippy::fn_params_excessive_bools)]
async fn run_fetch(
    mut config: FetcherConfig,
    identifiers: Vec<String>,
    input: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    workers: Option<usize>,
    max_attempts: Option<u32>,
    force: bool,
    no_rate_limit: bool,
    quiet: bool,
) -> Result<ExitCode> {
    // CLI overrides beat the config file.
    if let Some(dir) = output_dir {
        config.output_dir = dir;
    }
    if let Some(workers) = workers {
        config.workers = workers;
    }
    if let Some(max_attempts) = max_attempts {
        config.max_attempts = max_attempts;
    }

    let mut inputs = identifiers;
    if let Some(path) = input {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read input file {}", path.display()))?;
        inputs.extend(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    if inputs.is_empty() {
        info!("No identifiers given. Pass them as arguments or via --input FILE.");
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        identifiers = inputs.len(),
        workers = config.workers,
        output_dir = %config.output_dir.display(),
        "starting fetch"
    );

    let store = DownloadStateStore::open(&config.state_db_path())
        .await
        .context("failed to open state store")?;
    let postponed = Arc::new(
        PostponementCache::open(&config.postponed_db_path())
            .await
            .context("failed to open postponement store")?,
    );

    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone(), SHUTDOWN_GRACE);

    let client = Arc::new(HttpClient::with_timeouts(
        config.connect_timeout_secs,
        config.download_timeout_secs,
    ));
    let rate_limiter = if no_rate_limit {
        Arc::new(RateLimiter::disabled())
    } else {
        Arc::new(RateLimiter::new(
            config.rate_capacity,
            config.rate_refill_per_sec,
        ))
    };
    let chain = Arc::new(build_default_chain(
        Arc::clone(&client),
        &config.unpaywall_email,
        None,
    ));
    let blocks = Arc::new(BlockClassifier::with_extra_markers(&config.block_markers));

    let executor = Arc::new(DownloadExecutor::new(
        client,
        chain,
        rate_limiter,
        store,
        postponed,
        Arc::new(CircuitBreaker::new()),
        blocks,
        cancel.clone(),
        config.executor_config(),
    ));

    let orchestrator = BatchOrchestrator::new(executor, config.workers, cancel.clone(), !quiet);
    let report = orchestrator.fetch_batch(&inputs, force).await;

    for result in &report.results {
        match result.status {
            FetchStatus::Success => println!("{result}"),
            FetchStatus::Skipped => debug!("{result}"),
            _ => eprintln!("{result}"),
        }
    }
    println!(
        "done: {} downloaded, {} skipped, {} failed, {} postponed",
        report.stats.success, report.stats.skipped, report.stats.failure, report.stats.postponed
    );

    if cancel.is_cancelled() {
        warn!("interrupted; run again to resume");
        return Ok(ExitCode::FAILURE);
    }
    if report.stats.failure > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_verify(config: FetcherConfig) -> Result<ExitCode> {
    let store = DownloadStateStore::open(&config.state_db_path())
        .await
        .context("failed to open state store")?;
    let report = store.verify().await.context("verification failed")?;

    println!(
        "verified: {} present, {} missing",
        report.verified.len(),
        report.missing.len()
    );
    for identifier in &report.missing {
        println!("missing: {identifier}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_stats(config: FetcherConfig) -> Result<ExitCode> {
    let store = DownloadStateStore::open(&config.state_db_path())
        .await
        .context("failed to open state store")?;
    let stats = store.stats().await.context("stats query failed")?;

    println!("total: {}", stats.total);
    println!("  success:   {}", stats.success);
    println!("  pending:   {}", stats.pending);
    println!("  failure:   {}", stats.failure);
    println!("  postponed: {}", stats.postponed);
    println!("  missing files: {}", stats.missing_files);
    if !stats.by_publisher.is_empty() {
        println!("top publishers:");
        for (publisher, count) in &stats.by_publisher {
            println!("  {publisher}: {count}");
        }
    }
    if !stats.by_strategy.is_empty() {
        println!("by strategy:");
        for (strategy, count) in &stats.by_strategy {
            println!("  {strategy}: {count}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_merge(
    config: FetcherConfig,
    source_db: PathBuf,
    source_dir: PathBuf,
    copy: bool,
    dry_run: bool,
) -> Result<ExitCode> {
    anyhow::ensure!(source_db.exists(), "source database not found: {}", source_db.display());

    let source = DownloadStateStore::open(&source_db)
        .await
        .context("failed to open source store")?;
    let target = DownloadStateStore::open(&config.state_db_path())
        .await
        .context("failed to open target store")?;

    let report = merge_stores(
        &source,
        &source_dir,
        &target,
        &config.output_dir,
        MergeOptions {
            move_files: !copy,
            dry_run,
        },
    )
    .await
    .context("merge failed")?;

    if dry_run {
        println!("dry run - no changes were made");
    }
    println!(
        "merged {} entries: {} added, {} updated ({} success-over-failure), {} kept",
        report.total_source_entries,
        report.added,
        report.updated,
        report.success_over_failure,
        report.kept_existing
    );
    println!(
        "files: {} moved, {} copied, {} skipped",
        report.files_moved, report.files_copied, report.files_skipped
    );
    for error in &report.errors {
        eprintln!("error: {error}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_postponed(config: FetcherConfig, action: PostponedAction) -> Result<ExitCode> {
    let cache = PostponementCache::open(&config.postponed_db_path())
        .await
        .context("failed to open postponement store")?;

    match action {
        PostponedAction::List => {
            let entries = cache.entries().await.context("listing failed")?;
            if entries.is_empty() {
                println!("no postponed sources");
            }
            for entry in entries {
                println!(
                    "{} {} ({}; seen {}x)",
                    entry.kind, entry.key, entry.reason, entry.detection_count
                );
            }
        }
        PostponedAction::Remove { key } => {
            let removed = cache.remove_domain(&key).await.context("remove failed")?
                || cache.remove_prefix(&key).await.context("remove failed")?;
            if removed {
                println!("removed {key}");
            } else {
                println!("no entry for {key}");
            }
        }
        PostponedAction::Clear => {
            cache.clear().await.context("clear failed")?;
            println!("postponement store cleared");
        }
    }
    Ok(ExitCode::SUCCESS)
}
