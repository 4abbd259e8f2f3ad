//! # Context News Collector
//!
//! Collects news search results for a list of topics through many execution
//! contexts (regional scraping units with their own session material) and
//! stores one CSV dataset per (topic, context) pair.
//!
//! ## Features
//!
//! - Scrapes Google News and Bing News result pages through remote units
//! - Runs every context of a topic concurrently on a bounded worker pool
//! - Recovers blocked units with redeploy requests and randomized cooldowns
//! - Writes per-(topic, context) datasets and a JSON run summary
//! - Appends full article text to a day's datasets in a second stage
//!
//! ## Usage
//!
//! ```sh
//! context_news_collector --config config/collector.yaml collect
//! context_news_collector check-config
//! context_news_collector extract-content --date 2025-05-06
//! ```
//!
//! ## Architecture
//!
//! 1. **Dispatch**: topics in order, each fanned out across contexts
//! 2. **Fetch**: per-context pagination loop with recovery
//! 3. **Persist**: dataset written as soon as each context finishes
//! 4. **Report**: summary of the run per backend

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use clap::Parser;
use futures::future::join_all;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod content;
mod dispatcher;
mod errors;
mod fetcher;
mod models;
mod outputs;
mod retry;
mod scrapers;
mod session;
mod units;
mod utils;

#[cfg(test)]
mod testing;

use cli::{Cli, Command};
use config::{CollectorConfig, load_topics};
use content::{ContentCache, ContentExtractor, HttpPageFetcher};
use dispatcher::Dispatcher;
use errors::{PersistenceError, TransportError};
use fetcher::{PaginatedFetcher, pause};
use models::{Backend, Context, ContextLabel, Topic};
use outputs::dataset::{DatasetWriter, dataset_dir};
use outputs::summary::{summarize, write_summary};
use retry::RetryPolicy;
use session::{CookieJar, SessionCache, SessionIndex, SessionProvider};
use units::{HttpRedeployer, HttpUnitTransport, LogOnlyRedeployer, Redeployer, UnitRegistry};
use utils::ensure_writable_dir;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let args = Cli::parse();
    info!(
        config = %args.config.display(),
        command = ?args.command,
        "context_news_collector starting up"
    );

    let config = CollectorConfig::load(&args.config)?;

    match args.command {
        Command::Collect { daily_at: None } => {
            collect_once(&config, shutdown_on_ctrl_c()).await?;
        }
        Command::Collect { daily_at: Some(at) } => {
            run_daily(&config, at, shutdown_on_ctrl_c()).await
        }
        Command::CheckConfig => check_config(&config)?,
        Command::ExtractContent { date } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            extract_content(&config, date).await?;
        }
    }
    Ok(())
}

/// Shutdown signal flipped by Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received; stopping after in-flight pages");
                let _ = tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for interrupts");
                // keep the sender alive so receivers never see a closed channel
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

/// What one backend's collection produced.
#[derive(Debug)]
struct BackendRun {
    backend: Backend,
    records: usize,
    datasets: usize,
    save_failed: usize,
    interrupted: bool,
    summary: PathBuf,
}

/// Wire the production unit transport, redeployer and session source for
/// `backend`.
fn build_fetcher(
    config: &CollectorConfig,
    backend: Backend,
    sessions: Arc<SessionCache>,
) -> Result<PaginatedFetcher, TransportError> {
    let transport = Arc::new(HttpUnitTransport::new(Duration::from_secs(
        config.invoke_timeout_secs,
    ))?);
    let redeployer: Arc<dyn Redeployer> = match &config.redeploy_webhook {
        Some(webhook) => Arc::new(HttpRedeployer::new(webhook.clone())?),
        None => Arc::new(LogOnlyRedeployer),
    };
    let registry = UnitRegistry::new(
        config.unit_table(),
        transport,
        redeployer,
        RetryPolicy::from(&config.retry),
    );
    let provider = SessionProvider::new(backend, config.sessions_file(backend), sessions);
    Ok(PaginatedFetcher::new(
        scrapers::parser_for(backend, config.search_kind),
        Arc::new(registry),
        provider,
        config.fetch.clone(),
    ))
}

/// Dispatch every topic for one backend, saving each dataset as soon as its
/// context finishes, then write the run summary.
#[instrument(level = "info", skip_all, fields(backend = %fetcher.backend()))]
async fn collect_backend(
    fetcher: Arc<PaginatedFetcher>,
    config: &CollectorConfig,
    topics: &[Topic],
    contexts: &[Context],
    date: NaiveDate,
    shutdown: watch::Receiver<bool>,
) -> Result<BackendRun, PersistenceError> {
    let backend = fetcher.backend();
    let writer = DatasetWriter::new(config.datasets_path(), date, backend, config.mode.as_str());
    let dispatcher = Dispatcher::new(fetcher, config.worker_width(), config.dispatch.topic_delay);

    let mut datasets = 0usize;
    let mut save_failures: Vec<(Topic, ContextLabel)> = Vec::new();
    let report = dispatcher
        .dispatch(
            topics,
            contexts,
            |records, topic, label| match writer.save(records, topic, label) {
                Ok(Some(_)) => datasets += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(topic = %topic, context = %label, error = %e, "Failed to save dataset");
                    save_failures.push((topic.clone(), label.clone()));
                }
            },
            shutdown,
        )
        .await;

    let summary = summarize(
        &report.records,
        &report.outcomes,
        &save_failures,
        backend,
        &config.mode,
        date,
    );
    let summary = write_summary(&summary, &writer.dir(), Local::now().time())?;
    Ok(BackendRun {
        backend,
        records: report.records.len(),
        datasets,
        save_failed: save_failures.len(),
        interrupted: report.interrupted,
        summary,
    })
}

/// One collection over every configured backend, run concurrently.
///
/// A failing backend is logged and never aborts the others.
#[instrument(level = "info", skip_all)]
async fn collect_once(
    config: &CollectorConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn Error>> {
    let datasets_root = config.datasets_path();
    if let Err(e) = ensure_writable_dir(&datasets_root).await {
        error!(
            path = %datasets_root.display(),
            error = %e,
            "Dataset directory is not writable (fix perms or choose a different path)"
        );
        return Err(e.into());
    }

    let topics = load_topics(&config.topics_path())?;
    if topics.is_empty() {
        warn!("Topic list is empty; nothing to collect");
        return Ok(());
    }
    let contexts = config.contexts();
    let date = Local::now().date_naive();
    let sessions = Arc::new(SessionCache::new());
    info!(
        topics = topics.len(),
        contexts = contexts.len(),
        backends = config.backends.len(),
        %date,
        "Starting collection"
    );

    let runs = join_all(config.backends.iter().map(|&backend| {
        let sessions = Arc::clone(&sessions);
        let shutdown = shutdown.clone();
        let topics = &topics;
        let contexts = &contexts;
        async move {
            let started = Instant::now();
            let result = match build_fetcher(config, backend, sessions) {
                Ok(fetcher) => {
                    collect_backend(Arc::new(fetcher), config, topics, contexts, date, shutdown)
                        .await
                        .map_err(|e| e.to_string())
                }
                Err(e) => Err(e.to_string()),
            };
            (backend, started.elapsed(), result)
        }
    }))
    .await;

    for (backend, elapsed, result) in runs {
        match result {
            Ok(run) => info!(
                backend = %run.backend,
                records = run.records,
                datasets = run.datasets,
                save_failed = run.save_failed,
                status = match (run.interrupted, run.save_failed) {
                    (true, _) => "interrupted",
                    (false, 0) => "ok",
                    (false, _) => "incomplete",
                },
                summary = %run.summary.display(),
                elapsed_s = elapsed.as_secs(),
                "Backend finished"
            ),
            Err(e) => error!(
                %backend,
                status = "failed",
                error = %e,
                elapsed_s = elapsed.as_secs(),
                "Backend failed"
            ),
        }
    }
    Ok(())
}

/// Time from `now` until the next local occurrence of `at`.
fn until_next(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let today = now.date().and_time(at);
    let next = if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    };
    (next - now).to_std().unwrap_or_default()
}

/// Collect once a day at `at` until shutdown.
async fn run_daily(config: &CollectorConfig, at: NaiveTime, mut shutdown: watch::Receiver<bool>) {
    loop {
        let wait = until_next(Local::now().naive_local(), at);
        info!(at = %at, wait_s = wait.as_secs(), "Waiting for next daily collection");
        if pause(wait, &mut shutdown).await {
            break;
        }
        if let Err(e) = collect_once(config, shutdown.clone()).await {
            error!(error = %e, "Daily collection failed");
        }
        if *shutdown.borrow() {
            break;
        }
    }
    info!("Daily schedule stopped");
}

/// Validate topics and session material and print the per-context table.
fn check_config(config: &CollectorConfig) -> Result<(), Box<dyn Error>> {
    let topics = load_topics(&config.topics_path())?;
    println!("topics: {}", topics.len());

    let units = config.unit_table();
    let sessions = Arc::new(SessionCache::new());
    for &backend in &config.backends {
        let source = config.sessions_file(backend);
        if let Some(path) = &source {
            let index = SessionIndex::load(path)?;
            for jar in index.cookie_files() {
                CookieJar::load(&jar)?;
            }
        }
        println!(
            "\n[{backend}] cookie domain {}, sessions {}",
            backend.cookie_domain(),
            source
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        println!(
            "{:<16} {:<48} {:<16} {:>7} {:>7}",
            "context", "unit", "location", "cookies", "headers"
        );
        let provider = SessionProvider::new(backend, source, Arc::clone(&sessions));
        for context in config.contexts() {
            let material = provider.session_material(&context);
            let (identity, location) = units
                .get(&context.label)
                .map(|u| (u.identity.as_str(), u.location.as_str()))
                .unwrap_or(("-", "-"));
            println!(
                "{:<16} {:<48} {:<16} {:>7} {:>7}",
                context.label.as_str(),
                identity,
                location,
                material.cookies.len(),
                material.headers.len()
            );
        }
    }
    info!(cookie_jars = sessions.jar_loads(), "Configuration is valid");
    Ok(())
}

/// Append article text to every dataset of `date`.
#[instrument(level = "info", skip_all, fields(%date))]
async fn extract_content(config: &CollectorConfig, date: NaiveDate) -> Result<(), Box<dyn Error>> {
    let fetcher = Arc::new(HttpPageFetcher::new(
        &config.content.user_agent,
        Duration::from_secs(config.content.request_timeout_secs),
    )?);
    let cache = Arc::new(ContentCache::load(config.content_cache_path()));
    let extractor = ContentExtractor::new(
        fetcher,
        cache,
        config.content.retry_policy(),
        config.content.max_workers,
    );

    for &backend in &config.backends {
        let input = dataset_dir(&config.datasets_path(), date, backend, &config.mode);
        if !input.is_dir() {
            warn!(%backend, path = %input.display(), "No datasets for date");
            continue;
        }
        let output = dataset_dir(&config.results_path(), date, backend, &config.mode);
        ensure_writable_dir(&output).await?;
        let report = extractor.process_dir(&input, &output).await?;
        info!(
            %backend,
            files = report.files,
            urls = report.urls,
            extracted = report.extracted,
            output = %output.display(),
            "Article content written"
        );
    }
    Ok(())
}
