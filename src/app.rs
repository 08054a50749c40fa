//! Command runners
//!
//! Wires configuration, the TVDB catalog, ffprobe and the pipeline together
//! for each CLI command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::services::ffmpeg::FfmpegService;
use crate::services::file_utils::format_bytes;
use crate::services::pipeline::{ItemOutcome, Pipeline, describe_decision, run_worker};
use crate::services::placement::shortfall;
use crate::services::queues::WorkQueue;
use crate::services::rate_limiter::RateLimitedClient;
use crate::services::tvdb::TvdbClient;
use crate::services::watcher::{CollectorSettings, EventCollector, scan_existing, watch_source};

/// Build the production pipeline: TVDB for metadata, ffprobe for quality
pub fn build_pipeline(config: Arc<Config>) -> Result<Pipeline> {
    let http = Arc::new(RateLimitedClient::for_tvdb(config.catalog_timeout)?);
    let catalog = Arc::new(TvdbClient::new(
        http,
        config.tvdb_api_key.clone(),
        config.tvdb_pin.clone(),
    ));
    if !catalog.has_api_key() {
        warn!("TVDB_API_KEY is not set; every item will fail resolution");
    }
    let probe = Arc::new(FfmpegService::new(
        config.ffprobe_path.clone(),
        config.probe_timeout,
    ));
    Ok(Pipeline::new(config, catalog, probe))
}

/// Watch the source directory until Ctrl-C
pub async fn run_watch(config: Arc<Config>, scan: bool) -> Result<()> {
    config.validate()?;
    tokio::fs::create_dir_all(&config.source_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.source_dir.display()))?;

    let pipeline = Arc::new(build_pipeline(config.clone())?);
    let queue = WorkQueue::new();
    let cancel = CancellationToken::new();

    let (watcher, mut notifications) = watch_source(&config.source_dir, config.watch_poll_interval)?;
    let collector = EventCollector::new(
        config.source_dir.clone(),
        CollectorSettings {
            delay: config.process_delay,
            max_tracking: config.watch_max_tracking,
        },
        queue.clone(),
    );

    // Existing entries go through the debouncer as if just created
    let (events_tx, events) = mpsc::unbounded_channel();
    if scan {
        let existing = scan_existing(&config.source_dir)
            .with_context(|| format!("Failed to scan {}", config.source_dir.display()))?;
        info!(items = existing.len(), "Feeding existing source entries to the collector");
        for event in existing {
            let _ = events_tx.send(event);
        }
    }

    let mut tasks = JoinSet::new();
    tasks.spawn(async move {
        while let Some(event) = notifications.recv().await {
            if events_tx.send(event).is_err() {
                break;
            }
        }
    });
    tasks.spawn(collector.run(events, cancel.clone()));
    for id in 0..config.workers {
        tasks.spawn(run_worker(id, pipeline.clone(), queue.clone(), cancel.clone()));
    }

    info!(
        source = %config.source_dir.display(),
        tv = %config.tv_dir.display(),
        movies = %config.movies_dir.display(),
        workers = config.workers,
        "Shelver is running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, finishing in-flight placements");

    cancel.cancel();
    queue.close();
    drop(watcher);

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "Task ended abnormally");
        }
    }

    info!("Shelver stopped");
    Ok(())
}

/// Process the given items once, without waiting for them to settle.
///
/// Returns the number of items that failed.
pub async fn run_organize(config: Arc<Config>, paths: Vec<PathBuf>, dry_run: bool) -> Result<usize> {
    config.validate()?;
    let pipeline = build_pipeline(config)?;
    let mut failures = 0;

    for path in paths {
        let outcome = pipeline.process_now(&path, dry_run).await;
        print_outcome(&path, &outcome);
        if outcome.is_failure() {
            failures += 1;
        }
    }

    Ok(failures)
}

fn print_outcome(path: &std::path::Path, outcome: &ItemOutcome) {
    println!("{}", path.display());
    match outcome {
        ItemOutcome::Planned(plan) => {
            for file in &plan.files {
                println!(
                    "  {:<8} {} -> {}",
                    file.role,
                    file.source.display(),
                    file.destination.display()
                );
            }
            for skipped in &plan.skipped {
                println!(
                    "  skip     {} ({})",
                    skipped.source.display(),
                    describe_decision(&skipped.decision)
                );
            }
            for old in &plan.supersedes {
                println!("  remove   {}", old.display());
            }
            if !plan.files.is_empty() {
                let free = plan.free_space();
                let note = match free {
                    Some(free) => match shortfall(plan.total_bytes, free) {
                        Some(short) => format!(
                            "{} free, short by {}",
                            format_bytes(free),
                            format_bytes(short)
                        ),
                        None => format!("{} free", format_bytes(free)),
                    },
                    None => "free space unknown".to_string(),
                };
                println!("  size     {} ({})", format_bytes(plan.total_bytes), note);
            }
        }
        ItemOutcome::Placed {
            report,
            skipped,
            source_removed,
        } => {
            for placed in &report.placed {
                println!("  placed   {}", placed.display());
            }
            for old in &report.superseded {
                println!("  replaced {}", old.display());
            }
            for s in skipped {
                println!(
                    "  skip     {} ({})",
                    s.source.display(),
                    describe_decision(&s.decision)
                );
            }
            if *source_removed {
                println!("  source removed");
            }
        }
        ItemOutcome::Skipped {
            skipped,
            source_removed,
        } => {
            for s in skipped {
                println!(
                    "  skip     {} ({})",
                    s.source.display(),
                    describe_decision(&s.decision)
                );
            }
            if *source_removed {
                println!("  source removed");
            }
        }
        ItemOutcome::Failed(record) => {
            println!("  failed   [{}] {}", record.kind, record.reason);
        }
        ItemOutcome::Vanished => println!("  vanished"),
        ItemOutcome::Cancelled => println!("  cancelled"),
    }
}

/// Print the effective configuration and check external tools
pub async fn check(config: &Config) -> Result<()> {
    config.validate()?;

    println!("source dir:           {}", config.source_dir.display());
    println!("tv dir:               {}", config.tv_dir.display());
    println!("movies dir:           {}", config.movies_dir.display());
    println!(
        "failure dir:          {}",
        config
            .failure_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "(log only)".to_string())
    );
    println!("confidence threshold: {}", config.confidence_threshold);
    println!("tie break:            {:?}", config.tie_break);
    println!("delete source files:  {}", config.delete_source_files);
    println!("delete on skip:       {}", config.delete_source_on_skip);
    println!("workers:              {}", config.workers);
    println!("process delay:        {:?}", config.process_delay);
    println!(
        "stability:            every {:?}, {} samples, timeout {:?}",
        config.stability_interval, config.stability_samples, config.stability_timeout
    );
    println!(
        "tvdb api key:         {}",
        if config.tvdb_api_key.as_deref().is_some_and(|k| !k.is_empty()) {
            "set"
        } else {
            "missing"
        }
    );

    let ffprobe = FfmpegService::new(config.ffprobe_path.clone(), config.probe_timeout);
    if ffprobe.is_available().await {
        println!("ffprobe:              {} (ok)", config.ffprobe_path);
    } else {
        println!("ffprobe:              {} (not found)", config.ffprobe_path);
        anyhow::bail!("ffprobe is not available at {}", config.ffprobe_path);
    }

    Ok(())
}
