use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use daemon::{
    concurrency::ConcurrencyController,
    config::DaemonConfig,
    encoder::AbAv1,
    events::{DaemonEvent, EventBus},
    failures::FailureTracker,
    media::VideoState,
    mediainfo::MediaInfoAdapter,
    pipeline::{spawn_pipeline, PipelineDeps, PipelineHandle},
    scan,
    stages::{AnalysisStage, CrfSearchStage, EncodeStage},
    state::PipelineState,
    store::{JsonFileStore, VideoStore},
};
use log::{debug, error, info, warn};
use serde::Deserialize;

/// Bulk video re-encoding daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Operator command dropped into the commands directory as JSON.
#[derive(Debug, Deserialize)]
struct CommandFile {
    command: String,
    path: Option<PathBuf>,
    stage: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger - use RUST_LOG env var or default to info level
    // (debug when --verbose is set)
    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp_secs();
    if args.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let cfg = DaemonConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    info!("revid daemon starting");
    info!("Configuration loaded:");
    info!("  Library roots: {:?}", cfg.library_roots);
    info!("  Min bytes: {}", cfg.min_bytes);
    info!("  Max size ratio: {}", cfg.max_size_ratio);
    info!("  State dir: {}", cfg.state_dir.display());
    info!("  Scan interval: {}s", cfg.scan_interval_secs);
    info!(
        "  Targets: {} video / {} audio",
        cfg.target_video_codec, cfg.target_audio_codec
    );

    for root in &cfg.library_roots {
        if root.exists() {
            info!("Library root exists: {}", root.display());
        } else {
            warn!("Library root does not exist: {}", root.display());
        }
    }

    fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("Failed to create state directory: {}", cfg.state_dir.display()))?;
    fs::create_dir_all(&cfg.temp_dir)
        .with_context(|| format!("Failed to create temp directory: {}", cfg.temp_dir.display()))?;
    fs::create_dir_all(cfg.commands_dir()).with_context(|| {
        format!(
            "Failed to create commands directory: {}",
            cfg.commands_dir().display()
        )
    })?;

    let store = Arc::new(JsonFileStore::open(&cfg.state_dir).context("Failed to open store")?);
    let events = EventBus::default();
    spawn_event_logger(events.clone());

    let failures = FailureTracker::new(store.clone());
    let deps = PipelineDeps {
        store: store.clone(),
        adapter: Arc::new(MediaInfoAdapter::new(cfg.mediainfo_bin.clone())),
        controller: Arc::new(ConcurrencyController::new(cfg.concurrency.clone())),
        events: events.clone(),
        failures: failures.clone(),
    };

    let ab_av1 = Arc::new(AbAv1::new(
        cfg.ab_av1_bin.clone(),
        cfg.temp_dir.clone(),
        cfg.min_vmaf,
        cfg.preset,
    ));

    let analysis = spawn_pipeline(
        Arc::new(AnalysisStage::new(
            cfg.target_video_codec.clone(),
            cfg.target_audio_codec.clone(),
        )),
        deps.clone(),
        cfg.analysis.clone(),
        cfg.mediainfo_chunk_size,
    );
    let search = spawn_pipeline(
        Arc::new(CrfSearchStage::new(
            ab_av1.clone(),
            cfg.target_video_codec.clone(),
        )),
        deps.clone(),
        cfg.search.clone(),
        cfg.mediainfo_chunk_size,
    );
    let encode = spawn_pipeline(
        Arc::new(EncodeStage::new(
            ab_av1,
            cfg.target_video_codec.clone(),
            cfg.max_size_ratio,
        )),
        deps.clone(),
        cfg.encode.clone(),
        cfg.mediainfo_chunk_size,
    );

    let pipelines = [analysis.clone(), search, encode];
    for pipeline in &pipelines {
        pipeline.resume().await;
    }

    info!("All pipelines resumed; scanning every {}s", cfg.scan_interval_secs);

    loop {
        run_cycle(&cfg, store.as_ref(), &events, &failures, &pipelines, &analysis).await;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(cfg.scan_interval_secs)) => {}
        }
    }

    shutdown(&pipelines).await;
    info!("revid daemon stopped");
    Ok(())
}

/// One daemon cycle: scan the library, nudge analysis if anything new
/// landed, then apply any operator command files.
async fn run_cycle(
    cfg: &DaemonConfig,
    store: &dyn VideoStore,
    events: &EventBus,
    failures: &FailureTracker,
    pipelines: &[PipelineHandle],
    analysis: &PipelineHandle,
) {
    match scan::scan_library(cfg, store).await {
        Ok(summary) => {
            events.emit(DaemonEvent::ScanCompleted {
                candidates: summary.candidates,
                skipped: summary.skipped,
                new_records: summary.new_records,
            });
            if summary.new_records > 0 {
                analysis.dispatch_available();
            }
        }
        Err(e) => error!("Library scan failed: {e:#}"),
    }

    match process_command_files(cfg, failures, pipelines).await {
        Ok(0) => {}
        Ok(n) => info!("Processed {n} command file(s)"),
        Err(e) => error!("Command file processing failed: {e:#}"),
    }
}

/// Apply operator commands (retry/pause/resume) dropped as JSON files into
/// the commands directory. Files are removed once handled.
async fn process_command_files(
    cfg: &DaemonConfig,
    failures: &FailureTracker,
    pipelines: &[PipelineHandle],
) -> Result<usize> {
    let commands_dir = cfg.commands_dir();
    let mut processed = 0;

    for entry in fs::read_dir(&commands_dir)
        .with_context(|| format!("Failed to read commands dir: {}", commands_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        let parsed: Result<CommandFile> = fs::read_to_string(&path)
            .context("unreadable command file")
            .and_then(|body| serde_json::from_str(&body).context("unparsable command file"));

        match parsed {
            Ok(command) => apply_command(&command, failures, pipelines).await,
            Err(e) => warn!("Ignoring bad command file {}: {e:#}", path.display()),
        }

        if let Err(e) = fs::remove_file(&path) {
            warn!("Could not remove command file {}: {e}", path.display());
        }
        processed += 1;
    }

    Ok(processed)
}

async fn apply_command(
    command: &CommandFile,
    failures: &FailureTracker,
    pipelines: &[PipelineHandle],
) {
    match command.command.as_str() {
        "retry" => {
            let Some(path) = &command.path else {
                warn!("retry command without a path");
                return;
            };
            // A manual retry re-enters the pipeline from the top; analysis
            // re-derives everything downstream.
            match failures.retry(path, VideoState::NeedsAnalysis) {
                Ok(Some(record)) => {
                    info!("Requeued {} (record {})", path.display(), record.id);
                    if let Some(analysis) = pipelines.first() {
                        analysis.dispatch_available();
                    }
                }
                Ok(None) => warn!("retry: no record for {}", path.display()),
                Err(e) => error!("retry failed for {}: {e}", path.display()),
            }
        }
        "pause" | "resume" => {
            for pipeline in pipelines {
                let matches_stage = command
                    .stage
                    .as_deref()
                    .map(|s| s == pipeline.stage())
                    .unwrap_or(true);
                if matches_stage {
                    if command.command == "pause" {
                        pipeline.pause().await;
                    } else {
                        pipeline.resume().await;
                    }
                }
            }
        }
        other => warn!("Unknown command: {other}"),
    }
}

/// Pause every pipeline and wait for in-flight batches to finish.
async fn shutdown(pipelines: &[PipelineHandle]) {
    for pipeline in pipelines {
        pipeline.pause().await;
    }

    for _ in 0..120 {
        let mut all_paused = true;
        for pipeline in pipelines {
            if pipeline.state().await != PipelineState::Paused {
                all_paused = false;
                break;
            }
        }
        if all_paused {
            info!("All pipelines paused");
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    warn!("Timed out waiting for pipelines to pause; exiting anyway");
}

/// Mirror telemetry events into the log.
fn spawn_event_logger(events: EventBus) {
    tokio::spawn(async move {
        let mut rx = events.subscribe();
        loop {
            match rx.recv().await {
                Ok(DaemonEvent::BatchThroughput {
                    stage,
                    batch_size,
                    queue_depth_remaining,
                }) => info!(
                    "[{stage}] batch of {batch_size} completed, {queue_depth_remaining} still queued"
                ),
                Ok(DaemonEvent::ScanCompleted {
                    candidates,
                    skipped,
                    new_records,
                }) => info!(
                    "Scan: {candidates} candidate(s), {skipped} skipped, {new_records} new"
                ),
                Ok(DaemonEvent::StageCompleted { stage, processed }) => {
                    debug!("[{stage}] stage completed for {processed} item(s)")
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("event logger lagged, missed {missed} event(s)")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
