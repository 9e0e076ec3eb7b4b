//! # Sluice CLI - Streaming ETL Pipeline Runner
//!
//! Loads a YAML pipeline specification, wires the source, transform, and
//! sink, and runs the pipeline with progress logging and graceful Ctrl-C
//! cancellation.
//!
//! ## Usage
//!
//! ```bash
//! # Run a pipeline from a YAML configuration file
//! sluice --pipeline people.yml
//!
//! # Tune the inter-stage channel capacity
//! sluice --pipeline people.yml --channel-capacity 256
//!
//! # Enable debug logging
//! RUST_LOG=debug sluice --pipeline people.yml
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use sluice_core::config::PipelineSpec;
use sluice_core::pipeline::{Pipeline, PipelineStatus};
use sluice_expr::ExprCache;
use sluice_io::{create_sink, create_source, Culture};
use sluice_tx::create_transform;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the pipeline runner.
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Streaming ETL pipeline runner")]
struct Args {
    /// Pipeline YAML configuration file.
    #[arg(short, long)]
    pipeline: PathBuf,

    /// Capacity of the inter-stage channels; overrides the configured
    /// value. Lower bounds memory, higher smooths bursts.
    #[arg(long)]
    channel_capacity: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let spec: PipelineSpec = {
        let yaml = std::fs::read_to_string(&args.pipeline)
            .with_context(|| format!("read {}", args.pipeline.display()))?;
        serde_yaml::from_str(&yaml).context("parse pipeline spec")?
    };
    info!(pipeline = %spec.name, "loaded spec");

    let culture = Culture::resolve(spec.culture.as_deref())?;
    let cache = ExprCache::new();
    let source = create_source(&spec.source, culture)?;
    let transform = create_transform(&spec.transform, source.schema(), &cache)?;
    let sink = create_sink(&spec.sink, transform.output_schema())?;

    let pipeline = Pipeline::new(source, transform, sink)?
        .with_channel_capacity(args.channel_capacity.unwrap_or(spec.channel_capacity));
    let cancel = pipeline.cancellation_token();
    let telemetry = pipeline.telemetry();

    // Progress snapshots arrive on every stage update.
    let mut progress = telemetry.subscribe();
    let progress_task = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow_and_update().clone();
            info!(
                extracted = snapshot.extract.current_line,
                transformed = snapshot.transform.current_line,
                loaded = snapshot.load.current_line,
                percent = format!("{:.1}", snapshot.global.percent_complete),
                speed = format!("{:.0}/s", snapshot.global.speed),
                "progress"
            );
        }
    });

    let mut errors = telemetry.subscribe_errors();
    tokio::spawn(async move {
        while let Ok(notification) = errors.recv().await {
            error!(
                stage = %notification.stage,
                line = notification.current_line,
                row = notification.partial_row.as_deref().unwrap_or(""),
                "{}",
                notification.cause
            );
        }
    });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("received Ctrl-C, cancelling pipeline");
                cancel.cancel();
            }
        }
    });

    let summary = pipeline.execute().await;
    progress_task.abort();

    match summary.status {
        PipelineStatus::Completed => {
            info!(
                extracted = summary.extracted_lines,
                transformed = summary.transformed_lines,
                loaded = summary.loaded_lines,
                elapsed = ?summary.elapsed,
                "pipeline completed"
            );
            Ok(())
        }
        PipelineStatus::Cancelled => bail!("pipeline cancelled"),
        PipelineStatus::Failed => {
            let cause = summary
                .first_error
                .map(|e| format!("{} stage: {}", e.stage, e.cause))
                .unwrap_or_else(|| "unknown failure".to_string());
            bail!("pipeline failed: {cause}");
        }
    }
}
