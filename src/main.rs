//! CLI Entry Point for rust-mda
//!
//! Provides command-line interface for:
//! - Running a multi-dimensional acquisition against the simulated camera
//! - Checking a configuration file
//!
//! # Usage
//!
//! Run a 2-position, 10-timepoint, 2-channel time-lapse:
//! ```bash
//! rust_mda run --positions 2 --timepoints 10 --channels DAPI,GFP --interval-ms 500
//! ```
//!
//! Run a plan file in continuous mode:
//! ```bash
//! rust_mda run --plan plan.toml --strategy continuous
//! ```
//!
//! Validate a configuration:
//! ```bash
//! rust_mda check-config config/acquisition.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_mda::config::AcqConfig;
use rust_mda::data::memory_sink::MemorySink;
use rust_mda::data::storage::DatasetReader;
use rust_mda::experiment::{
    replay_dataset, AcquisitionEvent, AcquisitionPlan, AcquisitionScheduler, CancellationToken,
    ChannelSpec, EventChannel, IterationOrder, RunOutcome, Strategy,
};
use rust_mda::tracing_init;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rust_mda")]
#[command(about = "Multi-dimensional image acquisition scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one acquisition with the simulated camera
    Run {
        /// Configuration file (defaults plus RUST_MDA_* variables when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Plan file (TOML); flags below override its fields
        #[arg(long)]
        plan: Option<PathBuf>,

        #[arg(long)]
        positions: Option<u64>,

        #[arg(long)]
        timepoints: Option<u64>,

        /// Comma-separated channel names
        #[arg(long, value_delimiter = ',')]
        channels: Option<Vec<String>>,

        /// Number of focus slices
        #[arg(long)]
        z_slices: Option<u64>,

        /// Focus step between slices in micrometres
        #[arg(long, default_value = "5.0")]
        z_step_um: f64,

        /// Time-lapse interval in milliseconds
        #[arg(long)]
        interval_ms: Option<f64>,

        /// stepwise | continuous
        #[arg(long)]
        strategy: Option<Strategy>,

        /// Read the dataset back after the run
        #[arg(long)]
        verify: bool,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Path to the TOML configuration
        file: PathBuf,
    },
}

struct PlanArgs {
    plan: Option<PathBuf>,
    positions: Option<u64>,
    timepoints: Option<u64>,
    channels: Option<Vec<String>>,
    z_slices: Option<u64>,
    z_step_um: f64,
    interval_ms: Option<f64>,
    strategy: Option<Strategy>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            plan,
            positions,
            timepoints,
            channels,
            z_slices,
            z_step_um,
            interval_ms,
            strategy,
            verify,
        } => {
            let args = PlanArgs {
                plan,
                positions,
                timepoints,
                channels,
                z_slices,
                z_step_um,
                interval_ms,
                strategy,
            };
            run_acquisition(config, args, verify).await
        }
        Commands::CheckConfig { file } => check_config(file),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AcqConfig> {
    let config = match path {
        Some(path) => AcqConfig::load_from(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AcqConfig::load().context("Failed to load config from environment")?,
    };
    config.validate()?;
    Ok(config)
}

fn build_plan(args: PlanArgs) -> Result<AcquisitionPlan> {
    let mut plan = match &args.plan {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read plan {}", path.display()))?;
            AcquisitionPlan::from_toml(&text)?
        }
        None => AcquisitionPlan::default(),
    };

    if let Some(positions) = args.positions {
        plan.positions = positions;
    }
    if let Some(timepoints) = args.timepoints {
        plan.timepoints = timepoints;
    }
    if let Some(names) = args.channels {
        plan.channels = names
            .into_iter()
            .map(|name| ChannelSpec::new(name, 0.0, 1.0))
            .collect();
    }
    if let Some(slices) = args.z_slices {
        plan.z_offsets_um = (0..slices).map(|i| i as f64 * args.z_step_um).collect();
    }
    if let Some(interval_ms) = args.interval_ms {
        plan.interval_ms = interval_ms;
    }
    if let Some(strategy) = args.strategy {
        plan.strategy = strategy;
    }

    plan.validate()?;
    Ok(plan)
}

async fn run_acquisition(config: Option<PathBuf>, args: PlanArgs, verify: bool) -> Result<()> {
    let config = load_config(config)?;
    tracing_init::init_from_config(&config)?;

    let plan = build_plan(args)?;
    let shape = plan.shape()?;
    println!("rust_mda - Multi-dimensional acquisition");
    println!("   Strategy: {}", plan.strategy);
    println!("   Shape:    {:?} ({} frames)", shape.dims(), shape.len());
    println!("   Interval: {} ms", plan.interval_ms);
    println!();

    let camera = Arc::new(config.mock_camera());
    let sink = Arc::new(MemorySink::new());
    let events = EventChannel::new(config.scheduler.event_capacity);
    let scheduler = Arc::new(
        AcquisitionScheduler::new(camera, sink.clone())
            .with_settings(config.scheduler_settings())
            .with_events(events.clone()),
    );

    let mut rx = events.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(AcquisitionEvent::Progress(state)) => {
                    println!(
                        "   [{}/{}] buffer {}/{} free, write {:.1} ms total",
                        state.current,
                        state.total,
                        state.buffer_free,
                        state.buffer_total,
                        state.write_time_ms
                    );
                }
                Ok(AcquisitionEvent::Log(message)) => println!("   {}", message),
                Ok(event) if event.is_terminal() => break,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Progress printer skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let handle = scheduler.start(plan)?;
    let token = handle.token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, cancelling acquisition");
            token.request_cancel();
        }
    });

    let report = handle.join().await?;
    ctrl_c.abort();
    // The terminal event has been sent; the printer exits on it.
    let _ = printer.await;

    println!();
    println!("Run {}", report.run_id);
    println!("   Outcome:        {}", report.outcome);
    println!(
        "   Frames written: {}/{}",
        report.frames_written, report.total_steps
    );
    println!("   Mean write:     {:.3} ms", report.mean_write_ms());
    println!("   Elapsed:        {:.3} s", report.elapsed.as_secs_f64());

    if verify {
        let dataset = sink
            .load_dataset(&config.storage.location, &config.storage.dataset_name)
            .await?;
        let summary = replay_dataset(
            &*sink,
            &dataset,
            IterationOrder::Sequential,
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .await?;
        println!(
            "   Verified:       {} images read back, {} missing",
            summary.visited, summary.missing
        );
    }

    match report.outcome {
        RunOutcome::Failed { message, .. } => Err(anyhow::anyhow!(message)),
        RunOutcome::Completed | RunOutcome::Cancelled => Ok(()),
    }
}

fn check_config(file: PathBuf) -> Result<()> {
    let config = load_config(Some(file.clone()))?;
    println!("Configuration {} is valid", file.display());
    println!(
        "   Scheduler: {} polls x {:?}",
        config.scheduler.max_buffer_polls, config.scheduler.poll_interval
    );
    println!(
        "   Storage:   {}/{}",
        config.storage.location, config.storage.dataset_name
    );
    println!(
        "   Camera:    {}x{} @ {} B/px, buffer {}",
        config.camera.width,
        config.camera.height,
        config.camera.bytes_per_pixel,
        config.camera.buffer_capacity
    );
    Ok(())
}
