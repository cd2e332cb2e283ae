//! Detect Fusion CLI - two-detector object detection
//!
//! Runs the transformer and single-stage detectors over images and fuses
//! their outputs.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use rayon::ThreadPoolBuilder;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;

use commands::detect::DetectCommand;
use commands::evaluate::EvaluateCommand;

#[derive(Parser)]
#[command(
    name = "detect-fusion",
    version,
    about = "Fused transformer + single-stage object detection",
    after_help = "EXAMPLES:\n  \
                  # Detect with both models, one JSON object per image\n  \
                  detect-fusion detect --detr models/detr.onnx --yolo models/yolov8s.onnx scan1.jpg scan2.jpg\n\n  \
                  # Trigger-fallback fusion with a custom config\n  \
                  detect-fusion detect --detr models/detr.onnx --yolo models/yolov8s.onnx --strategy trigger-fallback scan.jpg\n\n  \
                  # Evaluate on a YOLO-format dataset (images/ + labels/)\n  \
                  detect-fusion evaluate --detr models/detr.onnx --yolo models/yolov8s.onnx --dataset data/val"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect objects in images
    Detect(DetectCommand),

    /// Measure precision, recall and AP on a labeled dataset
    Evaluate(EvaluateCommand),
}

fn main() -> Result<()> {
    // Limit rayon parallelism for evaluation runs
    if let Ok(jobs) = std::env::var("DETECT_FUSION_JOBS") {
        if let Ok(num_threads) = jobs.parse::<usize>() {
            ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build_global()
                .ok(); // already initialized
        }
    }

    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    // Logs go to stderr so stdout stays machine-readable
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Detect(cmd) => cmd.execute(),
        Commands::Evaluate(cmd) => cmd.execute(),
    }
}
