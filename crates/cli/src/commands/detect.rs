//! Detect mode - one JSON object per input image on stdout

use super::ModelArgs;
use anyhow::{bail, Result};
use clap::Args;
use detect_fusion_pipeline::{ReferenceLabelSource, YoloLabelDirectory};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Args)]
pub struct DetectCommand {
    #[command(flatten)]
    models: ModelArgs,

    /// YOLO-format dataset whose labels estimate the shape prior
    #[arg(long, value_name = "DIR")]
    dataset: Option<PathBuf>,

    /// Input images
    #[arg(value_name = "IMAGE", required = true)]
    images: Vec<PathBuf>,
}

impl DetectCommand {
    pub fn execute(self) -> Result<()> {
        let start = Instant::now();

        let reference = self.dataset.as_ref().map(YoloLabelDirectory::new);
        let pipeline = self
            .models
            .build_pipeline(reference.as_ref().map(|r| r as &dyn ReferenceLabelSource))?;

        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let mut failed = 0usize;

        for path in &self.images {
            match pipeline.detect_path(path, None) {
                Ok(report) => {
                    let line = serde_json::json!({
                        "image": path,
                        "detections": report.detections,
                        "triggered": report.triggered,
                        "fallback_used": report.fallback_used,
                        "refinement_ran": report.refinement_ran,
                        "latency_ms": report.latency_ms,
                    });
                    writeln!(out, "{line}")?;
                }
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    failed += 1;
                }
            }
        }

        info!(
            "Processed {} images in {:.2}s (trigger rate {:.2})",
            self.images.len() - failed,
            start.elapsed().as_secs_f64(),
            pipeline.trigger_rate()
        );

        if failed > 0 {
            bail!("{} of {} images failed", failed, self.images.len());
        }
        Ok(())
    }
}
