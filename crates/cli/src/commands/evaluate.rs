//! Evaluate mode - dataset-level accuracy and pipeline counters

use super::ModelArgs;
use anyhow::{bail, Context as _, Result};
use clap::Args;
use detect_fusion_pipeline::{DatasetEvaluator, YoloLabelDirectory};
use rayon::prelude::*;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Args)]
pub struct EvaluateCommand {
    #[command(flatten)]
    models: ModelArgs,

    /// YOLO-format dataset (images/ and labels/)
    #[arg(long, value_name = "DIR")]
    dataset: PathBuf,

    /// Labeled dataset for the shape prior; defaults to the evaluated dataset
    #[arg(long, value_name = "DIR")]
    reference: Option<PathBuf>,
}

impl EvaluateCommand {
    pub fn execute(self) -> Result<()> {
        let start = Instant::now();

        let dataset = YoloLabelDirectory::new(&self.dataset);
        let samples = dataset
            .samples()
            .with_context(|| format!("Failed to read dataset {}", self.dataset.display()))?;
        if samples.is_empty() {
            bail!("No images found in {}", dataset.root().join("images").display());
        }

        let reference = YoloLabelDirectory::new(self.reference.as_ref().unwrap_or(&self.dataset));
        let pipeline = self.models.build_pipeline(Some(&reference))?;

        info!(
            "Evaluating {} images with {} threads",
            samples.len(),
            rayon::current_num_threads()
        );

        let results: Vec<_> = samples
            .par_iter()
            .filter_map(|sample| {
                let truth = sample.ground_truth();
                match pipeline.detect_path(&sample.image_path, Some(&truth)) {
                    Ok(report) => Some((report.detections, truth)),
                    Err(e) => {
                        warn!("Skipping {}: {}", sample.image_path.display(), e);
                        None
                    }
                }
            })
            .collect();

        let mut evaluator = DatasetEvaluator::new();
        for (detections, truth) in &results {
            evaluator.add_image(detections, truth);
        }
        let summary = evaluator.summary();

        let report = serde_json::json!({
            "dataset": self.dataset,
            "images": samples.len(),
            "failed": samples.len() - results.len(),
            "summary": summary,
            "fusion": pipeline.fusion_counters(),
            "trigger_rate": pipeline.trigger_rate(),
            "shape_bounds": pipeline.shape_bounds(),
            "roi": pipeline.roi_stats(),
            "false_positive_ratio": pipeline.false_positive_ratio(),
            "mean_false_positives": pipeline.mean_false_positives(),
            "refinement_enabled": pipeline.refinement_enabled(),
            "elapsed_s": start.elapsed().as_secs_f64(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);

        info!(
            "Precision {:.3}, recall {:.3}, F1 {:.3}, AP {:.3}",
            summary.precision, summary.recall, summary.f1, summary.average_precision
        );
        Ok(())
    }
}
