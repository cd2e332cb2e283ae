//! Subcommands and the model/config arguments they share

pub mod detect;
pub mod evaluate;

use anyhow::{Context as _, Result};
use clap::{Args, ValueEnum};
use detect_fusion_detectors::{DetectorSlot, DetrDetector, YoloDetector};
use detect_fusion_pipeline::{
    DetectionPipeline, FusionStrategy, PipelineConfig, ReferenceLabelSource,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum StrategyArg {
    TriggerFallback,
    SoftVoting,
}

impl From<StrategyArg> for FusionStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::TriggerFallback => FusionStrategy::TriggerFallback,
            StrategyArg::SoftVoting => FusionStrategy::SoftVoting,
        }
    }
}

#[derive(Args)]
pub struct ModelArgs {
    /// Transformer (DETR) ONNX model, the primary detector
    #[arg(long, value_name = "ONNX")]
    detr: PathBuf,

    /// Single-stage (YOLOv8) ONNX model; omitted means primary-only detection
    #[arg(long, value_name = "ONNX")]
    yolo: Option<PathBuf>,

    /// Pipeline configuration (YAML)
    #[arg(short, long, value_name = "YAML")]
    config: Option<PathBuf>,

    /// Override the configured fusion strategy
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Disable ROI refinement
    #[arg(long, default_value = "false")]
    no_roi: bool,
}

impl ModelArgs {
    pub fn load_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_yaml(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if let Some(strategy) = self.strategy {
            config.strategy = strategy.into();
        }
        if self.no_roi {
            config.roi.enabled = false;
        }
        Ok(config)
    }

    /// Load the models and build a pipeline
    ///
    /// The ROI detector is a second DETR session so crop batches never
    /// contend with full-image inference.
    pub fn build_pipeline(
        &self,
        reference: Option<&dyn ReferenceLabelSource>,
    ) -> Result<DetectionPipeline> {
        let config = self.load_config()?;

        let primary = DetrDetector::from_path(&self.detr)
            .with_context(|| format!("Failed to load DETR model {}", self.detr.display()))?;

        let secondary = match &self.yolo {
            Some(path) => DetectorSlot::load(path, YoloDetector::from_path),
            None => DetectorSlot::unavailable("no YOLO model given"),
        };

        let roi_detector = if config.roi.enabled {
            DetectorSlot::load(&self.detr, DetrDetector::from_path)
        } else {
            DetectorSlot::unavailable("ROI refinement disabled")
        };

        info!(
            "Loaded models: DETR {}, YOLO {}",
            self.detr.display(),
            if secondary.is_available() { "yes" } else { "no" }
        );

        DetectionPipeline::new(config, Arc::new(primary), secondary, roi_detector, reference)
            .context("Failed to build detection pipeline")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        models: ModelArgs,
    }

    #[test]
    fn test_strategy_and_roi_overrides() {
        let cli = TestCli::parse_from([
            "detect-fusion",
            "--detr",
            "detr.onnx",
            "--strategy",
            "trigger-fallback",
            "--no-roi",
        ]);
        let config = cli.models.load_config().unwrap();
        assert_eq!(config.strategy, FusionStrategy::TriggerFallback);
        assert!(!config.roi.enabled);
        assert!(cli.models.yolo.is_none());
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "strategy: trigger_fallback\nroi:\n  batch_size: 8\n").unwrap();

        let cli = TestCli::parse_from([
            "detect-fusion",
            "--detr",
            "detr.onnx",
            "--config",
            path.to_str().unwrap(),
        ]);
        let config = cli.models.load_config().unwrap();
        assert_eq!(config.strategy, FusionStrategy::TriggerFallback);
        assert_eq!(config.roi.batch_size, 8);
    }

    #[test]
    fn test_missing_model_fails() {
        let cli = TestCli::parse_from(["detect-fusion", "--detr", "/nonexistent/detr.onnx"]);
        assert!(cli.models.build_pipeline(None).is_err());
    }
}
