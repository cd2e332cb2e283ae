//! Detection fusion pipeline
//!
//! Combines a transformer detector (primary) and a single-stage detector
//! (secondary) into one detection set per image.
//!
//! ## Architecture
//!
//! 1. **Robust post-processing** of each detector's raw output
//! 2. **Fusion** by trigger fallback or calibrated soft voting
//!    ([`FusionEngine`]), with an aspect-ratio shape prior
//!    ([`ShapeBoundsEstimator`]) gating voted clusters
//! 3. **ROI refinement** ([`RoiRefinementStage`]): the least confident
//!    detections are cropped and re-detected by a dedicated detector instance
//! 4. **Adaptive gate** ([`AdaptiveGate`]): a rolling false-positive window
//!    decides whether refinement runs
//!
//! ## Example
//!
//! ```no_run
//! use detect_fusion_detectors::{DetectorSlot, DetrDetector, YoloDetector};
//! use detect_fusion_pipeline::{DetectionPipeline, PipelineConfig};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let primary = Arc::new(DetrDetector::new("models/detr.onnx", 640)?);
//! let secondary = DetectorSlot::load("models/yolov8s.onnx", YoloDetector::from_path);
//! let roi = DetectorSlot::load("models/detr.onnx", DetrDetector::from_path);
//!
//! let pipeline = DetectionPipeline::new(PipelineConfig::default(), primary, secondary, roi, None)?;
//! let report = pipeline.detect_path(Path::new("scan.jpg"), None)?;
//! println!("{} detections in {:.1}ms", report.detections.len(), report.latency_ms);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod fusion;
pub mod gate;
pub mod metrics;
pub mod pipeline;
pub mod roi;
pub mod shape;

use detect_fusion_common::ProcessingError;
use detect_fusion_detectors::{DetectorError, ImageSourceError};
use thiserror::Error;

pub use config::{
    CalibrationConfig, ConfigError, FusionStrategy, GateConfig, PipelineConfig, RoiConfig,
    ShapeConfig, TriggerConfig,
};
pub use fusion::{
    calibration_weight, soft_voting_combine, CalibrationWeights, FusionCounters, FusionEngine,
    FusionOutcome, SoftVote,
};
pub use gate::{AdaptiveGate, FalsePositiveWindow};
pub use metrics::{count_fn, count_fp, DatasetEvaluator, EvaluationSummary, ImageMetrics};
pub use pipeline::{DetectionPipeline, DetectionReport};
pub use roi::{RoiBatchStats, RoiRefinement, RoiRefinementStage};
pub use shape::{
    DatasetError, DatasetSample, ReferenceLabel, ReferenceLabelSource, ShapeBounds,
    ShapeBoundsEstimator, YoloLabelDirectory,
};

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Image error: {0}")]
    Image(#[from] ImageSourceError),

    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),
}

impl From<PipelineError> for ProcessingError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Config(e) => ProcessingError::InvalidConfig(e.to_string()),
            PipelineError::Image(e) => ProcessingError::CorruptedImage(e.to_string()),
            PipelineError::Detector(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: ProcessingError =
            PipelineError::from(DetectorError::ModelLoad("gone".into())).into();
        assert!(matches!(err, ProcessingError::ModelUnavailable(_)));

        let err: ProcessingError = PipelineError::from(ConfigError::Zero { field: "x" }).into();
        assert!(matches!(err, ProcessingError::InvalidConfig(_)));
    }
}
