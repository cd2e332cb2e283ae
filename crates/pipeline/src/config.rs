//! Pipeline configuration
//!
//! Every bundle derives serde with `#[serde(default)]`, so a YAML file only
//! needs the keys it changes:
//!
//! ```yaml
//! strategy: trigger_fallback
//! primary_score_threshold: 0.35
//! trigger:
//!   min_primary_count: 2
//! roi:
//!   batch_size: 8
//! ```

use detect_fusion_postprocess::{ParamsError, RobustParams};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid {role} post-processing parameters: {source}")]
    Params {
        role: &'static str,
        #[source]
        source: ParamsError,
    },

    #[error("{field} must lie in [0, 1], got {value}")]
    OutOfUnitRange { field: &'static str, value: f32 },

    #[error("{field} must be finite and non-negative, got {value}")]
    Negative { field: &'static str, value: f32 },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{min_field} ({min}) exceeds {max_field} ({max})")]
    InvertedRange {
        min_field: &'static str,
        min: f32,
        max_field: &'static str,
        max: f32,
    },
}

/// How the two detectors are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    /// Run the secondary detector only when the primary output looks weak
    TriggerFallback,
    /// Always run both detectors and vote over calibrated clusters
    #[default]
    SoftVoting,
}

/// When the trigger-fallback strategy invokes the secondary detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Trigger when the cleaned primary output has fewer boxes than this
    pub min_primary_count: usize,
    /// Number of highest primary scores inspected for the variance test
    pub top_k: usize,
    /// Trigger when the population variance of the top-K scores is below this
    pub min_score_variance: f32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            min_primary_count: 1,
            top_k: 5,
            min_score_variance: 0.0025,
        }
    }
}

/// Expected calibration error of each detector
///
/// Scores are scaled by `1 / ece` before voting; a non-positive value means
/// weight 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub ece_primary: f32,
    pub ece_secondary: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            ece_primary: 1.0,
            ece_secondary: 1.0,
        }
    }
}

/// Aspect-ratio acceptance window for voted clusters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeConfig {
    /// Reject clusters outside the shape bounds
    pub enabled: bool,
    /// Lower clamp for bounds learned from reference labels
    pub min_aspect: f32,
    /// Upper clamp for bounds learned from reference labels
    pub max_aspect: f32,
}

impl Default for ShapeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_aspect: 0.30,
            max_aspect: 6.0,
        }
    }
}

/// Second-pass inspection of uncertain detections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    pub enabled: bool,
    /// Detections at or above this score skip refinement
    pub high_confidence: f32,
    /// Crop expansion as a fraction of box width/height on each side
    pub crop_margin: f32,
    /// Minimum `IoU` between a re-detection and its candidate to confirm it
    pub confirm_iou: f32,
    /// Fraction of the least confident candidates sent to refinement
    pub uncertain_quantile: f32,
    /// Crops per detector call
    pub batch_size: usize,
    /// Score threshold for re-detections inside a crop
    pub score_threshold: f32,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_confidence: 0.85,
            crop_margin: 0.20,
            confirm_iou: 0.40,
            uncertain_quantile: 0.05,
            batch_size: 4,
            score_threshold: 0.30,
        }
    }
}

/// Rolling false-positive gate in front of ROI refinement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Number of most recent ground-truth images kept
    pub window: usize,
    /// Refinement runs while the fraction of windowed images with a false
    /// positive exceeds this
    pub fp_ratio_threshold: f32,
    /// Gate state before any ground truth has been seen
    pub enabled_by_default: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            window: 50,
            fp_ratio_threshold: 0.05,
            enabled_by_default: true,
        }
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub strategy: FusionStrategy,
    /// Score threshold for the transformer (primary) detector
    pub primary_score_threshold: f32,
    /// Score threshold for the single-stage (secondary) detector
    pub secondary_score_threshold: f32,
    /// Median denoise and value equalization before inference
    pub preprocess: bool,
    pub primary: RobustParams,
    pub secondary: RobustParams,
    /// Parameters for re-cleaning fused output
    pub ensemble: RobustParams,
    /// Parameters for cleaning re-detections inside ROI crops
    pub roi_params: RobustParams,
    pub trigger: TriggerConfig,
    /// `IoU` above which weighted box fusion merges boxes
    pub wbf_iou_threshold: f32,
    pub calibration: CalibrationConfig,
    /// `IoU` at or above which soft voting joins a detection to a cluster
    pub cluster_iou_threshold: f32,
    /// Minimum mean calibrated score of a voted cluster
    pub ensemble_threshold: f32,
    pub shape: ShapeConfig,
    pub roi: RoiConfig,
    pub gate: GateConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::SoftVoting,
            primary_score_threshold: 0.30,
            secondary_score_threshold: 0.60,
            preprocess: true,
            primary: RobustParams::default(),
            secondary: RobustParams::default(),
            ensemble: RobustParams::default(),
            roi_params: RobustParams::roi(),
            trigger: TriggerConfig::default(),
            wbf_iou_threshold: 0.5,
            calibration: CalibrationConfig::default(),
            cluster_iou_threshold: 0.5,
            ensemble_threshold: 0.40,
            shape: ShapeConfig::default(),
            roi: RoiConfig::default(),
            gate: GateConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Always-on calibrated soft voting (the default)
    #[must_use]
    pub fn soft_voting() -> Self {
        Self::default()
    }

    /// Primary detector first, secondary only when triggered
    #[must_use]
    pub fn trigger_fallback() -> Self {
        Self {
            strategy: FusionStrategy::TriggerFallback,
            ..Self::default()
        }
    }

    /// Load and validate a YAML configuration file
    pub fn from_yaml(yaml_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = yaml_path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges of every bundle
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (role, params) in [
            ("primary", &self.primary),
            ("secondary", &self.secondary),
            ("ensemble", &self.ensemble),
            ("roi", &self.roi_params),
        ] {
            params
                .validate()
                .map_err(|source| ConfigError::Params { role, source })?;
        }

        for (field, value) in [
            ("primary_score_threshold", self.primary_score_threshold),
            ("secondary_score_threshold", self.secondary_score_threshold),
            ("wbf_iou_threshold", self.wbf_iou_threshold),
            ("cluster_iou_threshold", self.cluster_iou_threshold),
            ("roi.high_confidence", self.roi.high_confidence),
            ("roi.confirm_iou", self.roi.confirm_iou),
            ("roi.uncertain_quantile", self.roi.uncertain_quantile),
            ("roi.score_threshold", self.roi.score_threshold),
            ("gate.fp_ratio_threshold", self.gate.fp_ratio_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfUnitRange { field, value });
            }
        }

        for (field, value) in [
            ("ensemble_threshold", self.ensemble_threshold),
            ("trigger.min_score_variance", self.trigger.min_score_variance),
            ("roi.crop_margin", self.roi.crop_margin),
            ("calibration.ece_primary", self.calibration.ece_primary),
            ("calibration.ece_secondary", self.calibration.ece_secondary),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Negative { field, value });
            }
        }

        for (field, value) in [
            ("trigger.top_k", self.trigger.top_k),
            ("roi.batch_size", self.roi.batch_size),
            ("gate.window", self.gate.window),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        if self.shape.min_aspect.is_nan() || self.shape.min_aspect <= 0.0 {
            return Err(ConfigError::Negative {
                field: "shape.min_aspect",
                value: self.shape.min_aspect,
            });
        }
        if self.shape.min_aspect > self.shape.max_aspect {
            return Err(ConfigError::InvertedRange {
                min_field: "shape.min_aspect",
                min: self.shape.min_aspect,
                max_field: "shape.max_aspect",
                max: self.shape.max_aspect,
            });
        }

        Ok(())
    }
}
