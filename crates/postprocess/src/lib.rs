//! Robust per-detector post-processing
//!
//! Turns a raw detector output into a cleaned detection set:
//!
//! 1. **Score filter**: drop boxes below the detector's confidence threshold
//! 2. **Geometry filter**: drop degenerate boxes and boxes whose area or
//!    aspect ratio is implausible
//! 3. **Distance-aware soft suppression**: decay overlapping boxes instead of
//!    removing them, with an extra centroid-distance term
//! 4. **Adaptive threshold**: keep boxes scoring at least
//!    `alpha * percentile(scores)`
//! 5. **Fallback**: when too few boxes survive, use plain hard NMS of the
//!    geometry-filtered set instead
//!
//! Steps 3-5 live in [`adaptive_threshold_with_fallback`] so per-detector and
//! ensemble post-processing share one implementation.
//!
//! # Example
//! ```
//! use detect_fusion_common::BoundingBox;
//! use detect_fusion_postprocess::{robust_postprocess, RobustParams};
//!
//! let raw = vec![
//!     BoundingBox::new(10.0, 10.0, 110.0, 60.0, 0.92),
//!     BoundingBox::new(12.0, 11.0, 112.0, 61.0, 0.85),
//!     BoundingBox::new(0.0, 0.0, 2.0, 2.0, 0.99), // too small
//! ];
//! let cleaned = robust_postprocess(&raw, 0.3, &RobustParams::default());
//! assert!(!cleaned.is_empty());
//! assert!(cleaned.iter().all(|b| b.area() >= 800.0));
//! ```

pub mod filter;
pub mod nms;
pub mod wbf;

use detect_fusion_common::{percentile, BoundingBox, DetectionSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use filter::{filter_by_geometry, filter_by_score};
pub use nms::{nms, soft_nms_distance};
pub use wbf::{weighted_box_fusion, weighted_centroid};

/// `IoU` above which hard NMS suppresses a lower-scoring box in the fallback path
pub const HARD_NMS_IOU: f32 = 0.5;

/// Parameter validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ParamsError {
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f32 },

    #[error("{field} must lie in [0, 1], got {value}")]
    OutOfUnitRange { field: &'static str, value: f32 },

    #[error("{min_field} ({min}) exceeds {max_field} ({max})")]
    InvertedRange {
        min_field: &'static str,
        min: f32,
        max_field: &'static str,
        max: f32,
    },
}

/// Parameters for robust post-processing of one detector role
///
/// One instance exists per role (primary, secondary, ensemble, ROI). Bundles
/// are built at pipeline construction and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobustParams {
    /// Minimum box area in square pixels
    pub area_min: f32,
    /// Maximum box area in square pixels
    pub area_max: f32,
    /// Minimum width/height ratio
    pub ar_min: f32,
    /// Maximum width/height ratio
    pub ar_max: f32,
    /// `IoU` decay scale of the soft suppression
    pub sigma: f32,
    /// Centroid-distance scale of the soft suppression (pixels)
    pub dist_scale: f32,
    /// Multiplier applied to the percentile score to get the dynamic threshold
    pub alpha: f32,
    /// Minimum survivors before falling back to hard NMS
    pub n_min: usize,
    /// Percentile (fraction in [0, 1]) of surviving scores used as the base threshold
    pub score_percentile: f32,
}

impl Default for RobustParams {
    fn default() -> Self {
        Self {
            area_min: 800.0,
            area_max: 400_000.0,
            ar_min: 0.5,
            ar_max: 6.0,
            sigma: 0.5,
            dist_scale: 150.0,
            alpha: 0.5,
            n_min: 1,
            score_percentile: 0.5,
        }
    }
}

impl RobustParams {
    /// Permissive bundle for ROI crops, where boxes are small relative to the crop
    #[must_use]
    pub fn roi() -> Self {
        Self {
            area_min: 16.0,
            area_max: f32::MAX,
            ar_min: 0.1,
            ar_max: 20.0,
            ..Self::default()
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ParamsError> {
        for (field, value) in [("sigma", self.sigma), ("dist_scale", self.dist_scale)] {
            if value.is_nan() || value <= 0.0 {
                return Err(ParamsError::NotPositive { field, value });
            }
        }
        if !(0.0..=1.0).contains(&self.score_percentile) {
            return Err(ParamsError::OutOfUnitRange {
                field: "score_percentile",
                value: self.score_percentile,
            });
        }
        if self.area_min > self.area_max {
            return Err(ParamsError::InvertedRange {
                min_field: "area_min",
                min: self.area_min,
                max_field: "area_max",
                max: self.area_max,
            });
        }
        if self.ar_min > self.ar_max {
            return Err(ParamsError::InvertedRange {
                min_field: "ar_min",
                min: self.ar_min,
                max_field: "ar_max",
                max: self.ar_max,
            });
        }
        Ok(())
    }
}

/// Full robust pipeline for one detector's raw output
///
/// # Arguments
/// * `raw` - Detections as produced by the detector
/// * `score_threshold` - Minimum confidence to enter the pipeline
/// * `params` - Geometry and suppression parameters for this detector role
#[must_use]
pub fn robust_postprocess(
    raw: &[BoundingBox],
    score_threshold: f32,
    params: &RobustParams,
) -> DetectionSet {
    let scored = filter_by_score(raw, score_threshold);
    let geometric = filter_by_geometry(&scored, params);
    debug!(
        "Robust post-processing: {} raw -> {} scored -> {} geometric",
        raw.len(),
        scored.len(),
        geometric.len()
    );
    adaptive_threshold_with_fallback(&geometric, params)
}

/// Soft suppression, dynamic percentile threshold, and hard-NMS fallback
///
/// `geometric` must already be geometry-filtered. When fewer than
/// `params.n_min` boxes pass the dynamic threshold the result is
/// `nms(geometric, HARD_NMS_IOU)` instead.
#[must_use]
pub fn adaptive_threshold_with_fallback(
    geometric: &[BoundingBox],
    params: &RobustParams,
) -> DetectionSet {
    let suppressed = soft_nms_distance(geometric, params.sigma, params.dist_scale);

    let scores: Vec<f32> = suppressed.iter().map(|b| b.score).collect();
    let dynamic_threshold = params.alpha * percentile(&scores, params.score_percentile);

    let kept: DetectionSet = suppressed
        .into_iter()
        .filter(|b| b.score >= dynamic_threshold)
        .collect();

    if kept.len() < params.n_min {
        debug!(
            "Dynamic threshold {:.3} kept {} < n_min {}, falling back to hard NMS",
            dynamic_threshold,
            kept.len(),
            params.n_min
        );
        return nms(geometric, HARD_NMS_IOU);
    }

    debug!(
        "Dynamic threshold {:.3} kept {} boxes",
        dynamic_threshold,
        kept.len()
    );
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2, score)
    }

    #[test]
    fn test_default_params_valid() {
        assert!(RobustParams::default().validate().is_ok());
        assert!(RobustParams::roi().validate().is_ok());
    }

    #[test]
    fn test_params_validation() {
        let params = RobustParams {
            sigma: 0.0,
            ..Default::default()
        };
        assert_eq!(
            params.validate(),
            Err(ParamsError::NotPositive {
                field: "sigma",
                value: 0.0
            })
        );

        let params = RobustParams {
            ar_min: 7.0,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ParamsError::InvertedRange { .. })
        ));

        let params = RobustParams {
            score_percentile: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ParamsError::OutOfUnitRange { .. })
        ));
    }

    #[test]
    fn test_fallback_to_hard_nms_when_too_few_survive() {
        // Two disjoint boxes; with alpha 1 and the max percentile only the top
        // score passes the dynamic threshold, which is below n_min = 2.
        let params = RobustParams {
            area_min: 1.0,
            alpha: 1.0,
            score_percentile: 1.0,
            n_min: 2,
            ..Default::default()
        };
        let geometric = vec![b(0.0, 0.0, 50.0, 50.0, 0.9), b(400.0, 400.0, 450.0, 450.0, 0.4)];

        let result = adaptive_threshold_with_fallback(&geometric, &params);
        assert_eq!(result, nms(&geometric, HARD_NMS_IOU));
        assert_eq!(result.len(), 2);
        // hard NMS keeps the original scores, not the decayed ones
        assert_eq!(result[1].score, 0.4);
    }

    #[test]
    fn test_dynamic_threshold_path() {
        let params = RobustParams {
            area_min: 1.0,
            alpha: 1.0,
            score_percentile: 1.0,
            n_min: 1,
            ..Default::default()
        };
        let geometric = vec![b(0.0, 0.0, 50.0, 50.0, 0.9), b(400.0, 400.0, 450.0, 450.0, 0.4)];

        let result = adaptive_threshold_with_fallback(&geometric, &params);
        assert_eq!(result, vec![geometric[0]]);
    }

    #[test]
    fn test_robust_postprocess_filters_before_suppression() {
        let params = RobustParams {
            area_min: 100.0,
            area_max: 10_000.0,
            n_min: 1,
            ..Default::default()
        };
        let raw = vec![
            b(0.0, 0.0, 40.0, 20.0, 0.9),
            b(0.0, 0.0, 5.0, 5.0, 0.95),     // area too small
            b(0.0, 0.0, 40.0, 20.0, 0.1),    // below score threshold
            b(10.0, 10.0, 10.0, 30.0, 0.99), // degenerate
            b(0.0, 0.0, 400.0, 10.0, 0.8),   // too wide
        ];

        let result = robust_postprocess(&raw, 0.3, &params);
        assert_eq!(result, vec![raw[0]]);
    }

    #[test]
    fn test_robust_postprocess_empty_input() {
        assert!(robust_postprocess(&[], 0.3, &RobustParams::default()).is_empty());
    }
}
