//! Cross-detector fusion strategies
//!
//! - **Trigger fallback**: the primary detector runs alone unless its cleaned
//!   output is sparse or its top scores are nearly uniform; only then is the
//!   secondary detector run and both outputs fused with weighted box fusion.
//! - **Soft voting**: both detectors always run; scores are scaled by each
//!   detector's calibration weight, overlapping detections are grouped
//!   greedily, and each group votes with its mean score.

use crate::config::{CalibrationConfig, FusionStrategy, PipelineConfig};
use crate::shape::ShapeBounds;
use crate::PipelineError;
use detect_fusion_common::{iou, BoundingBox, DetectionSet};
use detect_fusion_detectors::NeuralDetector;
use detect_fusion_postprocess::{
    adaptive_threshold_with_fallback, filter_by_geometry, filter_by_score, nms,
    robust_postprocess, weighted_box_fusion, weighted_centroid, HARD_NMS_IOU,
};
use image::RgbImage;
use serde::Serialize;
use tracing::{debug, warn};

/// Cumulative fusion counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FusionCounters {
    pub images: u64,
    /// Images for which the secondary detector was invoked by the trigger
    pub triggered: u64,
    pub clusters_kept: u64,
    pub clusters_rejected: u64,
    /// Images answered by an empty-result fallback
    pub fallbacks: u64,
}

impl FusionCounters {
    pub fn record(&mut self, outcome: &FusionOutcome) {
        self.images += 1;
        self.triggered += u64::from(outcome.triggered);
        self.clusters_kept += outcome.clusters_kept as u64;
        self.clusters_rejected += outcome.clusters_rejected as u64;
        self.fallbacks += u64::from(outcome.fallback_used);
    }

    /// Fraction of images that triggered the secondary detector
    #[must_use]
    pub fn trigger_rate(&self) -> f32 {
        if self.images == 0 {
            0.0
        } else {
            self.triggered as f32 / self.images as f32
        }
    }
}

/// Result of fusing one image
#[derive(Debug, Clone, Default)]
pub struct FusionOutcome {
    pub detections: DetectionSet,
    pub triggered: bool,
    pub clusters_kept: usize,
    pub clusters_rejected: usize,
    pub fallback_used: bool,
}

impl FusionOutcome {
    fn plain(detections: DetectionSet) -> Self {
        Self {
            detections,
            ..Self::default()
        }
    }
}

/// Score multiplier for a detector with expected calibration error `ece`
#[inline]
#[must_use]
pub fn calibration_weight(ece: f32) -> f32 {
    if ece.is_finite() && ece > 0.0 {
        1.0 / ece
    } else {
        1.0
    }
}

/// Per-detector calibration weights
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationWeights {
    pub primary: f32,
    pub secondary: f32,
}

impl CalibrationWeights {
    #[must_use]
    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self {
            primary: calibration_weight(config.ece_primary),
            secondary: calibration_weight(config.ece_secondary),
        }
    }
}

impl Default for CalibrationWeights {
    fn default() -> Self {
        Self {
            primary: 1.0,
            secondary: 1.0,
        }
    }
}

/// Output of [`soft_voting_combine`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SoftVote {
    pub detections: DetectionSet,
    pub kept: usize,
    pub rejected: usize,
}

/// Scale each detector's scores by its calibration weight, primary first
#[must_use]
pub fn calibrate(
    primary: &[BoundingBox],
    secondary: &[BoundingBox],
    weights: CalibrationWeights,
) -> DetectionSet {
    primary
        .iter()
        .map(|b| b.with_score(b.score * weights.primary))
        .chain(
            secondary
                .iter()
                .map(|b| b.with_score(b.score * weights.secondary)),
        )
        .collect()
}

/// Calibrated soft voting over two cleaned detection sets
///
/// Detections are visited primary first. Each joins the first existing
/// cluster holding any member with `IoU >= cluster_iou`, otherwise it starts
/// a new cluster. A cluster becomes its score-weighted centroid with the mean
/// member score and is kept when that score reaches `threshold` and, if
/// `shape` is given, its aspect ratio lies within the bounds. May return
/// nothing; callers own the empty-result fallback.
#[must_use]
pub fn soft_voting_combine(
    primary: &[BoundingBox],
    secondary: &[BoundingBox],
    weights: CalibrationWeights,
    cluster_iou: f32,
    threshold: f32,
    shape: Option<&ShapeBounds>,
) -> SoftVote {
    let mut clusters: Vec<Vec<BoundingBox>> = Vec::new();
    for det in calibrate(primary, secondary, weights) {
        match clusters
            .iter_mut()
            .find(|members| members.iter().any(|m| iou(m, &det) >= cluster_iou))
        {
            Some(members) => members.push(det),
            None => clusters.push(vec![det]),
        }
    }

    let mut vote = SoftVote::default();
    for members in &clusters {
        let mean = members.iter().map(|m| m.score).sum::<f32>() / members.len() as f32;
        let accepted = weighted_centroid(members, mean).filter(|fused| {
            mean >= threshold && shape.into_iter().all(|bounds| bounds.accepts(fused))
        });
        match accepted {
            Some(fused) => {
                vote.detections.push(fused);
                vote.kept += 1;
            }
            None => vote.rejected += 1,
        }
    }
    vote
}

/// Population variance of the `top_k` highest scores, 0 for no boxes
#[must_use]
pub fn top_k_score_variance(boxes: &[BoundingBox], top_k: usize) -> f32 {
    let mut scores: Vec<f32> = boxes.iter().map(|b| b.score).collect();
    scores.sort_by(|a, b| b.total_cmp(a));
    scores.truncate(top_k);
    if scores.is_empty() {
        return 0.0;
    }
    let n = scores.len() as f32;
    let mean = scores.iter().sum::<f32>() / n;
    scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n
}

/// Runs the configured fusion strategy for one image
#[derive(Debug, Clone)]
pub struct FusionEngine {
    config: PipelineConfig,
    weights: CalibrationWeights,
    shape_bounds: ShapeBounds,
}

impl FusionEngine {
    #[must_use]
    pub fn new(config: PipelineConfig, shape_bounds: ShapeBounds) -> Self {
        let weights = CalibrationWeights::from_config(&config.calibration);
        Self {
            config,
            weights,
            shape_bounds,
        }
    }

    #[must_use]
    pub fn strategy(&self) -> FusionStrategy {
        self.config.strategy
    }

    /// Fuse detector outputs for `image`
    ///
    /// Primary detector failures propagate. A failing secondary detector is
    /// logged and treated as absent.
    pub fn fuse(
        &self,
        image: &RgbImage,
        primary: &dyn NeuralDetector,
        secondary: Option<&dyn NeuralDetector>,
    ) -> Result<FusionOutcome, PipelineError> {
        let threshold = self.config.primary_score_threshold;
        let raw_primary = primary.predict(image, threshold)?;
        let primary_clean = robust_postprocess(&raw_primary, threshold, &self.config.primary);
        debug!(
            "{}: {} raw -> {} cleaned",
            primary.name(),
            raw_primary.len(),
            primary_clean.len()
        );

        let mut outcome = match self.config.strategy {
            FusionStrategy::TriggerFallback => {
                self.trigger_fallback(image, &raw_primary, primary_clean, secondary)
            }
            FusionStrategy::SoftVoting => {
                self.soft_voting(image, &raw_primary, primary_clean, secondary)
            }
        };

        // Only an empty score-filtered primary output may end up empty
        if outcome.detections.is_empty() {
            let primary_scored = filter_by_score(&raw_primary, threshold);
            if !primary_scored.is_empty() {
                outcome.detections = nms(&primary_scored, HARD_NMS_IOU);
                outcome.fallback_used = true;
                debug!(
                    "Cleaning removed every detection, fell back to NMS of {} scored primary boxes",
                    primary_scored.len()
                );
            }
        }
        Ok(outcome)
    }

    /// Whether a cleaned primary output is weak enough to consult the secondary
    #[must_use]
    pub fn should_trigger(&self, primary_clean: &[BoundingBox]) -> bool {
        let trigger = &self.config.trigger;
        primary_clean.len() < trigger.min_primary_count
            || top_k_score_variance(primary_clean, trigger.top_k) < trigger.min_score_variance
    }

    fn run_secondary(&self, image: &RgbImage, secondary: &dyn NeuralDetector) -> Option<DetectionSet> {
        match secondary.predict(image, self.config.secondary_score_threshold) {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!("{} failed, continuing without it: {}", secondary.name(), e);
                None
            }
        }
    }

    fn trigger_fallback(
        &self,
        image: &RgbImage,
        raw_primary: &[BoundingBox],
        primary_clean: DetectionSet,
        secondary: Option<&dyn NeuralDetector>,
    ) -> FusionOutcome {
        let Some(secondary) = secondary else {
            return FusionOutcome::plain(primary_clean);
        };
        if !self.should_trigger(&primary_clean) {
            return FusionOutcome::plain(primary_clean);
        }
        let Some(raw_secondary) = self.run_secondary(image, secondary) else {
            return FusionOutcome::plain(primary_clean);
        };

        let secondary_threshold = self.config.secondary_score_threshold;
        let secondary_clean =
            robust_postprocess(&raw_secondary, secondary_threshold, &self.config.secondary);
        let fused = weighted_box_fusion(
            &primary_clean,
            &secondary_clean,
            self.config.wbf_iou_threshold,
        );
        let geometric = filter_by_geometry(&fused, &self.config.ensemble);
        let result = adaptive_threshold_with_fallback(&geometric, &self.config.ensemble);
        debug!(
            "Triggered fusion: {} primary + {} secondary -> {} fused -> {} kept",
            primary_clean.len(),
            secondary_clean.len(),
            fused.len(),
            result.len()
        );

        if !result.is_empty() {
            return FusionOutcome {
                detections: result,
                triggered: true,
                ..FusionOutcome::default()
            };
        }

        let detections = if !primary_clean.is_empty() {
            primary_clean
        } else {
            let secondary_scored = filter_by_score(&raw_secondary, secondary_threshold);
            if !secondary_scored.is_empty() {
                nms(&secondary_scored, HARD_NMS_IOU)
            } else {
                let primary_scored =
                    filter_by_score(raw_primary, self.config.primary_score_threshold);
                nms(&primary_scored, HARD_NMS_IOU)
            }
        };
        debug!("Fused result empty, fell back to {} boxes", detections.len());
        FusionOutcome {
            fallback_used: !detections.is_empty(),
            detections,
            triggered: true,
            ..FusionOutcome::default()
        }
    }

    fn soft_voting(
        &self,
        image: &RgbImage,
        raw_primary: &[BoundingBox],
        primary_clean: DetectionSet,
        secondary: Option<&dyn NeuralDetector>,
    ) -> FusionOutcome {
        let Some(raw_secondary) = secondary.and_then(|s| self.run_secondary(image, s)) else {
            return FusionOutcome::plain(primary_clean);
        };
        let secondary_clean = robust_postprocess(
            &raw_secondary,
            self.config.secondary_score_threshold,
            &self.config.secondary,
        );

        let shape = self.config.shape.enabled.then_some(&self.shape_bounds);
        let vote = soft_voting_combine(
            &primary_clean,
            &secondary_clean,
            self.weights,
            self.config.cluster_iou_threshold,
            self.config.ensemble_threshold,
            shape,
        );
        debug!(
            "Soft voting: {} primary + {} secondary -> {} kept, {} rejected",
            primary_clean.len(),
            secondary_clean.len(),
            vote.kept,
            vote.rejected
        );

        let mut outcome = FusionOutcome {
            detections: vote.detections,
            clusters_kept: vote.kept,
            clusters_rejected: vote.rejected,
            ..FusionOutcome::default()
        };
        if outcome.detections.is_empty() {
            let mut calibrated = calibrate(&primary_clean, &secondary_clean, self.weights);
            if calibrated.is_empty() {
                // cleaning removed everything; vote over the score-filtered inputs
                calibrated = calibrate(
                    &filter_by_score(raw_primary, self.config.primary_score_threshold),
                    &filter_by_score(&raw_secondary, self.config.secondary_score_threshold),
                    self.weights,
                );
            }
            if !calibrated.is_empty() {
                outcome.detections = nms(&calibrated, HARD_NMS_IOU);
                outcome.fallback_used = true;
                debug!(
                    "No cluster survived, fell back to NMS of {} calibrated boxes",
                    calibrated.len()
                );
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TriggerConfig;
    use detect_fusion_detectors::DetectorError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2, score)
    }

    /// Returns a fixed set and counts calls
    struct Scripted {
        boxes: DetectionSet,
        calls: AtomicUsize,
        fail: bool,
    }

    impl Scripted {
        fn new(boxes: DetectionSet) -> Self {
            Self {
                boxes,
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Vec::new())
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl NeuralDetector for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn predict(
            &self,
            _image: &RgbImage,
            score_threshold: f32,
        ) -> Result<DetectionSet, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DetectorError::Inference("boom".to_string()));
            }
            Ok(filter_by_score(&self.boxes, score_threshold))
        }
    }

    fn image() -> RgbImage {
        RgbImage::new(1000, 1000)
    }

    fn engine(config: PipelineConfig) -> FusionEngine {
        FusionEngine::new(config, ShapeBounds { low: 0.3, high: 6.0 })
    }

    #[test]
    fn test_calibration_weight() {
        assert_eq!(calibration_weight(0.5), 2.0);
        assert_eq!(calibration_weight(0.0), 1.0);
        assert_eq!(calibration_weight(-1.0), 1.0);
        assert_eq!(calibration_weight(f32::NAN), 1.0);
    }

    #[test]
    fn test_soft_vote_mean_score() {
        let vote = soft_voting_combine(
            &[bbox(0.0, 0.0, 10.0, 10.0, 0.9)],
            &[bbox(0.0, 0.0, 10.0, 10.0, 0.3)],
            CalibrationWeights::default(),
            0.5,
            0.5,
            None,
        );
        assert_eq!(vote.kept, 1);
        assert_eq!(vote.rejected, 0);
        let fused = vote.detections[0];
        assert!((fused.score - 0.6).abs() < 1e-6);
        assert_eq!((fused.x1, fused.y1, fused.x2, fused.y2), (0.0, 0.0, 10.0, 10.0));
    }

    #[test]
    fn test_soft_vote_identical_boxes_merge_exactly() {
        let b = bbox(3.3, 7.1, 45.9, 20.2, 0.7);
        let vote = soft_voting_combine(&[b], &[b], CalibrationWeights::default(), 0.5, 0.5, None);
        assert_eq!(vote.detections, vec![b]);
    }

    #[test]
    fn test_soft_vote_rejections() {
        let shape = ShapeBounds { low: 0.5, high: 2.0 };
        let vote = soft_voting_combine(
            &[
                bbox(0.0, 0.0, 10.0, 10.0, 0.9),
                bbox(100.0, 0.0, 200.0, 10.0, 0.9), // too wide
            ],
            &[bbox(300.0, 300.0, 310.0, 310.0, 0.2)], // low score
            CalibrationWeights::default(),
            0.5,
            0.5,
            Some(&shape),
        );
        assert_eq!(vote.kept, 1);
        assert_eq!(vote.rejected, 2);
    }

    #[test]
    fn test_soft_vote_calibration_scales_scores() {
        let weights = CalibrationWeights::from_config(&CalibrationConfig {
            ece_primary: 0.5,
            ece_secondary: 0.0,
        });
        let vote = soft_voting_combine(
            &[bbox(0.0, 0.0, 10.0, 10.0, 0.3)],
            &[],
            weights,
            0.5,
            0.5,
            None,
        );
        assert!((vote.detections[0].score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_soft_vote_joins_first_matching_cluster() {
        // the third box overlaps both clusters and joins the first
        let a = bbox(0.0, 0.0, 10.0, 10.0, 0.8);
        let b = bbox(6.0, 0.0, 16.0, 10.0, 0.8);
        let c = bbox(3.0, 0.0, 13.0, 10.0, 0.8);
        let vote = soft_voting_combine(&[a, b], &[c], CalibrationWeights::default(), 0.5, 0.5, None);
        assert_eq!(vote.kept, 2);
        assert!((vote.detections[0].x1 - 1.5).abs() < 1e-5);
        assert_eq!(vote.detections[1], b);
    }

    #[test]
    fn test_top_k_variance() {
        assert_eq!(top_k_score_variance(&[], 5), 0.0);
        let boxes = vec![
            bbox(0.0, 0.0, 1.0, 1.0, 0.9),
            bbox(0.0, 0.0, 1.0, 1.0, 0.5),
            bbox(0.0, 0.0, 1.0, 1.0, 0.1),
        ];
        // top 2: 0.9, 0.5 -> mean 0.7, variance 0.04
        assert!((top_k_score_variance(&boxes, 2) - 0.04).abs() < 1e-6);
    }

    #[test]
    fn test_untriggered_primary_skips_secondary() {
        let mut config = PipelineConfig::trigger_fallback();
        config.trigger = TriggerConfig {
            min_primary_count: 1,
            top_k: 5,
            min_score_variance: 0.0,
        };
        let primary = Scripted::new(vec![bbox(100.0, 100.0, 200.0, 150.0, 0.9)]);
        let secondary = Scripted::new(vec![bbox(500.0, 500.0, 600.0, 550.0, 0.9)]);

        let outcome = engine(config)
            .fuse(&image(), &primary, Some(&secondary))
            .unwrap();
        assert_eq!(secondary.calls(), 0);
        assert!(!outcome.triggered);
        assert_eq!(outcome.detections, vec![bbox(100.0, 100.0, 200.0, 150.0, 0.9)]);
    }

    #[test]
    fn test_empty_primary_triggers_and_fuses() {
        let primary = Scripted::new(Vec::new());
        let secondary = Scripted::new(vec![bbox(500.0, 500.0, 600.0, 550.0, 0.9)]);

        let outcome = engine(PipelineConfig::trigger_fallback())
            .fuse(&image(), &primary, Some(&secondary))
            .unwrap();
        assert_eq!(secondary.calls(), 1);
        assert!(outcome.triggered);
        assert_eq!(outcome.detections, vec![bbox(500.0, 500.0, 600.0, 550.0, 0.9)]);
    }

    #[test]
    fn test_triggered_fallback_to_secondary_nms() {
        // both outputs fail geometry (too small), so fusion is empty and the
        // secondary's score-filtered output is returned after hard NMS
        let primary = Scripted::new(Vec::new());
        let secondary = Scripted::new(vec![
            bbox(0.0, 0.0, 10.0, 10.0, 0.9),
            bbox(1.0, 0.0, 11.0, 10.0, 0.8),
        ]);
        let outcome = engine(PipelineConfig::trigger_fallback())
            .fuse(&image(), &primary, Some(&secondary))
            .unwrap();
        assert!(outcome.fallback_used);
        assert_eq!(outcome.detections, vec![bbox(0.0, 0.0, 10.0, 10.0, 0.9)]);
    }

    #[test]
    fn test_failing_secondary_degrades() {
        let primary = Scripted::new(vec![bbox(100.0, 100.0, 200.0, 150.0, 0.9)]);
        let secondary = Scripted::failing();
        for config in [PipelineConfig::trigger_fallback(), PipelineConfig::soft_voting()] {
            let outcome = engine(config)
                .fuse(&image(), &primary, Some(&secondary))
                .unwrap();
            assert_eq!(outcome.detections.len(), 1);
        }
    }

    #[test]
    fn test_failing_primary_is_an_error() {
        let primary = Scripted::failing();
        let result = engine(PipelineConfig::default()).fuse(&image(), &primary, None);
        assert!(matches!(result, Err(PipelineError::Detector(_))));
    }

    #[test]
    fn test_soft_voting_empty_result_fallback() {
        // a lone 0.35-scored box votes below the 0.4 threshold
        let primary = Scripted::new(vec![bbox(100.0, 100.0, 200.0, 150.0, 0.35)]);
        let secondary = Scripted::new(Vec::new());
        let outcome = engine(PipelineConfig::soft_voting())
            .fuse(&image(), &primary, Some(&secondary))
            .unwrap();
        assert_eq!(outcome.clusters_rejected, 1);
        assert!(outcome.fallback_used);
        assert_eq!(outcome.detections.len(), 1);
    }

    /// Passes the score threshold but is below the default `area_min`
    fn tiny() -> BoundingBox {
        bbox(100.0, 100.0, 120.0, 120.0, 0.9)
    }

    #[test]
    fn test_soft_voting_keeps_filtered_primary_with_empty_secondary() {
        let primary = Scripted::new(vec![tiny()]);
        let secondary = Scripted::new(Vec::new());
        let outcome = engine(PipelineConfig::soft_voting())
            .fuse(&image(), &primary, Some(&secondary))
            .unwrap();
        assert!(outcome.fallback_used);
        assert_eq!(outcome.detections, vec![tiny()]);
    }

    #[test]
    fn test_soft_voting_keeps_filtered_primary_without_secondary() {
        let primary = Scripted::new(vec![tiny()]);
        let outcome = engine(PipelineConfig::soft_voting())
            .fuse(&image(), &primary, None)
            .unwrap();
        assert!(outcome.fallback_used);
        assert_eq!(outcome.detections, vec![tiny()]);
    }

    #[test]
    fn test_trigger_keeps_filtered_primary_without_secondary() {
        let primary = Scripted::new(vec![tiny(), bbox(102.0, 100.0, 122.0, 120.0, 0.8)]);
        let outcome = engine(PipelineConfig::trigger_fallback())
            .fuse(&image(), &primary, None)
            .unwrap();
        assert!(outcome.fallback_used);
        assert!(!outcome.triggered);
        // hard NMS of the score-filtered output
        assert_eq!(outcome.detections, vec![tiny()]);
    }

    #[test]
    fn test_empty_inputs_stay_empty() {
        let primary = Scripted::new(vec![bbox(100.0, 100.0, 300.0, 200.0, 0.1)]);
        let secondary = Scripted::new(Vec::new());
        for config in [PipelineConfig::trigger_fallback(), PipelineConfig::soft_voting()] {
            let outcome = engine(config)
                .fuse(&image(), &primary, Some(&secondary))
                .unwrap();
            assert!(outcome.detections.is_empty());
            assert!(!outcome.fallback_used);
        }
    }

    #[test]
    fn test_counters() {
        let mut counters = FusionCounters::default();
        counters.record(&FusionOutcome {
            triggered: true,
            clusters_kept: 2,
            ..FusionOutcome::default()
        });
        counters.record(&FusionOutcome::default());
        assert_eq!(counters.images, 2);
        assert_eq!(counters.clusters_kept, 2);
        assert_eq!(counters.trigger_rate(), 0.5);
    }
}
