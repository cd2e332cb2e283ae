//! Second-pass ROI refinement of uncertain detections

use crate::config::RoiConfig;
use detect_fusion_common::{percentile, BoundingBox, DetectionSet};
use detect_fusion_detectors::image_source::{crop, CropRect};
use detect_fusion_detectors::NeuralDetector;
use detect_fusion_postprocess::{robust_postprocess, RobustParams};
use image::RgbImage;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, warn};

/// Cumulative ROI batch statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RoiBatchStats {
    pub batch_count: u64,
    pub crop_count: u64,
    pub total_latency_ms: f64,
}

impl RoiBatchStats {
    pub fn record_batch(&mut self, crops: usize, latency_ms: f64) {
        self.batch_count += 1;
        self.crop_count += crops as u64;
        self.total_latency_ms += latency_ms;
    }

    pub fn merge(&mut self, other: &RoiBatchStats) {
        self.batch_count += other.batch_count;
        self.crop_count += other.crop_count;
        self.total_latency_ms += other.total_latency_ms;
    }

    #[must_use]
    pub fn avg_crops_per_batch(&self) -> f64 {
        if self.batch_count == 0 {
            0.0
        } else {
            self.crop_count as f64 / self.batch_count as f64
        }
    }

    #[must_use]
    pub fn avg_latency_ms(&self) -> f64 {
        if self.batch_count == 0 {
            0.0
        } else {
            self.total_latency_ms / self.batch_count as f64
        }
    }
}

/// Result of refining one image
#[derive(Debug, Clone, Default)]
pub struct RoiRefinement {
    pub detections: DetectionSet,
    /// Candidates sent to the ROI detector
    pub selected: usize,
    pub confirmed: usize,
    /// Batches run for this image only
    pub stats: RoiBatchStats,
}

/// Re-inspects the least confident detections on enlarged crops
#[derive(Debug, Clone)]
pub struct RoiRefinementStage {
    config: RoiConfig,
    params: RobustParams,
}

impl RoiRefinementStage {
    #[must_use]
    pub fn new(config: RoiConfig, params: RobustParams) -> Self {
        Self { config, params }
    }

    /// Split detections into those kept as-is and those to re-inspect
    ///
    /// Boxes scoring at least `high_confidence` are accepted. Of the rest,
    /// those whose uncertainty `1 - score` reaches the
    /// `(1 - uncertain_quantile)` percentile are selected; the others are
    /// accepted too.
    #[must_use]
    pub fn select_uncertain(&self, detections: &[BoundingBox]) -> (DetectionSet, DetectionSet) {
        let (mut accepted, candidates): (DetectionSet, DetectionSet) = detections
            .iter()
            .partition(|b| b.score >= self.config.high_confidence);
        if candidates.is_empty() {
            return (accepted, candidates);
        }

        let uncertainties: Vec<f32> = candidates.iter().map(|b| 1.0 - b.score).collect();
        let threshold = percentile(&uncertainties, 1.0 - self.config.uncertain_quantile);

        let mut selected = Vec::new();
        for bbox in candidates {
            if 1.0 - bbox.score >= threshold {
                selected.push(bbox);
            } else {
                accepted.push(bbox);
            }
        }
        (accepted, selected)
    }

    /// Confirm or reject uncertain detections with `detector`
    ///
    /// A selected candidate survives when any re-detection in its crop,
    /// translated back to image coordinates, overlaps it with
    /// `IoU >= confirm_iou`. A failing or short batch keeps its candidates. If
    /// refinement would empty a non-empty input the input is returned.
    pub fn refine(
        &self,
        detections: &[BoundingBox],
        image: &RgbImage,
        detector: &dyn NeuralDetector,
    ) -> RoiRefinement {
        let (mut accepted, selected) = self.select_uncertain(detections);
        let mut refinement = RoiRefinement {
            selected: selected.len(),
            ..RoiRefinement::default()
        };
        if selected.is_empty() {
            refinement.detections = accepted;
            return refinement;
        }

        let (width, height) = image.dimensions();
        let regions: Vec<(BoundingBox, CropRect)> = selected
            .iter()
            .filter_map(|bbox| {
                let rect = CropRect::around(bbox, self.config.crop_margin, width, height);
                if rect.is_none() {
                    debug!("Candidate {} lies outside the image, rejected", bbox);
                }
                rect.map(|r| (*bbox, r))
            })
            .collect();

        for batch in regions.chunks(self.config.batch_size.max(1)) {
            let crops: Vec<RgbImage> = batch.iter().map(|(_, rect)| crop(image, *rect)).collect();

            let start = Instant::now();
            let result = detector.predict_batch(&crops, self.config.score_threshold);
            refinement
                .stats
                .record_batch(batch.len(), start.elapsed().as_secs_f64() * 1000.0);

            let per_crop = match result {
                Ok(per_crop) if per_crop.len() == batch.len() => per_crop,
                Ok(per_crop) => {
                    warn!(
                        "ROI batch returned {} results for {} crops, keeping candidates",
                        per_crop.len(),
                        batch.len()
                    );
                    accepted.extend(batch.iter().map(|(bbox, _)| *bbox));
                    continue;
                }
                Err(e) => {
                    warn!(
                        "ROI batch of {} crops failed, keeping candidates: {}",
                        batch.len(),
                        e
                    );
                    accepted.extend(batch.iter().map(|(bbox, _)| *bbox));
                    continue;
                }
            };

            for ((bbox, rect), redetections) in batch.iter().zip(per_crop) {
                let cleaned =
                    robust_postprocess(&redetections, self.config.score_threshold, &self.params);
                let confirmed = cleaned.iter().any(|d| {
                    d.translate(rect.x as f32, rect.y as f32).iou(bbox) >= self.config.confirm_iou
                });
                if confirmed {
                    accepted.push(*bbox);
                    refinement.confirmed += 1;
                }
            }
        }

        debug!(
            "ROI refinement: {} selected, {} confirmed in {} batches",
            refinement.selected, refinement.confirmed, refinement.stats.batch_count
        );

        if accepted.is_empty() && !detections.is_empty() {
            debug!("ROI refinement rejected everything, keeping its input");
            refinement.detections = detections.to_vec();
        } else {
            refinement.detections = accepted;
        }
        refinement
    }
}
