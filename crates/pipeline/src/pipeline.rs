//! Per-image detection pipeline with pipeline-scoped adaptive state

use crate::config::PipelineConfig;
use crate::fusion::{FusionCounters, FusionEngine};
use crate::gate::AdaptiveGate;
use crate::metrics::{count_fp, ImageMetrics};
use crate::roi::{RoiBatchStats, RoiRefinementStage};
use crate::shape::{ReferenceLabelSource, ShapeBounds, ShapeBoundsEstimator};
use crate::PipelineError;
use detect_fusion_common::{BoundingBox, DetectionSet};
use detect_fusion_detectors::{image_source, DetectorSlot, NeuralDetector};
use image::RgbImage;
use serde::Serialize;
use std::borrow::Cow;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::info;

/// Everything known about one processed image
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub detections: DetectionSet,
    /// Fused detections before ROI refinement
    pub pre_refinement: DetectionSet,
    /// Metrics of the pre-refinement set, when ground truth was given
    pub metrics: Option<ImageMetrics>,
    pub triggered: bool,
    pub fallback_used: bool,
    pub refinement_ran: bool,
    pub latency_ms: f64,
}

#[derive(Debug, Default)]
struct LastImage {
    metrics: Option<ImageMetrics>,
    pre_refinement: DetectionSet,
}

/// Two-detector fusion pipeline
///
/// `detect` takes `&self`; adaptive state lives behind one mutex per group,
/// so a pipeline can be shared across threads. The order in which concurrent
/// images update the false-positive window is unspecified.
pub struct DetectionPipeline {
    config: PipelineConfig,
    primary: Arc<dyn NeuralDetector>,
    secondary: DetectorSlot,
    roi_detector: DetectorSlot,
    engine: FusionEngine,
    roi_stage: RoiRefinementStage,
    shape_bounds: ShapeBounds,
    gate: Mutex<AdaptiveGate>,
    roi_stats: Mutex<RoiBatchStats>,
    counters: Mutex<FusionCounters>,
    last: Mutex<LastImage>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DetectionPipeline {
    /// Build a pipeline
    ///
    /// # Arguments
    /// * `config` - Validated here
    /// * `primary` - Transformer detector, always run
    /// * `secondary` - Single-stage detector; unavailable means single-detector mode
    /// * `roi_detector` - Dedicated instance for crop batches; unavailable disables refinement
    /// * `reference` - Labeled data for the shape prior; `None` uses configured bounds
    pub fn new(
        config: PipelineConfig,
        primary: Arc<dyn NeuralDetector>,
        secondary: DetectorSlot,
        roi_detector: DetectorSlot,
        reference: Option<&dyn ReferenceLabelSource>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let estimator = ShapeBoundsEstimator::new(&config.shape);
        let shape_bounds = match reference {
            Some(source) => estimator.from_reference(source),
            None => estimator.configured(),
        };

        info!(
            "Pipeline: {:?} strategy, primary {}, secondary {:?}, ROI {:?}",
            config.strategy,
            primary.name(),
            secondary,
            roi_detector
        );

        Ok(Self {
            engine: FusionEngine::new(config.clone(), shape_bounds),
            roi_stage: RoiRefinementStage::new(config.roi.clone(), config.roi_params.clone()),
            gate: Mutex::new(AdaptiveGate::new(&config.gate)),
            roi_stats: Mutex::new(RoiBatchStats::default()),
            counters: Mutex::new(FusionCounters::default()),
            last: Mutex::new(LastImage::default()),
            config,
            primary,
            secondary,
            roi_detector,
            shape_bounds,
        })
    }

    /// Detect objects in `image`
    ///
    /// Ground truth, when given, feeds the false-positive window and the
    /// last-image metrics.
    pub fn detect(
        &self,
        image: &RgbImage,
        ground_truth: Option<&[BoundingBox]>,
    ) -> Result<DetectionSet, PipelineError> {
        Ok(self.detect_with_report(image, ground_truth)?.detections)
    }

    /// Decode and process an image file
    pub fn detect_path(
        &self,
        path: &Path,
        ground_truth: Option<&[BoundingBox]>,
    ) -> Result<DetectionReport, PipelineError> {
        let image = image_source::decode(path)?;
        self.detect_with_report(&image, ground_truth)
    }

    pub fn detect_with_report(
        &self,
        image: &RgbImage,
        ground_truth: Option<&[BoundingBox]>,
    ) -> Result<DetectionReport, PipelineError> {
        let start = Instant::now();

        let prepared: Cow<'_, RgbImage> = if self.config.preprocess {
            Cow::Owned(image_source::enhance_or_copy(image))
        } else {
            Cow::Borrowed(image)
        };

        let secondary = self.secondary.detector().map(|d| d.as_ref());
        let outcome = self.engine.fuse(&prepared, self.primary.as_ref(), secondary)?;
        lock(&self.counters).record(&outcome);

        let pre_refinement = outcome.detections;
        let metrics = ground_truth.map(|gt| ImageMetrics::compute(&pre_refinement, gt));

        let roi_detector = self
            .roi_detector
            .detector()
            .filter(|_| self.config.roi.enabled);
        let refine = roi_detector.is_some() && lock(&self.gate).should_refine();

        let (detections, refinement_ran) = match roi_detector {
            Some(detector) if refine => {
                let refinement =
                    self.roi_stage
                        .refine(&pre_refinement, &prepared, detector.as_ref());
                lock(&self.roi_stats).merge(&refinement.stats);
                (refinement.detections, true)
            }
            _ => (pre_refinement.clone(), false),
        };

        if let Some(gt) = ground_truth {
            lock(&self.gate).record(count_fp(&pre_refinement, gt));
        }

        {
            let mut last = lock(&self.last);
            last.pre_refinement = pre_refinement.clone();
            if metrics.is_some() {
                last.metrics = metrics;
            }
        }

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            "Detected {} objects ({} before refinement) in {:.1}ms",
            detections.len(),
            pre_refinement.len(),
            latency_ms
        );

        Ok(DetectionReport {
            detections,
            pre_refinement,
            metrics,
            triggered: outcome.triggered,
            fallback_used: outcome.fallback_used,
            refinement_ran,
            latency_ms,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn shape_bounds(&self) -> ShapeBounds {
        self.shape_bounds
    }

    #[must_use]
    pub fn fusion_counters(&self) -> FusionCounters {
        *lock(&self.counters)
    }

    /// Fraction of images that invoked the secondary detector by trigger
    #[must_use]
    pub fn trigger_rate(&self) -> f32 {
        lock(&self.counters).trigger_rate()
    }

    #[must_use]
    pub fn roi_stats(&self) -> RoiBatchStats {
        *lock(&self.roi_stats)
    }

    /// Current fraction of windowed images with a false positive
    #[must_use]
    pub fn false_positive_ratio(&self) -> f32 {
        lock(&self.gate).ratio()
    }

    /// Mean false positives per windowed image
    #[must_use]
    pub fn mean_false_positives(&self) -> f32 {
        lock(&self.gate).window().mean_false_positives()
    }

    #[must_use]
    pub fn refinement_enabled(&self) -> bool {
        lock(&self.gate).should_refine()
    }

    /// Metrics of the most recent image that had ground truth
    #[must_use]
    pub fn last_metrics(&self) -> Option<ImageMetrics> {
        lock(&self.last).metrics
    }

    /// Fused detections of the most recent image, before refinement
    #[must_use]
    pub fn last_pre_refinement(&self) -> DetectionSet {
        lock(&self.last).pre_refinement.clone()
    }
}
