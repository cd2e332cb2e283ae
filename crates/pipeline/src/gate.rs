//! Rolling false-positive gate for ROI refinement

use crate::config::GateConfig;
use std::collections::VecDeque;
use tracing::debug;

/// Bounded FIFO of per-image false-positive counts
#[derive(Debug, Clone)]
pub struct FalsePositiveWindow {
    counts: VecDeque<usize>,
    capacity: usize,
}

impl FalsePositiveWindow {
    /// A zero capacity is raised to one
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            counts: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append one image's count, evicting the oldest at capacity
    pub fn push(&mut self, false_positives: usize) {
        if self.counts.len() == self.capacity {
            self.counts.pop_front();
        }
        self.counts.push_back(false_positives);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of windowed images with at least one false positive
    #[must_use]
    pub fn images_with_false_positives(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }

    /// Fraction of windowed images with at least one false positive, 0 when empty
    #[must_use]
    pub fn ratio(&self) -> f32 {
        if self.counts.is_empty() {
            return 0.0;
        }
        self.images_with_false_positives() as f32 / self.counts.len() as f32
    }

    /// Mean false positives per windowed image
    #[must_use]
    pub fn mean_false_positives(&self) -> f32 {
        if self.counts.is_empty() {
            return 0.0;
        }
        self.counts.iter().sum::<usize>() as f32 / self.counts.len() as f32
    }
}

/// Decides whether ROI refinement runs
///
/// The decision only changes when an image with ground truth is recorded;
/// before the first one the configured default holds.
#[derive(Debug, Clone)]
pub struct AdaptiveGate {
    window: FalsePositiveWindow,
    threshold: f32,
    refine: bool,
}

impl AdaptiveGate {
    #[must_use]
    pub fn new(config: &GateConfig) -> Self {
        Self {
            window: FalsePositiveWindow::new(config.window),
            threshold: config.fp_ratio_threshold,
            refine: config.enabled_by_default,
        }
    }

    /// Record one image's false-positive count and return the new decision
    pub fn record(&mut self, false_positives: usize) -> bool {
        self.window.push(false_positives);
        let ratio = self.window.ratio();
        self.refine = ratio > self.threshold;
        debug!(
            "FP window {}/{} images, ratio {:.3} -> refinement {}",
            self.window.len(),
            self.window.capacity(),
            ratio,
            if self.refine { "on" } else { "off" }
        );
        self.refine
    }

    #[must_use]
    pub fn should_refine(&self) -> bool {
        self.refine
    }

    #[must_use]
    pub fn ratio(&self) -> f32 {
        self.window.ratio()
    }

    #[must_use]
    pub fn window(&self) -> &FalsePositiveWindow {
        &self.window
    }
}
