//! Scored axis-aligned boxes in image pixel coordinates

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered detections for one image, produced by one detector or one stage
pub type DetectionSet = Vec<BoundingBox>;

/// Bounding box in corner format with a confidence score
///
/// Coordinates are pixels of the image the box was predicted on. Boxes are
/// plain values: every transformation returns a new box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge
    pub x1: f32,
    /// Top edge
    pub y1: f32,
    /// Right edge
    pub x2: f32,
    /// Bottom edge
    pub y2: f32,
    /// Confidence score
    pub score: f32,
}

impl BoundingBox {
    /// Create a new bounding box from corners
    #[must_use]
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            score,
        }
    }

    /// Create a box from normalized center format, scaled to `width`x`height` pixels
    #[must_use]
    pub fn from_normalized_cxcywh(
        cx: f32,
        cy: f32,
        w: f32,
        h: f32,
        width: f32,
        height: f32,
        score: f32,
    ) -> Self {
        Self::new(
            (cx - w / 2.0) * width,
            (cy - h / 2.0) * height,
            (cx + w / 2.0) * width,
            (cy + h / 2.0) * height,
            score,
        )
    }

    #[must_use]
    #[inline]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    #[must_use]
    #[inline]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Area of the box, clamped at zero for inverted boxes
    #[must_use]
    #[inline]
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Width over height, `None` when the height is not positive
    #[must_use]
    pub fn aspect_ratio(&self) -> Option<f32> {
        let h = self.height();
        if h > 0.0 {
            Some(self.width() / h)
        } else {
            None
        }
    }

    /// Get center coordinates
    #[must_use]
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// True for boxes that must never enter geometric computation:
    /// non-finite values, inverted corners, or zero area.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        let finite = self.x1.is_finite()
            && self.y1.is_finite()
            && self.x2.is_finite()
            && self.y2.is_finite()
            && self.score.is_finite();
        !finite || self.x2 <= self.x1 || self.y2 <= self.y1
    }

    /// Same geometry with a different score
    #[must_use]
    pub fn with_score(&self, score: f32) -> Self {
        Self { score, ..*self }
    }

    /// Shift the box by `(dx, dy)`
    #[must_use]
    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self::new(
            self.x1 + dx,
            self.y1 + dy,
            self.x2 + dx,
            self.y2 + dy,
            self.score,
        )
    }

    /// Calculate Intersection over Union (`IoU`) with another box
    #[must_use]
    #[inline]
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        crate::geometry::iou(self, other)
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.1},{:.1},{:.1},{:.1}] score={:.2}",
            self.x1, self.y1, self.x2, self.y2, self.score
        )
    }
}
