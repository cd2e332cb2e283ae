//! Score and geometry filters

use crate::RobustParams;
use detect_fusion_common::{BoundingBox, DetectionSet};

/// Keep boxes whose score is at least `threshold`, preserving order
#[must_use]
pub fn filter_by_score(boxes: &[BoundingBox], threshold: f32) -> DetectionSet {
    boxes
        .iter()
        .filter(|b| b.score >= threshold)
        .copied()
        .collect()
}

/// Drop degenerate boxes and boxes outside the area / aspect-ratio bounds
///
/// Degenerate boxes (inverted, zero area, non-finite) are dropped here,
/// the earliest geometric stage, and never reach suppression or fusion.
#[must_use]
pub fn filter_by_geometry(boxes: &[BoundingBox], params: &RobustParams) -> DetectionSet {
    boxes
        .iter()
        .filter(|b| {
            if b.is_degenerate() {
                return false;
            }
            let area = b.area();
            if area < params.area_min || area > params.area_max {
                return false;
            }
            match b.aspect_ratio() {
                Some(ar) => ar >= params.ar_min && ar <= params.ar_max,
                None => false,
            }
        })
        .copied()
        .collect()
}
