//! Overlap, distance and order statistics over boxes and scores

use crate::BoundingBox;

/// Intersection over Union of two boxes
///
/// Returns 0.0 when the boxes do not intersect or the union has no area.
#[must_use]
#[inline]
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let xx1 = a.x1.max(b.x1);
    let yy1 = a.y1.max(b.y1);
    let xx2 = a.x2.min(b.x2);
    let yy2 = a.y2.min(b.y2);

    let intersection = (xx2 - xx1).max(0.0) * (yy2 - yy1).max(0.0);
    if intersection <= 0.0 {
        return 0.0;
    }

    let union = a.area() + b.area() - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Euclidean distance between box centers
#[must_use]
#[inline]
pub fn centroid_distance(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    let dx = ax - bx;
    let dy = ay - by;
    (dx * dx + dy * dy).sqrt()
}

/// Percentile with linear interpolation between order statistics
///
/// `p` is a fraction in `[0, 1]` (values outside are clamped). The rank is
/// `(n - 1) * p`; non-integer ranks interpolate between the neighbouring
/// sorted values. Empty input yields 0.0.
#[must_use]
pub fn percentile(data: &[f32], p: f32) -> f32 {
    if data.is_empty() {
        return 0.0;
    }

    let mut ordered = data.to_vec();
    ordered.sort_by(f32::total_cmp);

    let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
    let rank = (ordered.len() - 1) as f32 * p;
    let lower = rank.floor() as usize;
    let upper = (rank.ceil() as usize).min(ordered.len() - 1);

    if lower == upper {
        return ordered[lower];
    }
    ordered[lower] + (rank - lower as f32) * (ordered[upper] - ordered[lower])
}
