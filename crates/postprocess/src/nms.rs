//! Hard and distance-aware soft non-maximum suppression

use detect_fusion_common::{centroid_distance, iou, BoundingBox, DetectionSet};

/// Sort boxes by score, highest first (stable for equal scores)
fn sorted_by_score(boxes: &[BoundingBox]) -> DetectionSet {
    let mut sorted = boxes.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));
    sorted
}

/// Classic hard non-maximum suppression
///
/// Boxes are visited in descending score order; a box is removed when its
/// `IoU` with an already kept box exceeds `iou_threshold`. The output is sorted
/// by score and running it through `nms` again returns it unchanged.
#[must_use]
pub fn nms(boxes: &[BoundingBox], iou_threshold: f32) -> DetectionSet {
    let sorted = sorted_by_score(boxes);
    let mut keep: DetectionSet = Vec::with_capacity(sorted.len());

    for candidate in sorted {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }

    keep
}

/// Soft suppression with an additional centroid-distance term
///
/// Repeatedly emits the highest-scoring remaining box, then multiplies every
/// other remaining score by
/// `exp(-iou^2 / sigma - distance^2 / dist_scale^2)`.
/// Nothing is removed; emitted boxes carry their decayed scores.
#[must_use]
pub fn soft_nms_distance(boxes: &[BoundingBox], sigma: f32, dist_scale: f32) -> DetectionSet {
    let mut work = sorted_by_score(boxes);
    let mut keep: DetectionSet = Vec::with_capacity(work.len());
    let dist_scale_sq = dist_scale * dist_scale;

    while !work.is_empty() {
        let best_idx = work
            .iter()
            .enumerate()
            .fold(0, |best, (idx, b)| if b.score > work[best].score { idx } else { best });
        let current = work.remove(best_idx);

        for other in &mut work {
            let overlap = iou(&current, other);
            let dist = centroid_distance(&current, other);
            let decay = (-(overlap * overlap) / sigma - (dist * dist) / dist_scale_sq).exp();
            *other = other.with_score(other.score * decay);
        }

        keep.push(current);
    }

    keep
}
