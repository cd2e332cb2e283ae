//! Weighted box fusion across two detectors

use detect_fusion_common::{iou, BoundingBox, DetectionSet};

/// Score-weighted centroid of a cluster's corners
///
/// Corners are averaged as offsets from the first member, so a single-member
/// cluster (or a cluster of identical boxes) reproduces its box exactly.
/// Clusters whose total weight is not positive fall back to uniform weights.
/// Returns `None` for an empty cluster.
#[must_use]
pub fn weighted_centroid(members: &[BoundingBox], score: f32) -> Option<BoundingBox> {
    let anchor = members.first()?;

    let total: f32 = members.iter().map(|m| m.score).sum();
    let uniform = total.is_nan() || total <= 0.0;
    let weight = |m: &BoundingBox| if uniform { 1.0 } else { m.score };
    let norm = if uniform { members.len() as f32 } else { total };

    let mut offsets = [0.0f32; 4];
    for m in members {
        let w = weight(m);
        offsets[0] += w * (m.x1 - anchor.x1);
        offsets[1] += w * (m.y1 - anchor.y1);
        offsets[2] += w * (m.x2 - anchor.x2);
        offsets[3] += w * (m.y2 - anchor.y2);
    }

    Some(BoundingBox::new(
        anchor.x1 + offsets[0] / norm,
        anchor.y1 + offsets[1] / norm,
        anchor.x2 + offsets[2] / norm,
        anchor.y2 + offsets[3] / norm,
        score,
    ))
}

/// Fuse two detection sets by clustering overlapping boxes
///
/// All boxes from both inputs are visited in descending score order. Each
/// unclaimed box seeds a cluster that absorbs every remaining box whose `IoU`
/// with the seed exceeds `iou_threshold`. The fused box is the score-weighted
/// average of the members and carries the maximum member score.
#[must_use]
pub fn weighted_box_fusion(
    a: &[BoundingBox],
    b: &[BoundingBox],
    iou_threshold: f32,
) -> DetectionSet {
    let mut all: DetectionSet = a.iter().chain(b.iter()).copied().collect();
    all.sort_by(|x, y| y.score.total_cmp(&x.score));

    let mut claimed = vec![false; all.len()];
    let mut fused = Vec::new();

    for seed_idx in 0..all.len() {
        if claimed[seed_idx] {
            continue;
        }
        claimed[seed_idx] = true;
        let seed = all[seed_idx];

        let mut cluster = vec![seed];
        for idx in seed_idx + 1..all.len() {
            if !claimed[idx] && iou(&seed, &all[idx]) > iou_threshold {
                claimed[idx] = true;
                cluster.push(all[idx]);
            }
        }

        let max_score = cluster
            .iter()
            .map(|m| m.score)
            .fold(f32::NEG_INFINITY, f32::max);
        if let Some(merged) = weighted_centroid(&cluster, max_score) {
            fused.push(merged);
        }
    }

    fused
}
