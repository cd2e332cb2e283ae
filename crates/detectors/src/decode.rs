//! Decoding of raw detector outputs into pixel-space boxes
//!
//! These functions work on flat tensor data plus its shape so they can be
//! exercised without a model.

use crate::DetectorError;
use detect_fusion_common::{BoundingBox, DetectionSet};

#[inline]
#[must_use]
pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Best class probability of one query
///
/// Single-logit queries use a sigmoid. Multi-class queries use a softmax over
/// every class except the trailing "no object" class.
fn query_score(logits: &[f32]) -> f32 {
    match logits {
        [] => 0.0,
        [single] => sigmoid(*single),
        [classes @ .., _no_object] => {
            let max_logit = classes.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = classes.iter().map(|l| (l - max_logit).exp()).collect();
            let sum: f32 = exps.iter().sum();
            if sum > 0.0 {
                exps.iter().copied().fold(0.0, f32::max) / sum
            } else {
                0.0
            }
        }
    }
}

/// Decode one batch item of a DETR-style output
///
/// # Arguments
/// * `logits`, `logits_shape` - `(B, Q)` or `(B, Q, C)` class logits
/// * `boxes`, `boxes_shape` - `(B, Q, 4)` normalized `[cx, cy, w, h]`
/// * `batch_index` - Which batch item to decode
/// * `image_size` - `(width, height)` of the image the boxes refer to
/// * `score_threshold` - Minimum score to keep
pub fn decode_detr(
    logits: &[f32],
    logits_shape: &[usize],
    boxes: &[f32],
    boxes_shape: &[usize],
    batch_index: usize,
    image_size: (u32, u32),
    score_threshold: f32,
) -> Result<DetectionSet, DetectorError> {
    let (batch, queries, classes) = match logits_shape {
        [b, q] => (*b, *q, 1),
        [b, q, c] => (*b, *q, *c),
        other => {
            return Err(DetectorError::OutputLayout(format!(
                "expected 2D or 3D logits, got {other:?}"
            )))
        }
    };
    if boxes_shape != [batch, queries, 4].as_slice() {
        return Err(DetectorError::OutputLayout(format!(
            "boxes shape {boxes_shape:?} does not match logits ({batch}, {queries}, 4)"
        )));
    }
    if batch_index >= batch {
        return Err(DetectorError::OutputLayout(format!(
            "batch index {batch_index} out of range for batch of {batch}"
        )));
    }
    if logits.len() != batch * queries * classes || boxes.len() != batch * queries * 4 {
        return Err(DetectorError::OutputLayout(
            "tensor data length does not match its shape".to_string(),
        ));
    }

    let (width, height) = (image_size.0 as f32, image_size.1 as f32);
    let mut detections = Vec::new();

    for q in 0..queries {
        let logit_offset = (batch_index * queries + q) * classes;
        let score = query_score(&logits[logit_offset..logit_offset + classes]);
        if score < score_threshold {
            continue;
        }

        let box_offset = (batch_index * queries + q) * 4;
        let [cx, cy, w, h] = [
            boxes[box_offset],
            boxes[box_offset + 1],
            boxes[box_offset + 2],
            boxes[box_offset + 3],
        ];
        detections.push(BoundingBox::from_normalized_cxcywh(
            cx, cy, w, h, width, height, score,
        ));
    }

    Ok(detections)
}

/// Decode a `YOLOv8`-style output for a single image
///
/// Accepts `(1, attrs, anchors)` or the transposed `(1, anchors, attrs)`
/// layout. Features are `[cx, cy, w, h, ...]` in input-pixel units. With six
/// attributes the score is `objectness * class`; otherwise it is the best of
/// the class columns. Boxes are rescaled from the square input to the
/// original image size.
pub fn decode_yolo(
    data: &[f32],
    dims: &[usize],
    input_size: u32,
    image_size: (u32, u32),
    score_threshold: f32,
) -> Result<DetectionSet, DetectorError> {
    let [_, d1, d2] = dims else {
        return Err(DetectorError::OutputLayout(format!(
            "expected 3D output tensor, got {}D",
            dims.len()
        )));
    };
    // anchors outnumber attributes in every real export
    let transposed = d1 > d2;
    let (attrs, anchors) = if transposed { (*d2, *d1) } else { (*d1, *d2) };
    if attrs < 5 {
        return Err(DetectorError::OutputLayout(format!(
            "expected at least 5 attributes per anchor, got {attrs}"
        )));
    }
    if data.len() < attrs * anchors {
        return Err(DetectorError::OutputLayout(
            "tensor data length does not match its shape".to_string(),
        ));
    }

    let feature = |anchor: usize, idx: usize| {
        if transposed {
            data[anchor * attrs + idx]
        } else {
            data[idx * anchors + anchor]
        }
    };

    let scale_x = image_size.0 as f32 / input_size as f32;
    let scale_y = image_size.1 as f32 / input_size as f32;
    let mut detections = Vec::with_capacity(anchors / 10);

    for anchor in 0..anchors {
        let score = if attrs == 6 {
            feature(anchor, 4) * feature(anchor, 5)
        } else {
            (4..attrs)
                .map(|idx| feature(anchor, idx))
                .fold(0.0f32, f32::max)
        };
        if score < score_threshold {
            continue;
        }

        let cx = feature(anchor, 0);
        let cy = feature(anchor, 1);
        let w = feature(anchor, 2);
        let h = feature(anchor, 3);
        detections.push(BoundingBox::new(
            (cx - w / 2.0) * scale_x,
            (cy - h / 2.0) * scale_y,
            (cx + w / 2.0) * scale_x,
            (cy + h / 2.0) * scale_y,
            score,
        ));
    }

    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }

    #[test]
    fn test_decode_detr_single_class() {
        // two queries, one confident, one not
        let logits = [3.0, -3.0];
        let boxes = [0.5, 0.5, 0.5, 0.25, 0.1, 0.1, 0.1, 0.1];
        let dets = decode_detr(&logits, &[1, 2], &boxes, &[1, 2, 4], 0, (200, 400), 0.5).unwrap();
        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert_eq!((d.x1, d.y1, d.x2, d.y2), (50.0, 150.0, 150.0, 250.0));
        assert!((d.score - sigmoid(3.0)).abs() < 1e-6);
    }

    #[test]
    fn test_decode_detr_multiclass_ignores_no_object() {
        // classes: [a, b, no-object]; no-object dominates but is ignored
        let logits = [1.0, 1.0, 9.0];
        let boxes = [0.5, 0.5, 0.2, 0.2];
        let dets =
            decode_detr(&logits, &[1, 1, 3], &boxes, &[1, 1, 4], 0, (100, 100), 0.4).unwrap();
        assert_eq!(dets.len(), 1);
        assert!((dets[0].score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_decode_detr_batch_index() {
        let logits = [-5.0, 5.0];
        let boxes = [0.5, 0.5, 0.2, 0.2, 0.25, 0.25, 0.5, 0.5];
        let dets = decode_detr(&logits, &[2, 1], &boxes, &[2, 1, 4], 1, (40, 40), 0.5).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].x1, 0.0);
        assert_eq!(dets[0].x2, 20.0);

        let err = decode_detr(&logits, &[2, 1], &boxes, &[2, 1, 4], 2, (40, 40), 0.5);
        assert!(err.is_err());
    }

    #[test]
    fn test_decode_detr_shape_mismatch() {
        let err = decode_detr(&[0.0], &[1, 1], &[0.0; 4], &[1, 2, 4], 0, (1, 1), 0.1);
        assert!(matches!(err, Err(DetectorError::OutputLayout(_))));
    }

    /// Pack anchor rows into the feature-major `(1, attrs, anchors)` layout,
    /// padding with all-zero anchors
    fn feature_major<const A: usize>(rows: &[[f32; A]], anchors: usize) -> Vec<f32> {
        let mut data = vec![0.0; A * anchors];
        for (anchor, row) in rows.iter().enumerate() {
            for (idx, v) in row.iter().enumerate() {
                data[idx * anchors + anchor] = *v;
            }
        }
        data
    }

    fn anchor_major<const A: usize>(rows: &[[f32; A]], anchors: usize) -> Vec<f32> {
        let mut data = vec![0.0; A * anchors];
        for (anchor, row) in rows.iter().enumerate() {
            data[anchor * A..(anchor + 1) * A].copy_from_slice(row);
        }
        data
    }

    const ROWS: [[f32; 6]; 2] = [
        [320.0, 320.0, 64.0, 32.0, 0.9, 0.8],
        [100.0, 100.0, 10.0, 10.0, 0.9, 0.1],
    ];

    #[test]
    fn test_decode_yolo_six_attributes() {
        let data = feature_major(&ROWS, 8);
        let dets = decode_yolo(&data, &[1, 6, 8], 640, (1280, 640), 0.5).unwrap();
        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert!((d.score - 0.72).abs() < 1e-6);
        assert_eq!((d.x1, d.y1, d.x2, d.y2), (576.0, 304.0, 704.0, 336.0));
    }

    #[test]
    fn test_decode_yolo_transposed_matches() {
        let a = decode_yolo(&feature_major(&ROWS, 8), &[1, 6, 8], 640, (640, 640), 0.05).unwrap();
        let b = decode_yolo(&anchor_major(&ROWS, 8), &[1, 8, 6], 640, (640, 640), 0.05).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_decode_yolo_class_columns() {
        // three class columns, best is 0.6
        let rows = [[10.0, 10.0, 4.0, 4.0, 0.2, 0.6, 0.1]];
        let data = feature_major(&rows, 16);
        let dets = decode_yolo(&data, &[1, 7, 16], 20, (20, 20), 0.5).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].score, 0.6);
        assert_eq!((dets[0].x1, dets[0].x2), (8.0, 12.0));
    }

    #[test]
    fn test_decode_yolo_bad_layout() {
        assert!(decode_yolo(&[0.0; 4], &[1, 4], 640, (640, 640), 0.5).is_err());
        assert!(decode_yolo(&[0.0; 32], &[1, 4, 8], 640, (640, 640), 0.5).is_err());
    }
}
