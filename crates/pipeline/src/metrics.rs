//! Ground-truth matching and accuracy metrics

use detect_fusion_common::{iou, BoundingBox};
use serde::Serialize;

/// `IoU` at which a prediction matches a ground-truth box
pub const MATCH_IOU: f32 = 0.5;

/// Greedy best-match assignment in prediction order
///
/// Each prediction takes the unused ground-truth box with the highest
/// `IoU >= MATCH_IOU`, the later box winning a tie; a used box is never
/// matched again. Returns, per
/// prediction, whether it matched, and the number of matched ground truths.
fn greedy_match<'a>(
    predictions: impl IntoIterator<Item = &'a BoundingBox>,
    ground_truth: &[BoundingBox],
) -> (Vec<bool>, usize) {
    let mut used = vec![false; ground_truth.len()];
    let mut matched = Vec::new();

    for pred in predictions {
        let mut best: Option<(usize, f32)> = None;
        for (idx, gt) in ground_truth.iter().enumerate() {
            if used[idx] {
                continue;
            }
            let overlap = iou(pred, gt);
            if overlap < MATCH_IOU {
                continue;
            }
            if !matches!(best, Some((_, b)) if b > overlap) {
                best = Some((idx, overlap));
            }
        }
        match best {
            Some((idx, _)) => {
                used[idx] = true;
                matched.push(true);
            }
            None => matched.push(false),
        }
    }

    let used_count = used.iter().filter(|&&u| u).count();
    (matched, used_count)
}

/// Predictions without a matching ground-truth box
#[must_use]
pub fn count_fp(predictions: &[BoundingBox], ground_truth: &[BoundingBox]) -> usize {
    let (matched, _) = greedy_match(predictions, ground_truth);
    matched.iter().filter(|&&m| !m).count()
}

/// Ground-truth boxes no prediction matched
#[must_use]
pub fn count_fn(predictions: &[BoundingBox], ground_truth: &[BoundingBox]) -> usize {
    let (_, used) = greedy_match(predictions, ground_truth);
    ground_truth.len() - used
}

/// Precision/recall proxies for one image
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImageMetrics {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: f32,
    pub recall: f32,
}

impl ImageMetrics {
    #[must_use]
    pub fn compute(predictions: &[BoundingBox], ground_truth: &[BoundingBox]) -> Self {
        let (matched, used) = greedy_match(predictions, ground_truth);
        let true_positives = matched.iter().filter(|&&m| m).count();
        let false_positives = matched.len() - true_positives;
        let false_negatives = ground_truth.len() - used;
        Self {
            true_positives,
            false_positives,
            false_negatives,
            precision: ratio(true_positives, true_positives + false_positives),
            recall: ratio(true_positives, true_positives + false_negatives),
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f32 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f32 / denominator as f32
    }
}

/// Dataset-level results
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub images: usize,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    /// All-point interpolated average precision at `IoU` 0.5
    pub average_precision: f32,
}

/// Accumulates predictions over a dataset
///
/// Within each image predictions are matched in descending score order, the
/// usual convention for average precision.
#[derive(Debug, Clone, Default)]
pub struct DatasetEvaluator {
    scored: Vec<(f32, bool)>,
    total_ground_truth: usize,
    images: usize,
}

impl DatasetEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, predictions: &[BoundingBox], ground_truth: &[BoundingBox]) {
        let mut ordered: Vec<&BoundingBox> = predictions.iter().collect();
        ordered.sort_by(|a, b| b.score.total_cmp(&a.score));

        let (matched, _) = greedy_match(ordered.iter().copied(), ground_truth);
        self.scored
            .extend(ordered.iter().zip(matched).map(|(p, m)| (p.score, m)));
        self.total_ground_truth += ground_truth.len();
        self.images += 1;
    }

    #[must_use]
    pub fn summary(&self) -> EvaluationSummary {
        let true_positives = self.scored.iter().filter(|(_, m)| *m).count();
        let false_positives = self.scored.len() - true_positives;
        let false_negatives = self.total_ground_truth - true_positives;
        let precision = ratio(true_positives, true_positives + false_positives);
        let recall = ratio(true_positives, self.total_ground_truth);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        EvaluationSummary {
            images: self.images,
            true_positives,
            false_positives,
            false_negatives,
            precision,
            recall,
            f1,
            average_precision: self.average_precision(),
        }
    }

    fn average_precision(&self) -> f32 {
        if self.total_ground_truth == 0 {
            return 0.0;
        }

        let mut ordered = self.scored.clone();
        ordered.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut recalls = vec![0.0f32];
        let mut precisions = vec![0.0f32];
        let (mut tp, mut fp) = (0usize, 0usize);
        for (_, matched) in &ordered {
            if *matched {
                tp += 1;
            } else {
                fp += 1;
            }
            recalls.push(tp as f32 / self.total_ground_truth as f32);
            precisions.push(tp as f32 / (tp + fp) as f32);
        }
        recalls.push(1.0);
        precisions.push(0.0);

        // precision envelope
        for i in (0..precisions.len() - 1).rev() {
            precisions[i] = precisions[i].max(precisions[i + 1]);
        }

        recalls
            .windows(2)
            .zip(precisions.iter().skip(1))
            .map(|(r, p)| (r[1] - r[0]) * p)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2, score)
    }

    #[test]
    fn test_count_fp_and_fn() {
        let gts = vec![bbox(0.0, 0.0, 10.0, 10.0, 1.0), bbox(50.0, 50.0, 60.0, 60.0, 1.0)];
        let preds = vec![
            bbox(0.0, 0.0, 10.0, 10.0, 0.9),
            bbox(1.0, 1.0, 10.0, 10.0, 0.8), // duplicate of a used box
            bbox(100.0, 100.0, 110.0, 110.0, 0.7),
        ];
        assert_eq!(count_fp(&preds, &gts), 2);
        assert_eq!(count_fn(&preds, &gts), 1);
    }

    #[test]
    fn test_best_match_wins() {
        let gts = vec![bbox(0.0, 0.0, 10.0, 10.0, 1.0), bbox(2.0, 0.0, 12.0, 10.0, 1.0)];
        // overlaps both, best with the second
        let preds = vec![bbox(2.0, 0.0, 12.0, 10.0, 0.9), bbox(0.0, 0.0, 10.0, 10.0, 0.8)];
        assert_eq!(count_fp(&preds, &gts), 0);
        assert_eq!(count_fn(&preds, &gts), 0);
    }

    #[test]
    fn test_equal_overlap_goes_to_later_ground_truth() {
        let gts = vec![bbox(0.0, 0.0, 10.0, 10.0, 1.0), bbox(2.0, 0.0, 12.0, 10.0, 1.0)];
        // the first prediction overlaps both equally; the second only fits the first box
        let preds = vec![bbox(1.0, 0.0, 11.0, 10.0, 0.9), bbox(-3.0, 0.0, 7.0, 10.0, 0.8)];
        assert_eq!(count_fp(&preds, &gts), 0);
        assert_eq!(count_fn(&preds, &gts), 0);
    }

    #[test]
    fn test_image_metrics() {
        let gts = vec![bbox(0.0, 0.0, 10.0, 10.0, 1.0), bbox(50.0, 50.0, 60.0, 60.0, 1.0)];
        let preds = vec![bbox(0.0, 0.0, 10.0, 10.0, 0.9), bbox(80.0, 80.0, 90.0, 90.0, 0.9)];
        let m = ImageMetrics::compute(&preds, &gts);
        assert_eq!((m.true_positives, m.false_positives, m.false_negatives), (1, 1, 1));
        assert_eq!(m.precision, 0.5);
        assert_eq!(m.recall, 0.5);

        let empty = ImageMetrics::compute(&[], &[]);
        assert_eq!((empty.precision, empty.recall), (0.0, 0.0));
    }

    #[test]
    fn test_average_precision() {
        let gts = vec![bbox(0.0, 0.0, 10.0, 10.0, 1.0), bbox(50.0, 50.0, 60.0, 60.0, 1.0)];
        let preds = vec![
            bbox(50.0, 50.0, 60.0, 60.0, 0.7),
            bbox(0.0, 0.0, 10.0, 10.0, 0.9),
            bbox(80.0, 80.0, 90.0, 90.0, 0.8),
        ];
        let mut evaluator = DatasetEvaluator::new();
        evaluator.add_image(&preds, &gts);
        let summary = evaluator.summary();

        // recall 0.5 at precision 1, recall 1.0 at precision 2/3
        assert!((summary.average_precision - (0.5 + 0.5 * 2.0 / 3.0)).abs() < 1e-5);
        assert_eq!(summary.true_positives, 2);
        assert_eq!(summary.false_positives, 1);
        assert_eq!(summary.false_negatives, 0);
        assert_eq!(summary.recall, 1.0);
        assert!((summary.f1 - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_perfect_and_empty_datasets() {
        let gts = vec![bbox(0.0, 0.0, 10.0, 10.0, 1.0)];
        let mut evaluator = DatasetEvaluator::new();
        evaluator.add_image(&gts, &gts);
        evaluator.add_image(&[], &[]);
        let summary = evaluator.summary();
        assert_eq!(summary.images, 2);
        assert!((summary.average_precision - 1.0).abs() < 1e-6);

        assert_eq!(DatasetEvaluator::new().summary().average_precision, 0.0);
    }
}
