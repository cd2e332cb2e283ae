//! Neural detector adapters via ONNX Runtime
//!
//! This crate provides the [`NeuralDetector`] contract consumed by the fusion
//! pipeline together with two ONNX Runtime implementations:
//!
//! - [`DetrDetector`]: transformer-style detector (`pixel_values` input,
//!   `logits` + `boxes` outputs, normalized center-format boxes)
//! - [`YoloDetector`]: single-stage `YOLOv8` export (`images` input, one
//!   `(1, attrs, anchors)` output)
//!
//! Both adapters own their `Session` behind a `Mutex`, so a detector instance
//! is `Send + Sync` and concurrent callers are serialized per instance.
//!
//! # Example
//! ```no_run
//! use detect_fusion_detectors::{DetrDetector, NeuralDetector};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let detector = DetrDetector::new("conditional_detr.onnx", 640)?;
//! let img = image::open("page.jpg")?.to_rgb8();
//!
//! for bbox in detector.predict(&img, 0.3)? {
//!     println!("{bbox}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod decode;
pub mod detr;
pub mod image_source;
pub mod session;
pub mod yolo;

use detect_fusion_common::{DetectionSet, ProcessingError};
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub use detr::DetrDetector;
pub use image_source::{CropRect, ImageSourceError};
pub use yolo::YoloDetector;

/// Error types for detector adapters
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Unexpected output layout: {0}")]
    OutputLayout(String),

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("ONNX Runtime error: {0}")]
    OnnxRuntime(#[from] ort::Error),
}

impl From<DetectorError> for ProcessingError {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::ModelLoad(msg) => ProcessingError::ModelUnavailable(msg),
            other => ProcessingError::Inference(other.to_string()),
        }
    }
}

/// Contract of a neural object detector
///
/// Implementations return boxes in pixel coordinates of the image they were
/// given, keeping only candidates scoring at least `score_threshold`.
pub trait NeuralDetector: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Detect objects in a single image
    fn predict(&self, image: &RgbImage, score_threshold: f32)
        -> Result<DetectionSet, DetectorError>;

    /// Detect objects in several images, one result per input in order
    fn predict_batch(
        &self,
        images: &[RgbImage],
        score_threshold: f32,
    ) -> Result<Vec<DetectionSet>, DetectorError> {
        images
            .iter()
            .map(|img| self.predict(img, score_threshold))
            .collect()
    }
}

/// A detector that may or may not be configured
///
/// Consumers match on the slot instead of checking a nullable handle at every
/// call site; an unavailable slot carries the reason for logs.
#[derive(Clone)]
pub enum DetectorSlot {
    Available(Arc<dyn NeuralDetector>),
    Unavailable { reason: String },
}

impl DetectorSlot {
    /// Wrap a loaded detector
    pub fn available(detector: impl NeuralDetector + 'static) -> Self {
        DetectorSlot::Available(Arc::new(detector))
    }

    /// Mark the slot as intentionally empty
    pub fn unavailable(reason: impl Into<String>) -> Self {
        DetectorSlot::Unavailable {
            reason: reason.into(),
        }
    }

    /// Load a detector from `model_path` when the file exists
    ///
    /// A missing file or a load failure degrades to an unavailable slot
    /// instead of failing the caller.
    pub fn load<P, D, F>(model_path: P, loader: F) -> Self
    where
        P: AsRef<Path>,
        D: NeuralDetector + 'static,
        F: FnOnce(&Path) -> Result<D, DetectorError>,
    {
        let path = model_path.as_ref();
        if !path.exists() {
            let reason = format!("model file not found: {}", path.display());
            warn!("Detector unavailable: {}", reason);
            return Self::unavailable(reason);
        }
        match loader(path) {
            Ok(detector) => Self::available(detector),
            Err(e) => {
                warn!("Detector unavailable, failed to load {}: {}", path.display(), e);
                Self::unavailable(e.to_string())
            }
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, DetectorSlot::Available(_))
    }

    #[must_use]
    pub fn detector(&self) -> Option<&Arc<dyn NeuralDetector>> {
        match self {
            DetectorSlot::Available(detector) => Some(detector),
            DetectorSlot::Unavailable { .. } => None,
        }
    }
}

impl std::fmt::Debug for DetectorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectorSlot::Available(detector) => {
                f.debug_tuple("Available").field(&detector.name()).finish()
            }
            DetectorSlot::Unavailable { reason } => f
                .debug_struct("Unavailable")
                .field("reason", reason)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use detect_fusion_common::BoundingBox;

    struct FixedDetector(DetectionSet);

    impl NeuralDetector for FixedDetector {
        fn name(&self) -> &str {
            "fixed"
        }

        fn predict(
            &self,
            _image: &RgbImage,
            score_threshold: f32,
        ) -> Result<DetectionSet, DetectorError> {
            Ok(self
                .0
                .iter()
                .filter(|b| b.score >= score_threshold)
                .copied()
                .collect())
        }
    }

    #[test]
    fn test_default_predict_batch_preserves_order() {
        let det = FixedDetector(vec![
            BoundingBox::new(0.0, 0.0, 1.0, 1.0, 0.9),
            BoundingBox::new(0.0, 0.0, 1.0, 1.0, 0.2),
        ]);
        let images = vec![RgbImage::new(4, 4), RgbImage::new(8, 8)];
        let results = det.predict_batch(&images, 0.5).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].len(), 1);
        assert_eq!(results[1].len(), 1);
    }

    #[test]
    fn test_slot_missing_model_is_unavailable() {
        let slot = DetectorSlot::load("definitely/not/here.onnx", |_| {
            Ok(FixedDetector(Vec::new()))
        });
        assert!(!slot.is_available());
        assert!(slot.detector().is_none());
        assert!(format!("{slot:?}").contains("not found"));
    }

    #[test]
    fn test_slot_loader_failure_is_unavailable() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let slot = DetectorSlot::load(file.path(), |_| -> Result<FixedDetector, _> {
            Err(DetectorError::ModelLoad("bad graph".to_string()))
        });
        match slot {
            DetectorSlot::Unavailable { reason } => assert!(reason.contains("bad graph")),
            DetectorSlot::Available(_) => panic!("expected unavailable slot"),
        }
    }

    #[test]
    fn test_slot_available() {
        let slot = DetectorSlot::available(FixedDetector(Vec::new()));
        assert!(slot.is_available());
        assert_eq!(slot.detector().map(|d| d.name()), Some("fixed"));
    }

    #[test]
    fn test_error_conversion() {
        let err: ProcessingError = DetectorError::ModelLoad("x".into()).into();
        assert!(matches!(err, ProcessingError::ModelUnavailable(_)));
        let err: ProcessingError = DetectorError::Inference("y".into()).into();
        assert!(matches!(err, ProcessingError::Inference(_)));
    }
}
