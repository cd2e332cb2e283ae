//! Transformer detector adapter (DETR family)

use crate::decode::decode_detr;
use crate::session::{create_session, images_to_tensor, IMAGENET_MEAN, IMAGENET_STD};
use crate::{DetectorError, NeuralDetector};
use detect_fusion_common::DetectionSet;
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Default square input side
pub const DETR_INPUT_SIZE: u32 = 640;

/// DETR-style detector over an ONNX export
///
/// The model takes ImageNet-normalized `pixel_values` of shape
/// `(N, 3, S, S)` and produces `logits` plus `boxes` in normalized
/// center format. A whole batch is run through a single session call.
pub struct DetrDetector {
    session: Mutex<Session>,
    input_size: u32,
}

impl DetrDetector {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self, DetectorError> {
        let session = create_session(model_path.as_ref())?;
        Ok(Self {
            session: Mutex::new(session),
            input_size,
        })
    }

    /// Load with the default input size
    pub fn from_path(model_path: &Path) -> Result<Self, DetectorError> {
        Self::new(model_path, DETR_INPUT_SIZE)
    }

    fn run(&self, images: &[&RgbImage], score_threshold: f32) -> Result<Vec<DetectionSet>, DetectorError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let tensor = images_to_tensor(images, self.input_size, Some((IMAGENET_MEAN, IMAGENET_STD)));
        let input = TensorRef::from_array_view(tensor.view())
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::Inference("detector session lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let logits_value = outputs
            .get("logits")
            .ok_or_else(|| DetectorError::OutputLayout("missing `logits` output".to_string()))?;
        let boxes_value = outputs
            .get("boxes")
            .or_else(|| outputs.get("pred_boxes"))
            .ok_or_else(|| DetectorError::OutputLayout("missing `boxes` output".to_string()))?;

        let (logits_shape, logits) = logits_value.try_extract_tensor::<f32>().map_err(|e| {
            DetectorError::Inference(format!("Failed to extract logits: {e}"))
        })?;
        let (boxes_shape, boxes) = boxes_value.try_extract_tensor::<f32>().map_err(|e| {
            DetectorError::Inference(format!("Failed to extract boxes: {e}"))
        })?;
        debug!("DETR output shapes: logits {:?}, boxes {:?}", logits_shape, boxes_shape);

        let logits_dims: Vec<usize> = logits_shape.iter().map(|&d| d as usize).collect();
        let boxes_dims: Vec<usize> = boxes_shape.iter().map(|&d| d as usize).collect();

        images
            .iter()
            .enumerate()
            .map(|(batch_index, image)| {
                decode_detr(
                    logits,
                    &logits_dims,
                    boxes,
                    &boxes_dims,
                    batch_index,
                    image.dimensions(),
                    score_threshold,
                )
            })
            .collect()
    }
}

impl NeuralDetector for DetrDetector {
    fn name(&self) -> &str {
        "detr"
    }

    fn predict(&self, image: &RgbImage, score_threshold: f32) -> Result<DetectionSet, DetectorError> {
        let mut results = self.run(&[image], score_threshold)?;
        results
            .pop()
            .ok_or_else(|| DetectorError::OutputLayout("empty batch output".to_string()))
    }

    fn predict_batch(
        &self,
        images: &[RgbImage],
        score_threshold: f32,
    ) -> Result<Vec<DetectionSet>, DetectorError> {
        let refs: Vec<&RgbImage> = images.iter().collect();
        self.run(&refs, score_threshold)
    }
}
