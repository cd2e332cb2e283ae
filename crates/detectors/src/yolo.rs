//! Single-stage detector adapter (`YOLOv8` exports)

use crate::decode::decode_yolo;
use crate::session::{create_session, images_to_tensor};
use crate::{DetectorError, NeuralDetector};
use detect_fusion_common::DetectionSet;
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

pub const YOLO_INPUT_SIZE: u32 = 640;

/// `YOLOv8` detector over an ONNX export
///
/// Input is `(1, 3, S, S)` RGB scaled to `[0, 1]` without mean/std
/// normalization. Batches fall back to one call per image since most
/// exports fix the batch dimension to one.
pub struct YoloDetector {
    session: Mutex<Session>,
    input_size: u32,
}

impl YoloDetector {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self, DetectorError> {
        let session = create_session(model_path.as_ref())?;
        Ok(Self {
            session: Mutex::new(session),
            input_size,
        })
    }

    pub fn from_path(model_path: &Path) -> Result<Self, DetectorError> {
        Self::new(model_path, YOLO_INPUT_SIZE)
    }
}

impl NeuralDetector for YoloDetector {
    fn name(&self) -> &str {
        "yolo"
    }

    fn predict(&self, image: &RgbImage, score_threshold: f32) -> Result<DetectionSet, DetectorError> {
        let tensor = images_to_tensor(&[image], self.input_size, None);
        // Zero-copy tensor: use view instead of clone
        let input = TensorRef::from_array_view(tensor.view())
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::Inference("detector session lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
            DetectorError::Inference(format!("Failed to extract tensor: {e}"))
        })?;
        debug!("YOLO output shape: {:?}", shape);

        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        decode_yolo(data, &dims, self.input_size, image.dimensions(), score_threshold)
    }
}
