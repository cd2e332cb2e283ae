/// Common types and geometry shared by every stage of the fusion pipeline
use thiserror::Error;

pub mod bbox;
pub mod geometry;

pub use bbox::{BoundingBox, DetectionSet};
pub use geometry::{centroid_distance, iou, percentile};

/// Processing errors
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Corrupted image: {0}")]
    CorruptedImage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    ImageError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<image::ImageError> for ProcessingError {
    fn from(err: image::ImageError) -> Self {
        ProcessingError::ImageError(err.to_string())
    }
}

/// Result type for processing operations
pub type Result<T> = std::result::Result<T, ProcessingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_error_conversion() {
        let err = image::ImageError::Limits(image::error::LimitError::from_kind(
            image::error::LimitErrorKind::DimensionError,
        ));
        let converted: ProcessingError = err.into();
        assert!(matches!(converted, ProcessingError::ImageError(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.onnx");
        let converted: ProcessingError = err.into();
        assert!(converted.to_string().contains("missing.onnx"));
    }
}
