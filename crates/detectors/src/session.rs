//! ONNX Runtime session creation and input tensor preparation

use crate::DetectorError;
use image::RgbImage;
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// ImageNet channel statistics used by transformer detectors
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Create a CPU session with full graph optimizations
///
/// Intra-op parallelism defaults to the physical core count and can be
/// overridden with `DETECT_FUSION_THREADS`.
pub fn create_session(model_path: &Path) -> Result<Session, DetectorError> {
    if !model_path.exists() {
        return Err(DetectorError::ModelLoad(format!(
            "model file not found: {}",
            model_path.display()
        )));
    }

    let num_threads = std::env::var("DETECT_FUSION_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get_physical);

    let start = Instant::now();
    let session = Session::builder()
        .map_err(|e| DetectorError::ModelLoad(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| DetectorError::ModelLoad(e.to_string()))?
        .with_intra_threads(num_threads)
        .map_err(|e| DetectorError::ModelLoad(e.to_string()))?
        .commit_from_file(model_path)
        .map_err(|e| DetectorError::ModelLoad(e.to_string()))?;

    info!(
        "Loaded {} in {:.3}s ({} intra-op threads)",
        model_path.display(),
        start.elapsed().as_secs_f64(),
        num_threads
    );
    Ok(session)
}

/// Resize images to a square input and pack them as a `(N, 3, S, S)` tensor
///
/// Pixels are scaled to `[0, 1]`; when `normalization` is given each channel
/// is further standardized as `(v - mean) / std`.
#[must_use]
pub fn images_to_tensor(
    images: &[&RgbImage],
    input_size: u32,
    normalization: Option<([f32; 3], [f32; 3])>,
) -> Array4<f32> {
    let size = input_size as usize;
    let mut tensor = Array4::zeros((images.len(), 3, size, size));

    for (b, image) in images.iter().enumerate() {
        let resized = image::imageops::resize(
            *image,
            input_size,
            input_size,
            image::imageops::FilterType::Triangle,
        );

        for y in 0..size {
            for x in 0..size {
                let pixel = resized.get_pixel(x as u32, y as u32);
                for c in 0..3 {
                    let v = f32::from(pixel[c]) / 255.0;
                    tensor[[b, c, y, x]] = match normalization {
                        Some((mean, std)) => (v - mean[c]) / std[c],
                        None => v,
                    };
                }
            }
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_tensor_shape_and_scaling() {
        let img = RgbImage::from_pixel(10, 20, Rgb([255, 0, 51]));
        let tensor = images_to_tensor(&[&img], 8, None);
        assert_eq!(tensor.shape(), &[1, 3, 8, 8]);
        assert!((tensor[[0, 0, 3, 3]] - 1.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 1, 0, 0]], 0.0);
        assert!((tensor[[0, 2, 7, 7]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_tensor_normalization() {
        let img = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let tensor = images_to_tensor(&[&img, &img], 4, Some((IMAGENET_MEAN, IMAGENET_STD)));
        assert_eq!(tensor.shape(), &[2, 3, 4, 4]);
        let expected = -IMAGENET_MEAN[0] / IMAGENET_STD[0];
        assert!((tensor[[1, 0, 2, 2]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_missing_model_file() {
        let err = create_session(Path::new("no/such/model.onnx")).unwrap_err();
        assert!(matches!(err, DetectorError::ModelLoad(_)));
    }
}
