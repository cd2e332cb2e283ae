//! Image decoding, enhancement and cropping

use detect_fusion_common::BoundingBox;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ImageSourceError {
    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Image too small to enhance: {width}x{height}")]
    TooSmall { width: u32, height: u32 },
}

/// Decode an image file into RGB8
pub fn decode(path: &Path) -> Result<RgbImage, ImageSourceError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| ImageSourceError::Decode {
            path: path.display().to_string(),
            source,
        })
}

/// Pixel rectangle inside an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Expand `bbox` by `margin` times its width/height on each side and
    /// clamp to an `img_width` x `img_height` image
    ///
    /// Returns `None` when nothing of the expanded box lies inside the image.
    #[must_use]
    pub fn around(bbox: &BoundingBox, margin: f32, img_width: u32, img_height: u32) -> Option<Self> {
        let dx = bbox.width() * margin;
        let dy = bbox.height() * margin;
        let x1 = (bbox.x1 - dx).floor().max(0.0);
        let y1 = (bbox.y1 - dy).floor().max(0.0);
        let x2 = (bbox.x2 + dx).ceil().min(img_width as f32);
        let y2 = (bbox.y2 + dy).ceil().min(img_height as f32);

        if !(x1.is_finite() && y1.is_finite() && x2.is_finite() && y2.is_finite())
            || x2 <= x1
            || y2 <= y1
        {
            return None;
        }

        Some(Self {
            x: x1 as u32,
            y: y1 as u32,
            width: (x2 - x1) as u32,
            height: (y2 - y1) as u32,
        })
    }
}

/// Copy the `rect` region out of `image`
///
/// A rectangle reaching past the image is clamped; one that lies entirely
/// outside yields a copy of the whole image.
#[must_use]
pub fn crop(image: &RgbImage, rect: CropRect) -> RgbImage {
    let (w, h) = image.dimensions();
    let x = rect.x.min(w);
    let y = rect.y.min(h);
    let width = rect.width.min(w - x);
    let height = rect.height.min(h - y);
    if width == 0 || height == 0 {
        warn!("Crop {:?} outside {}x{} image, using full image", rect, w, h);
        return image.clone();
    }
    image::imageops::crop_imm(image, x, y, width, height).to_image()
}

/// Denoise with a 3x3 median filter, then equalize the HSV value channel
///
/// Hue and saturation are preserved by scaling all channels with the same
/// factor; pure black pixels map to the equalized gray level.
pub fn enhance(image: &RgbImage) -> Result<RgbImage, ImageSourceError> {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return Err(ImageSourceError::TooSmall { width, height });
    }

    let mut out = imageproc::filter::median_filter(image, 1, 1);

    let value = |p: &image::Rgb<u8>| p[0].max(p[1]).max(p[2]);

    let mut hist = [0u64; 256];
    for pixel in out.pixels() {
        hist[value(pixel) as usize] += 1;
    }
    let total = u64::from(width) * u64::from(height);
    let mut lut = [0u8; 256];
    let mut cumulative = 0u64;
    for (level, count) in hist.iter().enumerate() {
        cumulative += count;
        lut[level] = ((cumulative as f64 / total as f64) * 255.0).round() as u8;
    }

    for pixel in out.pixels_mut() {
        let v = value(pixel);
        let nv = lut[v as usize];
        if v == 0 {
            *pixel = image::Rgb([nv, nv, nv]);
            continue;
        }
        let factor = f32::from(nv) / f32::from(v);
        for c in pixel.0.iter_mut() {
            *c = (f32::from(*c) * factor).round().min(255.0) as u8;
        }
    }

    Ok(out)
}

/// [`enhance`], or an unmodified copy when enhancement is not possible
#[must_use]
pub fn enhance_or_copy(image: &RgbImage) -> RgbImage {
    match enhance(image) {
        Ok(enhanced) => enhanced,
        Err(e) => {
            warn!("Enhancement skipped: {}", e);
            image.clone()
        }
    }
}
