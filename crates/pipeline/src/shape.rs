//! Aspect-ratio shape prior learned from reference labels

use crate::config::ShapeConfig;
use detect_fusion_common::{percentile, BoundingBox};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Percentiles of the reference aspect ratios used as bounds
const LOW_PERCENTILE: f32 = 0.02;
const HIGH_PERCENTILE: f32 = 0.98;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset directory not found: {0}")]
    MissingDirectory(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepted width/height range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShapeBounds {
    pub low: f32,
    pub high: f32,
}

impl ShapeBounds {
    #[must_use]
    pub fn contains(&self, aspect_ratio: f32) -> bool {
        aspect_ratio >= self.low && aspect_ratio <= self.high
    }

    /// Whether a box's width/height ratio lies within the bounds
    #[must_use]
    pub fn accepts(&self, bbox: &BoundingBox) -> bool {
        bbox.aspect_ratio().is_some_and(|ar| self.contains(ar))
    }
}

/// One labeled box of a reference image, YOLO-normalized
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceLabel {
    pub image_path: PathBuf,
    pub image_width: u32,
    pub image_height: u32,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl ReferenceLabel {
    /// Width/height ratio in pixels, `None` for zero-height labels
    #[must_use]
    pub fn aspect_ratio(&self) -> Option<f32> {
        let bw = self.w * self.image_width as f32;
        let bh = self.h * self.image_height as f32;
        (bh > 0.0 && bw.is_finite()).then_some(bw / bh)
    }

    /// The label as a pixel-space box with score 1
    #[must_use]
    pub fn to_bbox(&self) -> BoundingBox {
        BoundingBox::from_normalized_cxcywh(
            self.cx,
            self.cy,
            self.w,
            self.h,
            self.image_width as f32,
            self.image_height as f32,
            1.0,
        )
    }
}

/// Provider of labeled reference boxes
pub trait ReferenceLabelSource {
    fn labels(&self) -> Result<Vec<ReferenceLabel>, DatasetError>;
}

impl ReferenceLabelSource for Vec<ReferenceLabel> {
    fn labels(&self) -> Result<Vec<ReferenceLabel>, DatasetError> {
        Ok(self.clone())
    }
}

/// One image of a dataset with its labels
#[derive(Debug, Clone)]
pub struct DatasetSample {
    pub image_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub labels: Vec<ReferenceLabel>,
}

impl DatasetSample {
    #[must_use]
    pub fn ground_truth(&self) -> Vec<BoundingBox> {
        self.labels.iter().map(ReferenceLabel::to_bbox).collect()
    }
}

/// YOLO-format dataset: `images/<stem>.{jpg,jpeg,png}` with
/// `labels/<stem>.txt` lines `class cx cy w h`
#[derive(Debug, Clone)]
pub struct YoloLabelDirectory {
    root: PathBuf,
}

impl YoloLabelDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every readable image in `images/`, sorted by path
    ///
    /// Images without a label file have no labels. Images whose header cannot
    /// be read are skipped with a warning.
    pub fn samples(&self) -> Result<Vec<DatasetSample>, DatasetError> {
        let images_dir = self.root.join("images");
        let labels_dir = self.root.join("labels");
        if !images_dir.is_dir() {
            return Err(DatasetError::MissingDirectory(images_dir));
        }

        let mut image_paths: Vec<PathBuf> = std::fs::read_dir(&images_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        image_paths.sort();

        let mut samples = Vec::with_capacity(image_paths.len());
        for image_path in image_paths {
            let (width, height) = match image::image_dimensions(&image_path) {
                Ok(dims) => dims,
                Err(e) => {
                    warn!("Skipping {}: {}", image_path.display(), e);
                    continue;
                }
            };

            let mut labels = Vec::new();
            if let Some(stem) = image_path.file_stem() {
                let label_path = labels_dir.join(format!("{}.txt", stem.to_string_lossy()));
                if label_path.is_file() {
                    let contents = std::fs::read_to_string(&label_path)?;
                    labels = parse_label_lines(&contents, &image_path, width, height);
                }
            }

            samples.push(DatasetSample {
                image_path,
                width,
                height,
                labels,
            });
        }

        debug!(
            "Read {} images from {}",
            samples.len(),
            self.root.display()
        );
        Ok(samples)
    }
}

impl ReferenceLabelSource for YoloLabelDirectory {
    fn labels(&self) -> Result<Vec<ReferenceLabel>, DatasetError> {
        Ok(self
            .samples()?
            .into_iter()
            .flat_map(|sample| sample.labels)
            .collect())
    }
}

/// Parse `class cx cy w h` lines, skipping malformed ones
fn parse_label_lines(contents: &str, image_path: &Path, width: u32, height: u32) -> Vec<ReferenceLabel> {
    contents
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }
            let values: Vec<f32> = fields[1..5]
                .iter()
                .map(|f| f.parse::<f32>())
                .collect::<Result<_, _>>()
                .ok()?;
            Some(ReferenceLabel {
                image_path: image_path.to_path_buf(),
                image_width: width,
                image_height: height,
                cx: values[0],
                cy: values[1],
                w: values[2],
                h: values[3],
            })
        })
        .collect()
}

/// Computes [`ShapeBounds`] once at pipeline construction
#[derive(Debug, Clone)]
pub struct ShapeBoundsEstimator {
    min_aspect: f32,
    max_aspect: f32,
}

impl ShapeBoundsEstimator {
    #[must_use]
    pub fn new(config: &ShapeConfig) -> Self {
        Self {
            min_aspect: config.min_aspect,
            max_aspect: config.max_aspect,
        }
    }

    /// The configured bounds, used when no reference data is usable
    #[must_use]
    pub fn configured(&self) -> ShapeBounds {
        ShapeBounds {
            low: self.min_aspect,
            high: self.max_aspect,
        }
    }

    /// Bounds from the 2nd and 98th percentile of `aspect_ratios`, clamped to
    /// the configured range
    #[must_use]
    pub fn from_aspect_ratios(&self, aspect_ratios: &[f32]) -> ShapeBounds {
        let usable: Vec<f32> = aspect_ratios
            .iter()
            .copied()
            .filter(|ar| ar.is_finite() && *ar > 0.0)
            .collect();
        if usable.is_empty() {
            return self.configured();
        }

        let low = percentile(&usable, LOW_PERCENTILE).max(self.min_aspect);
        let high = percentile(&usable, HIGH_PERCENTILE).min(self.max_aspect);
        if low > high {
            warn!(
                "Reference aspect ratios give inverted bounds [{:.3}, {:.3}], using configured",
                low, high
            );
            return self.configured();
        }
        ShapeBounds { low, high }
    }

    /// Bounds from a reference label source
    ///
    /// Read failures fall back to the configured bounds.
    pub fn from_reference(&self, source: &dyn ReferenceLabelSource) -> ShapeBounds {
        let labels = match source.labels() {
            Ok(labels) => labels,
            Err(e) => {
                warn!("Reference labels unavailable ({}), using configured shape bounds", e);
                return self.configured();
            }
        };
        let aspects: Vec<f32> = labels.iter().filter_map(ReferenceLabel::aspect_ratio).collect();
        let bounds = self.from_aspect_ratios(&aspects);
        info!(
            "Shape bounds [{:.3}, {:.3}] from {} reference labels",
            bounds.low,
            bounds.high,
            aspects.len()
        );
        bounds
    }
}
