use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::{ImageFormat, Rgba, RgbaImage};
use ndarray::{Array2, ArrayView2};
use shared::LabelMap;
use std::io::Cursor;

use super::classifier::PredictionMap;
use super::colormap::Colormap;
use super::metrics::gaussian_blur;
use super::models::Classifier;
use super::preprocess::NormalizedImage;
use crate::error::InferenceError;

/// Rendered saliency images are always this many pixels square.
pub const RENDER_SIZE: u32 = 224;
pub const BLUR_SIGMA: f64 = 5.0;
pub const BLUR_TRUNCATE: f64 = 3.5;

/// Pathology label -> base64 PNG.
pub type SaliencyMap = LabelMap<String>;

lazy_static::lazy_static! {
    static ref SALIENCY_COLORMAP: Colormap = Colormap::faded_viridis();
}

/// Squared input gradient, smoothed.
pub fn saliency_heatmap(gradient: ArrayView2<f32>) -> Result<Array2<f32>, InferenceError> {
    let squared = gradient.mapv(|g| g * g);
    gaussian_blur(squared.view(), BLUR_SIGMA, BLUR_TRUNCATE)
}

/// Raster for one label. Owned by a single loop iteration.
struct SaliencyCanvas {
    raster: RgbaImage,
}

impl SaliencyCanvas {
    /// Min/max-normalizes `heatmap` and paints it through the colormap,
    /// sampling the nearest heatmap cell for each output pixel.
    fn render(heatmap: ArrayView2<f32>, colormap: &Colormap) -> Result<Self, InferenceError> {
        let (rows, cols) = heatmap.dim();
        if rows == 0 || cols == 0 {
            return Err(InferenceError::Render("saliency heatmap is empty".into()));
        }

        let (min, max) = heatmap
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let span = max - min;

        let size = RENDER_SIZE as usize;
        let raster = RgbaImage::from_fn(RENDER_SIZE, RENDER_SIZE, |x, y| {
            let r = y as usize * rows / size;
            let c = x as usize * cols / size;
            let t = if span > 0.0 {
                (heatmap[[r, c]] - min) / span
            } else {
                0.0
            };
            Rgba(colormap.lookup(t))
        });
        Ok(Self { raster })
    }

    fn to_base64_png(&self) -> Result<String, InferenceError> {
        let mut png = Cursor::new(Vec::new());
        self.raster.write_to(&mut png, ImageFormat::Png)?;
        Ok(STANDARD.encode(png.into_inner()))
    }
}

/// Renders one base64 PNG for every prediction strictly above `threshold`.
pub fn render_saliency(
    classifier: &dyn Classifier,
    image: &NormalizedImage,
    predictions: &PredictionMap,
    threshold: f64,
) -> Result<SaliencyMap, InferenceError> {
    let mut saliency = SaliencyMap::new();

    for (label, _) in predictions.iter().filter(|(_, score)| **score > threshold) {
        let label_index = classifier
            .pathologies()
            .iter()
            .position(|p| p == label)
            .ok_or_else(|| {
                InferenceError::Model(format!("{} is not in the classifier vocabulary", label))
            })?;

        let (score, gradient) = classifier.score_and_gradient(image, label_index)?;
        let heatmap = saliency_heatmap(gradient.view())?;
        let canvas = SaliencyCanvas::render(heatmap.view(), &SALIENCY_COLORMAP)?;
        saliency.insert(label, canvas.to_base64_png()?);
        log::debug!("Rendered saliency for {} (score {:.4})", label, score);
    }

    Ok(saliency)
}
