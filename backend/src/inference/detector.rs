use super::metrics::{mean_squared_error, structural_similarity, value_range};
use super::models::Autoencoder;
use super::preprocess::{NormalizedImage, first_plane};
use crate::error::InferenceError;

/// Largest reconstruction error still considered in-distribution.
pub const RECONSTRUCTION_THRESHOLD: f64 = 8000.0;
/// Smallest SSIM still considered in-distribution.
pub const SSIM_THRESHOLD: f64 = 0.62;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionResult {
    pub reconstruction_error: f64,
    pub ssim: f64,
    pub in_distribution: bool,
}

impl DetectionResult {
    pub fn from_metrics(reconstruction_error: f64, ssim: f64) -> Self {
        Self {
            reconstruction_error,
            ssim,
            in_distribution: reconstruction_error <= RECONSTRUCTION_THRESHOLD
                && ssim >= SSIM_THRESHOLD,
        }
    }
}

/// Reconstructs `image` and compares it with the reconstruction. SSIM uses
/// the reconstruction's value range.
pub fn detect(
    autoencoder: &dyn Autoencoder,
    image: &NormalizedImage,
) -> Result<DetectionResult, InferenceError> {
    let reconstruction = autoencoder.reconstruct(image)?;
    let input = image.plane();
    let output = first_plane(&reconstruction)?;

    let reconstruction_error = mean_squared_error(input, output)?;
    let ssim = structural_similarity(input, output, value_range(output))?;
    Ok(DetectionResult::from_metrics(reconstruction_error, ssim))
}
