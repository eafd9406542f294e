use ndarray::{Array2, Array4};
use std::sync::Arc;

use super::preprocess::NormalizedImage;
use crate::error::InferenceError;

/// Pretrained autoencoder used to judge whether an image looks like the
/// training distribution.
pub trait Autoencoder: Send + Sync {
    /// Reconstruction of `image`, NCHW.
    fn reconstruct(&self, image: &NormalizedImage) -> Result<Array4<f32>, InferenceError>;
}

/// Pretrained multi-label pathology classifier.
pub trait Classifier: Send + Sync {
    /// Output vocabulary, in output order.
    fn pathologies(&self) -> &[String];

    /// One score per entry of [`Classifier::pathologies`].
    fn predict(&self, image: &NormalizedImage) -> Result<Vec<f32>, InferenceError>;

    /// Score of one output together with its gradient with respect to the
    /// input plane (`IMAGE_SIZE x IMAGE_SIZE`).
    fn score_and_gradient(
        &self,
        image: &NormalizedImage,
        label_index: usize,
    ) -> Result<(f32, Array2<f32>), InferenceError>;
}

/// Source of loaded models. Implementations may load lazily and cache; the
/// classifier is only requested for in-distribution images.
pub trait ModelProvider: Send + Sync {
    fn autoencoder(&self) -> Result<Arc<dyn Autoencoder>, InferenceError>;
    fn classifier(&self) -> Result<Arc<dyn Classifier>, InferenceError>;
}
