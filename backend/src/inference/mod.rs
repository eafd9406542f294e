//! Chest X-ray pipeline: load, detect out-of-distribution inputs, classify,
//! render saliency. Model access goes through the traits in [`models`]; the
//! libtorch implementations live in [`torch`].

pub mod classifier;
pub mod colormap;
pub mod detector;
pub mod metrics;
pub mod models;
pub mod preprocess;
pub mod saliency;
pub mod torch;

pub use classifier::PredictionMap;
pub use detector::DetectionResult;
pub use models::{Autoencoder, Classifier, ModelProvider};
pub use preprocess::NormalizedImage;
pub use saliency::SaliencyMap;
