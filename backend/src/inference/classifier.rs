use shared::LabelMap;

use super::models::Classifier;
use super::preprocess::NormalizedImage;
use crate::error::InferenceError;

/// Pathology label -> score, in the classifier's output order.
pub type PredictionMap = LabelMap<f64>;

pub fn classify(
    classifier: &dyn Classifier,
    image: &NormalizedImage,
) -> Result<PredictionMap, InferenceError> {
    let scores = classifier.predict(image)?;
    let pathologies = classifier.pathologies();
    if scores.len() != pathologies.len() {
        return Err(InferenceError::Model(format!(
            "classifier returned {} scores for {} pathologies",
            scores.len(),
            pathologies.len()
        )));
    }

    Ok(pathologies
        .iter()
        .cloned()
        .zip(scores.into_iter().map(f64::from))
        .collect())
}
