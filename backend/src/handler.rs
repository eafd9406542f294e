use log::{debug, error, info, warn};
use serde::Deserialize;
use shared::{InferenceBody, InferenceRequest, InferenceResponse, status};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use uuid::Uuid;

use crate::error::InferenceError;
use crate::inference::detector::{self, RECONSTRUCTION_THRESHOLD, SSIM_THRESHOLD};
use crate::inference::torch::TorchModelProvider;
use crate::inference::{
    DetectionResult, ModelProvider, PredictionMap, SaliencyMap, classifier, preprocess, saliency,
};

/// Result of a successful run through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    OutOfDistribution(DetectionResult),
    InDistribution {
        detection: DetectionResult,
        prediction: PredictionMap,
        saliency: SaliencyMap,
    },
}

impl Outcome {
    pub fn into_body(self) -> InferenceBody {
        match self {
            Outcome::OutOfDistribution(detection) => InferenceBody::OutOfDistribution {
                reconstruction_error: detection.reconstruction_error,
                ssim: detection.ssim,
                in_distribution: false,
                prediction: (),
                grad_cam: (),
            },
            Outcome::InDistribution {
                detection,
                prediction,
                saliency,
            } => InferenceBody::InDistribution {
                reconstruction_error: detection.reconstruction_error,
                ssim: detection.ssim,
                in_distribution: true,
                prediction,
                grad_cam: saliency,
            },
        }
    }
}

/// Handles one event with the process-wide libtorch models.
pub fn handle(event: &serde_json::Value) -> InferenceResponse {
    match TorchModelProvider::global() {
        Ok(models) => handle_with(event, models),
        Err(e) => {
            error!("Handler is not configured: {}", e);
            InferenceResponse::error(e.status_code(), e.to_string())
        }
    }
}

/// Handles one event. Every failure, panics included, becomes an error
/// envelope; only malformed base64 is reported as the caller's fault.
pub fn handle_with(event: &serde_json::Value, models: &dyn ModelProvider) -> InferenceResponse {
    let request_id = Uuid::new_v4();

    let result = panic::catch_unwind(AssertUnwindSafe(|| run_pipeline(event, models, request_id)))
        .unwrap_or_else(|payload| Err(InferenceError::Panic(panic_message(payload))))
        .and_then(|outcome| Ok(InferenceResponse::from_body(status::OK, &outcome.into_body())?));

    match result {
        Ok(response) => response,
        Err(e) => {
            error!("[{}] Inference failed: {}", request_id, e);
            InferenceResponse::error(e.status_code(), e.to_string())
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "inference panicked".to_string()
    }
}

fn warn_on_ignored_thresholds(request: &InferenceRequest, request_id: Uuid) {
    if request.reconstruction_threshold != RECONSTRUCTION_THRESHOLD
        || request.ssim_threshold != SSIM_THRESHOLD
    {
        warn!(
            "[{}] Ignoring requested thresholds (reconstruction {}, ssim {}); using fixed {} / {}",
            request_id,
            request.reconstruction_threshold,
            request.ssim_threshold,
            RECONSTRUCTION_THRESHOLD,
            SSIM_THRESHOLD
        );
    }
}

pub fn run_pipeline(
    event: &serde_json::Value,
    models: &dyn ModelProvider,
    request_id: Uuid,
) -> Result<Outcome, InferenceError> {
    let request = InferenceRequest::deserialize(event)?;

    let image_data = preprocess::decode_base64(&request.base64_img)?;
    info!(
        "[{}] Received image: {} bytes, sha256 {}",
        request_id,
        image_data.len(),
        preprocess::image_digest(&image_data)
    );
    let image = preprocess::load_image(&image_data)?;
    warn_on_ignored_thresholds(&request, request_id);

    let autoencoder = models.autoencoder()?;
    let detection = detector::detect(autoencoder.as_ref(), &image)?;
    debug!(
        "[{}] Reconstruction error {:.2}, SSIM {:.4}",
        request_id, detection.reconstruction_error, detection.ssim
    );
    if !detection.in_distribution {
        info!("[{}] Image is out of distribution", request_id);
        return Ok(Outcome::OutOfDistribution(detection));
    }

    let classifier = models.classifier()?;
    let prediction = classifier::classify(classifier.as_ref(), &image)?;
    let saliency = saliency::render_saliency(
        classifier.as_ref(),
        &image,
        &prediction,
        request.grad_cam_threshold,
    )?;
    info!(
        "[{}] Classified {} pathologies, {} above {}",
        request_id,
        prediction.len(),
        saliency.len(),
        request.grad_cam_threshold
    );

    Ok(Outcome::InDistribution {
        detection,
        prediction,
        saliency,
    })
}
