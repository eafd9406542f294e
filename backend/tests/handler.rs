use backend::InferenceError;
use backend::handle_with;
use backend::inference::preprocess::IMAGE_SIZE;
use backend::inference::saliency::RENDER_SIZE;
use backend::inference::{Autoencoder, Classifier, ModelProvider, NormalizedImage};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use ndarray::{Array2, Array4};
use rstest::rstest;
use serde_json::{Value, json};
use shared::{InferenceBody, InferenceResponse};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Copy)]
enum Reconstruction {
    Identity,
    Offset(f32),
    Checkerboard(f32),
    Constant(f32),
}

struct MockAutoencoder {
    mode: Reconstruction,
}

impl Autoencoder for MockAutoencoder {
    fn reconstruct(&self, image: &NormalizedImage) -> Result<Array4<f32>, InferenceError> {
        let tensor = image.tensor();
        Ok(match self.mode {
            Reconstruction::Identity => tensor.clone(),
            Reconstruction::Offset(offset) => tensor.mapv(|v| v + offset),
            Reconstruction::Checkerboard(amplitude) => {
                let mut out = tensor.clone();
                out.indexed_iter_mut().for_each(|((_, _, r, c), v)| {
                    *v += if (r + c) % 2 == 0 { amplitude } else { -amplitude };
                });
                out
            }
            Reconstruction::Constant(value) => tensor.mapv(|_| value),
        })
    }
}

struct MockClassifier {
    pathologies: Vec<String>,
    scores: Vec<f32>,
    predict_calls: AtomicUsize,
    gradient_calls: AtomicUsize,
    panic_on_predict: bool,
}

impl MockClassifier {
    fn new(entries: &[(&str, f32)]) -> Self {
        Self {
            pathologies: entries.iter().map(|(l, _)| l.to_string()).collect(),
            scores: entries.iter().map(|(_, s)| *s).collect(),
            predict_calls: AtomicUsize::new(0),
            gradient_calls: AtomicUsize::new(0),
            panic_on_predict: false,
        }
    }
}

impl Classifier for MockClassifier {
    fn pathologies(&self) -> &[String] {
        &self.pathologies
    }

    fn predict(&self, _image: &NormalizedImage) -> Result<Vec<f32>, InferenceError> {
        self.predict_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_predict {
            panic!("classifier exploded");
        }
        Ok(self.scores.clone())
    }

    fn score_and_gradient(
        &self,
        _image: &NormalizedImage,
        label_index: usize,
    ) -> Result<(f32, Array2<f32>), InferenceError> {
        self.gradient_calls.fetch_add(1, Ordering::SeqCst);
        let centre = 40 + label_index * 10;
        let gradient = Array2::from_shape_fn((IMAGE_SIZE, IMAGE_SIZE), |(r, c)| {
            if r == centre && c == centre { 2.0 } else { 0.0 }
        });
        Ok((self.scores[label_index], gradient))
    }
}

struct MockModels {
    autoencoder: Arc<MockAutoencoder>,
    classifier: Arc<MockClassifier>,
    autoencoder_failure: Option<String>,
    classifier_loads: AtomicUsize,
}

impl MockModels {
    fn new(mode: Reconstruction, classifier: MockClassifier) -> Self {
        Self {
            autoencoder: Arc::new(MockAutoencoder { mode }),
            classifier: Arc::new(classifier),
            autoencoder_failure: None,
            classifier_loads: AtomicUsize::new(0),
        }
    }
}

impl ModelProvider for MockModels {
    fn autoencoder(&self) -> Result<Arc<dyn Autoencoder>, InferenceError> {
        match &self.autoencoder_failure {
            Some(message) => Err(InferenceError::Model(message.clone())),
            None => Ok(self.autoencoder.clone()),
        }
    }

    fn classifier(&self) -> Result<Arc<dyn Classifier>, InferenceError> {
        self.classifier_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.classifier.clone())
    }
}

const VOCABULARY: [(&str, f32); 4] = [
    ("Atelectasis", 0.25),
    ("Effusion", 0.75),
    ("Mass", 0.5),
    ("Nodule", 0.5625),
];

fn ramp_png() -> String {
    let image = GrayImage::from_fn(256, 256, |x, _| Luma([x as u8]));
    let mut png = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(image)
        .write_to(&mut png, ImageFormat::Png)
        .unwrap();
    STANDARD.encode(png.into_inner())
}

fn event(base64_img: &str, grad_cam_threshold: f64) -> Value {
    json!({
        "base64Img": base64_img,
        "reconstructionThreshold": 8000,
        "ssimThreshold": 0.62,
        "gradCamThreshold": grad_cam_threshold,
    })
}

fn body(response: &InferenceResponse) -> Value {
    response.parse_body().unwrap()
}

fn only_error(response: &InferenceResponse) -> String {
    let body = body(response);
    let object = body.as_object().unwrap();
    assert_eq!(object.len(), 1, "unexpected fields in {}", body);
    object["Error"].as_str().unwrap().to_string()
}

#[test]
fn invalid_base64_is_a_client_error() {
    let models = MockModels::new(Reconstruction::Identity, MockClassifier::new(&VOCABULARY));
    let response = handle_with(&event("this is *not* base64", 0.5), &models);

    assert_eq!(response.status_code, 400);
    assert_eq!(response.headers["Content-Type"], "application/json");
    assert!(!only_error(&response).is_empty());
    assert_eq!(models.classifier_loads.load(Ordering::SeqCst), 0);
}

#[rstest]
#[case::reconstruction_error(Reconstruction::Offset(100.0))]
#[case::structural_similarity(Reconstruction::Checkerboard(80.0))]
fn out_of_distribution_stops_before_classification(#[case] mode: Reconstruction) {
    let models = MockModels::new(mode, MockClassifier::new(&VOCABULARY));
    let response = handle_with(&event(&ramp_png(), 0.5), &models);

    assert_eq!(response.status_code, 200);
    let body = body(&response);
    assert_eq!(body["inDistribution"], json!(false));
    assert!(body["prediction"].is_null());
    assert!(body["gradCam"].is_null());
    assert!(
        body["reconstructionError"].as_f64().unwrap() > 8000.0
            || body["ssim"].as_f64().unwrap() < 0.62
    );
    assert_eq!(models.classifier_loads.load(Ordering::SeqCst), 0);
    assert_eq!(models.classifier.predict_calls.load(Ordering::SeqCst), 0);
    assert_eq!(models.classifier.gradient_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn checkerboard_fails_on_ssim_alone() {
    let models = MockModels::new(
        Reconstruction::Checkerboard(80.0),
        MockClassifier::new(&VOCABULARY),
    );
    let response = handle_with(&event(&ramp_png(), 0.5), &models);
    let body = body(&response);
    assert!((body["reconstructionError"].as_f64().unwrap() - 6400.0).abs() < 0.5);
    assert!(body["ssim"].as_f64().unwrap() < 0.62);
}

#[test]
fn in_distribution_predicts_the_full_vocabulary() {
    let models = MockModels::new(Reconstruction::Identity, MockClassifier::new(&VOCABULARY));
    let response = handle_with(&event(&ramp_png(), 0.9), &models);

    assert_eq!(response.status_code, 200);
    let body = body(&response);
    assert_eq!(body["inDistribution"], json!(true));
    assert_eq!(body["reconstructionError"], json!(0.0));

    let prediction = body["prediction"].as_object().unwrap();
    let mut labels: Vec<&str> = prediction.keys().map(String::as_str).collect();
    labels.sort_unstable();
    assert_eq!(labels, vec!["Atelectasis", "Effusion", "Mass", "Nodule"]);
    assert!(
        prediction
            .values()
            .all(|v| v.as_f64().is_some_and(f64::is_finite))
    );
    assert_eq!(body["gradCam"], json!({}));
}

#[rstest]
#[case(0.5, &["Effusion", "Nodule"])]
#[case(0.25, &["Effusion", "Mass", "Nodule"])]
#[case(0.75, &[])]
#[case(0.0, &["Atelectasis", "Effusion", "Mass", "Nodule"])]
fn saliency_covers_scores_strictly_above_threshold(
    #[case] threshold: f64,
    #[case] expected: &[&str],
) {
    let models = MockModels::new(Reconstruction::Identity, MockClassifier::new(&VOCABULARY));
    let response = handle_with(&event(&ramp_png(), threshold), &models);

    let body: InferenceBody = response.parse_body().unwrap();
    let InferenceBody::InDistribution { grad_cam, .. } = body else {
        panic!("expected an in-distribution body");
    };
    assert_eq!(grad_cam.labels().collect::<Vec<_>>(), expected);
    assert_eq!(
        models.classifier.gradient_calls.load(Ordering::SeqCst),
        expected.len()
    );
}

#[test]
fn saliency_images_are_pngs_of_render_size() {
    let models = MockModels::new(Reconstruction::Identity, MockClassifier::new(&VOCABULARY));
    let response = handle_with(&event(&ramp_png(), 0.5), &models);

    let body: InferenceBody = response.parse_body().unwrap();
    let InferenceBody::InDistribution { grad_cam, .. } = body else {
        panic!("expected an in-distribution body");
    };
    assert_eq!(grad_cam.len(), 2);
    for (_, encoded) in grad_cam.iter() {
        let bytes = STANDARD.decode(encoded).unwrap();
        assert!(bytes.starts_with(b"\x89PNG\r\n\x1a\n"));
        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (RENDER_SIZE, RENDER_SIZE));
    }
}

#[test]
fn body_round_trips_through_wire_types() {
    let models = MockModels::new(Reconstruction::Identity, MockClassifier::new(&VOCABULARY));
    let response = handle_with(&event(&ramp_png(), 0.5), &models);

    let parsed: InferenceBody = response.parse_body().unwrap();
    let reencoded = serde_json::to_value(&parsed).unwrap();
    assert_eq!(reencoded, body(&response));
    assert_eq!(serde_json::to_string(&parsed).unwrap(), response.body);
}

#[test]
fn undefined_ssim_is_null_and_parses_back() {
    // flat input against a flat reconstruction: every SSIM window is 0/0
    let black = GrayImage::from_pixel(64, 64, Luma([0]));
    let mut png = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(black)
        .write_to(&mut png, ImageFormat::Png)
        .unwrap();
    let models = MockModels::new(
        Reconstruction::Constant(0.0),
        MockClassifier::new(&VOCABULARY),
    );
    let response = handle_with(&event(&STANDARD.encode(png.into_inner()), 0.5), &models);

    assert_eq!(response.status_code, 200);
    assert!(body(&response)["ssim"].is_null());
    let parsed: InferenceBody = response.parse_body().unwrap();
    let InferenceBody::OutOfDistribution {
        ssim,
        in_distribution,
        ..
    } = parsed
    else {
        panic!("expected an out-of-distribution body");
    };
    assert!(ssim.is_nan());
    assert!(!in_distribution);
    assert_eq!(models.classifier_loads.load(Ordering::SeqCst), 0);
}

#[test]
fn model_load_failure_is_reported_verbatim() {
    let mut models = MockModels::new(Reconstruction::Identity, MockClassifier::new(&VOCABULARY));
    models.autoencoder_failure = Some("weights 101-elastic are unavailable".to_string());
    let response = handle_with(&event(&ramp_png(), 0.5), &models);

    assert_eq!(response.status_code, 500);
    assert_eq!(only_error(&response), "weights 101-elastic are unavailable");
}

#[test]
fn panics_inside_models_become_server_errors() {
    let mut classifier = MockClassifier::new(&VOCABULARY);
    classifier.panic_on_predict = true;
    let models = MockModels::new(Reconstruction::Identity, classifier);
    let response = handle_with(&event(&ramp_png(), 0.5), &models);

    assert_eq!(response.status_code, 500);
    assert_eq!(only_error(&response), "classifier exploded");
}

#[test]
fn undecodable_image_is_a_server_error() {
    let models = MockModels::new(Reconstruction::Identity, MockClassifier::new(&VOCABULARY));
    let response = handle_with(&event(&STANDARD.encode(b"plain text"), 0.5), &models);

    assert_eq!(response.status_code, 500);
    assert!(!only_error(&response).is_empty());
}

#[test]
fn missing_fields_are_server_errors() {
    let models = MockModels::new(Reconstruction::Identity, MockClassifier::new(&VOCABULARY));
    let response = handle_with(&json!({ "base64Img": ramp_png() }), &models);

    assert_eq!(response.status_code, 500);
    assert!(only_error(&response).contains("reconstructionThreshold"));
}

#[test]
fn score_count_mismatch_is_a_server_error() {
    let mut classifier = MockClassifier::new(&VOCABULARY);
    classifier.scores.pop();
    let models = MockModels::new(Reconstruction::Identity, classifier);
    let response = handle_with(&event(&ramp_png(), 0.5), &models);

    assert_eq!(response.status_code, 500);
    assert_eq!(
        only_error(&response),
        "classifier returned 3 scores for 4 pathologies"
    );
}
