use ndarray::{Array2, Array4};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tch::{CModule, Device, IValue, Kind, Tensor};

use super::models::{Autoencoder, Classifier, ModelProvider};
use super::preprocess::NormalizedImage;
use crate::config::{ConfigError, HandlerConfig};
use crate::error::InferenceError;

/// Output order of the `densenet121-res224-all` classifier.
pub const DENSENET121_RES224_ALL: [&str; 18] = [
    "Atelectasis",
    "Consolidation",
    "Infiltration",
    "Pneumothorax",
    "Edema",
    "Emphysema",
    "Fibrosis",
    "Effusion",
    "Pneumonia",
    "Pleural_Thickening",
    "Cardiomegaly",
    "Nodule",
    "Mass",
    "Hernia",
    "Lung Lesion",
    "Fracture",
    "Lung Opacity",
    "Enlarged Cardiomediastinum",
];

pub fn known_pathologies(weights: &str) -> Option<&'static [&'static str]> {
    match weights {
        "densenet121-res224-all" => Some(&DENSENET121_RES224_ALL),
        _ => None,
    }
}

/// TorchScript module; `CModule` is not `Sync`, so calls are serialized.
struct TorchModule {
    module: Mutex<CModule>,
    device: Device,
}

impl TorchModule {
    fn load(path: &Path, device: Device) -> Result<Self, InferenceError> {
        log::info!("Loading TorchScript model from {} on {:?}", path.display(), device);
        let mut module = CModule::load_on_device(path, device).map_err(|e| {
            InferenceError::Model(format!("failed to load model {}: {}", path.display(), e))
        })?;
        module.set_eval();
        Ok(Self {
            module: Mutex::new(module),
            device,
        })
    }

    fn lock(&self) -> MutexGuard<'_, CModule> {
        lock_recovering(&self.module)
    }

    fn input(&self, image: &NormalizedImage) -> Result<Tensor, InferenceError> {
        let tensor = image.tensor();
        let shape: Vec<i64> = tensor.shape().iter().map(|&d| d as i64).collect();
        let values: Vec<f32> = tensor.iter().copied().collect();
        Ok(Tensor::from_slice(&values)
            .f_view(shape.as_slice())?
            .to_device(self.device))
    }
}

/// A panic during a forward pass poisons the lock but leaves the module
/// itself intact, so later requests keep using it.
fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("Reusing a model whose lock was poisoned by an earlier panic");
        poisoned.into_inner()
    })
}

fn to_vec(tensor: &Tensor) -> Result<Vec<f32>, InferenceError> {
    let flat = tensor
        .f_to_kind(Kind::Float)?
        .to_device(Device::Cpu)
        .f_flatten(0, -1)?;
    Ok(Vec::<f32>::try_from(flat)?)
}

fn usize_dims(size: &[i64]) -> Vec<usize> {
    size.iter().map(|&d| d.max(0) as usize).collect()
}

pub struct TorchAutoencoder {
    module: TorchModule,
}

impl TorchAutoencoder {
    pub fn load(path: &Path, device: Device) -> Result<Self, InferenceError> {
        Ok(Self {
            module: TorchModule::load(path, device)?,
        })
    }
}

/// Scripted autoencoders return either the reconstruction itself or a dict
/// holding it under `out`.
fn reconstruction_tensor(output: IValue) -> Result<Tensor, InferenceError> {
    match output {
        IValue::Tensor(tensor) => Ok(tensor),
        IValue::GenericDict(entries) => entries
            .into_iter()
            .find_map(|(key, value)| match (key, value) {
                (IValue::String(key), IValue::Tensor(tensor)) if key == "out" => Some(tensor),
                _ => None,
            })
            .ok_or_else(|| InferenceError::Model("autoencoder output has no `out` tensor".into())),
        other => Err(InferenceError::Model(format!(
            "unexpected autoencoder output: {:?}",
            other
        ))),
    }
}

impl Autoencoder for TorchAutoencoder {
    fn reconstruct(&self, image: &NormalizedImage) -> Result<Array4<f32>, InferenceError> {
        let input = self.module.input(image)?;
        let output = tch::no_grad(|| -> Result<IValue, InferenceError> {
            Ok(self.module.lock().forward_is(&[IValue::Tensor(input)])?)
        })?;
        let reconstruction = reconstruction_tensor(output)?;

        let dims = usize_dims(&reconstruction.size());
        let [n, c, h, w] = dims[..] else {
            return Err(InferenceError::Model(format!(
                "expected a 4-d reconstruction, got shape {:?}",
                dims
            )));
        };
        Ok(Array4::from_shape_vec((n, c, h, w), to_vec(&reconstruction)?)?)
    }
}

pub struct TorchClassifier {
    module: TorchModule,
    pathologies: Vec<String>,
}

impl TorchClassifier {
    pub fn load(path: &Path, device: Device, pathologies: Vec<String>) -> Result<Self, InferenceError> {
        Ok(Self {
            module: TorchModule::load(path, device)?,
            pathologies,
        })
    }
}

impl Classifier for TorchClassifier {
    fn pathologies(&self) -> &[String] {
        &self.pathologies
    }

    fn predict(&self, image: &NormalizedImage) -> Result<Vec<f32>, InferenceError> {
        let input = self.module.input(image)?;
        let output = tch::no_grad(|| -> Result<Tensor, InferenceError> {
            Ok(self.module.lock().forward_ts(&[input])?)
        })?;
        to_vec(&output)
    }

    fn score_and_gradient(
        &self,
        image: &NormalizedImage,
        label_index: usize,
    ) -> Result<(f32, Array2<f32>), InferenceError> {
        let input = self.module.input(image)?.set_requires_grad(true);
        let outputs = self.module.lock().forward_ts(&[&input])?;
        let score = outputs
            .f_select(1, label_index as i64)?
            .f_sum(Kind::Float)?;

        let gradient = Tensor::f_run_backward(&[&score], &[&input], false, false)?
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::Model("no gradient for the input image".into()))?;
        let plane = gradient.f_select(0, 0)?.f_select(0, 0)?;

        let dims = usize_dims(&plane.size());
        let [h, w] = dims[..] else {
            return Err(InferenceError::Model(format!(
                "expected a 2-d gradient plane, got shape {:?}",
                dims
            )));
        };
        let gradient = Array2::from_shape_vec((h, w), to_vec(&plane)?)?;
        Ok((score.f_double_value(&[])? as f32, gradient))
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_MODELS: Result<TorchModelProvider, ConfigError> =
        HandlerConfig::load().map(TorchModelProvider::new);
}

/// Loads each model on first use and keeps it for the life of the process.
/// A failed load is not cached; the next request tries again.
pub struct TorchModelProvider {
    config: HandlerConfig,
    device: Device,
    autoencoder: OnceLock<Arc<TorchAutoencoder>>,
    classifier: OnceLock<Arc<TorchClassifier>>,
}

fn get_or_load<T, F>(cell: &OnceLock<Arc<T>>, load: F) -> Result<Arc<T>, InferenceError>
where
    F: FnOnce() -> Result<T, InferenceError>,
{
    if let Some(model) = cell.get() {
        return Ok(model.clone());
    }
    let model = Arc::new(load()?);
    Ok(cell.get_or_init(|| model).clone())
}

impl TorchModelProvider {
    pub fn new(config: HandlerConfig) -> Self {
        let device = if config.device.use_cuda {
            Device::cuda_if_available()
        } else {
            Device::Cpu
        };
        Self {
            config,
            device,
            autoencoder: OnceLock::new(),
            classifier: OnceLock::new(),
        }
    }

    /// Configures a provider from `lookup` (see [`HandlerConfig::load_with`]).
    pub fn from_env_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self::new(HandlerConfig::load_with(lookup)?))
    }

    /// Process-wide provider configured from `HandlerConfig::load`. A bad
    /// configuration is reported on every call, never replaced by defaults.
    pub fn global() -> Result<&'static TorchModelProvider, InferenceError> {
        GLOBAL_MODELS
            .as_ref()
            .map_err(|e| InferenceError::Config(e.to_string()))
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn preload(&self) -> Result<(), InferenceError> {
        self.autoencoder()?;
        self.classifier()?;
        Ok(())
    }

    fn pathologies(&self) -> Result<Vec<String>, InferenceError> {
        if let Some(pathologies) = &self.config.models.pathologies {
            return Ok(pathologies.clone());
        }
        let weights = &self.config.models.classifier;
        known_pathologies(weights)
            .map(|labels| labels.iter().map(|l| l.to_string()).collect())
            .ok_or_else(|| {
                InferenceError::Model(format!(
                    "no pathology list known for classifier weights {}",
                    weights
                ))
            })
    }
}

impl ModelProvider for TorchModelProvider {
    fn autoencoder(&self) -> Result<Arc<dyn Autoencoder>, InferenceError> {
        let model: Arc<dyn Autoencoder> = get_or_load(&self.autoencoder, || {
            let path = self.config.weights_path(&self.config.models.autoencoder);
            TorchAutoencoder::load(&path, self.device)
        })?;
        Ok(model)
    }

    fn classifier(&self) -> Result<Arc<dyn Classifier>, InferenceError> {
        let model: Arc<dyn Classifier> = get_or_load(&self.classifier, || {
            let path = self.config.weights_path(&self.config.models.classifier);
            TorchClassifier::load(&path, self.device, self.pathologies()?)
        })?;
        Ok(model)
    }
}
