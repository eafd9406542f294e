use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "config/handler.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(default = "default_version")]
    pub version: f32,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_model_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_autoencoder")]
    pub autoencoder: String,
    #[serde(default = "default_classifier")]
    pub classifier: String,
    /// Output vocabulary of the classifier, in output order. Needed only for
    /// weights the crate does not already know.
    #[serde(default)]
    pub pathologies: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_use_cuda")]
    pub use_cuda: bool,
}

fn default_version() -> f32 {
    1.0
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_autoencoder() -> String {
    "101-elastic".to_string()
}

fn default_classifier() -> String {
    "densenet121-res224-all".to_string()
}

fn default_use_cuda() -> bool {
    true
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: default_model_dir(),
            autoencoder: default_autoencoder(),
            classifier: default_classifier(),
            pathologies: None,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            use_cuda: default_use_cuda(),
        }
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            models: ModelsConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl HandlerConfig {
    /// Reads `.env`, then the YAML file named by `HANDLER_CONFIG` (or
    /// `config/handler.yaml`), then applies `MODEL_DIR` / `USE_CUDA`.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::load_with(|name| std::env::var(name).ok())
    }

    /// Same as [`HandlerConfig::load`] with `lookup` standing in for the
    /// process environment.
    pub fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = lookup("HANDLER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            Self::from_path(&path)?
        } else {
            log::info!(
                "No handler config at {}, using built-in defaults",
                path.display()
            );
            Self::default()
        };
        config.apply_env_overrides(lookup)?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HandlerConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("MODEL_DIR") {
            self.models.dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("USE_CUDA") {
            self.device.use_cuda = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        name: "USE_CUDA",
                        value,
                    });
                }
            };
        }
        Ok(())
    }

    /// TorchScript export for the named weights.
    pub fn weights_path(&self, weights: &str) -> PathBuf {
        self.models.dir.join(format!("{}.pt", weights))
    }
}
