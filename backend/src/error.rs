use shared::status;

/// Failures raised while handling one inference request.
///
/// Only `Decode` is the caller's fault; everything else is reported as an
/// internal failure with the error's own message.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("{0}")]
    Decode(#[from] base64::DecodeError),
    #[error("{0}")]
    Request(#[from] serde_json::Error),
    #[error("{0}")]
    Image(#[from] image::ImageError),
    #[error("{0}")]
    Preprocessing(String),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Model(String),
    #[error("{0}")]
    Torch(#[from] tch::TchError),
    #[error("{0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("{0}")]
    Render(String),
    #[error("{0}")]
    Panic(String),
}

impl InferenceError {
    pub fn status_code(&self) -> u16 {
        match self {
            InferenceError::Decode(_) => status::BAD_REQUEST,
            _ => status::INTERNAL_SERVER_ERROR,
        }
    }
}
