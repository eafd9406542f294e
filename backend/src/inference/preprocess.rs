use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageBuffer, Luma};
use ndarray::{Array4, ArrayView2, s};
use sha2::{Digest, Sha256};

use crate::error::InferenceError;

/// Side length the pretrained models were trained on.
pub const IMAGE_SIZE: usize = 224;

/// Largest accepted sample value (8-bit input).
pub const MAX_SAMPLE_VALUE: f32 = 255.0;

/// Normalized intensities span `[-MAX_INTENSITY, MAX_INTENSITY]`.
pub const MAX_INTENSITY: f32 = 1024.0;

/// Single-channel image tensor of shape `(1, 1, IMAGE_SIZE, IMAGE_SIZE)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    tensor: Array4<f32>,
}

impl NormalizedImage {
    pub fn from_tensor(tensor: Array4<f32>) -> Result<Self, InferenceError> {
        if tensor.dim() != (1, 1, IMAGE_SIZE, IMAGE_SIZE) {
            return Err(InferenceError::Preprocessing(format!(
                "expected image tensor of shape [1, 1, {size}, {size}], got {:?}",
                tensor.shape(),
                size = IMAGE_SIZE
            )));
        }
        Ok(Self { tensor })
    }

    pub fn tensor(&self) -> &Array4<f32> {
        &self.tensor
    }

    pub fn plane(&self) -> ArrayView2<'_, f32> {
        self.tensor.slice(s![0, 0, .., ..])
    }
}

/// First channel of the first batch element of an NCHW tensor.
pub fn first_plane(tensor: &Array4<f32>) -> Result<ArrayView2<'_, f32>, InferenceError> {
    let (batch, channels, _, _) = tensor.dim();
    if batch == 0 || channels == 0 {
        return Err(InferenceError::Preprocessing(format!(
            "tensor of shape {:?} has no image plane",
            tensor.shape()
        )));
    }
    Ok(tensor.slice(s![0, 0, .., ..]))
}

/// Decodes the request payload. ASCII whitespace (line wrapping) is ignored.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, InferenceError> {
    let compact: Vec<u8> = encoded
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    Ok(STANDARD.decode(compact)?)
}

pub fn image_digest(image_data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_data);
    hex::encode(hasher.finalize())
}

/// Parses raster bytes and produces the model input: channel mean, intensity
/// normalization, center crop to a square, resize to `IMAGE_SIZE`.
pub fn load_image(image_data: &[u8]) -> Result<NormalizedImage, InferenceError> {
    let image = image::load_from_memory(image_data)?;
    let (width, height) = image.dimensions();
    let gray = channel_mean(&image)?;

    // Resampling works on [0, 1]; the image crate clamps float samples there.
    let unit: Vec<f32> = gray.into_iter().map(|v| v / MAX_SAMPLE_VALUE).collect();
    let buffer = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(width, height, unit).ok_or_else(
        || InferenceError::Preprocessing(format!("cannot build a {}x{} buffer", width, height)),
    )?;

    let side = width.min(height);
    if side == 0 {
        return Err(InferenceError::Preprocessing(format!(
            "image of {}x{} pixels is empty",
            width, height
        )));
    }
    let x = width / 2 - side / 2;
    let y = height / 2 - side / 2;
    let cropped = imageops::crop_imm(&buffer, x, y, side, side).to_image();
    let resized = imageops::resize(
        &cropped,
        IMAGE_SIZE as u32,
        IMAGE_SIZE as u32,
        FilterType::Triangle,
    );

    let values: Vec<f32> = resized
        .into_raw()
        .into_iter()
        .map(|v| (2.0 * v - 1.0) * MAX_INTENSITY)
        .collect();
    let tensor = Array4::from_shape_vec((1, 1, IMAGE_SIZE, IMAGE_SIZE), values)?;
    NormalizedImage::from_tensor(tensor)
}

/// Averages every decoded channel (alpha included) into one plane, keeping
/// the decoder's native sample values.
fn channel_mean(image: &DynamicImage) -> Result<Vec<f32>, InferenceError> {
    let color = image.color();
    let channels = usize::from(color.channel_count());
    let sample_width = usize::from(color.bytes_per_pixel()) / channels.max(1);
    let raw = image.as_bytes();

    let samples: Vec<f32> = match sample_width {
        1 => raw.iter().map(|&v| f32::from(v)).collect(),
        2 => raw
            .chunks_exact(2)
            .map(|c| f32::from(u16::from_ne_bytes([c[0], c[1]])))
            .collect(),
        4 => raw
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        other => {
            return Err(InferenceError::Preprocessing(format!(
                "unsupported sample width of {} bytes",
                other
            )));
        }
    };

    let max = samples.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max > MAX_SAMPLE_VALUE {
        return Err(InferenceError::Preprocessing(format!(
            "max value of image ({}) larger than maxval ({})",
            max, MAX_SAMPLE_VALUE
        )));
    }

    Ok(samples
        .chunks_exact(channels)
        .map(|pixel| pixel.iter().sum::<f32>() / channels as f32)
        .collect())
}
