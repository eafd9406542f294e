use image::{ImageBuffer, Luma};
use imageproc::filter::separable_filter_equal;
use ndarray::{Array2, ArrayView2, Zip};

use crate::error::InferenceError;

/// Side of the uniform SSIM window.
pub const SSIM_WINDOW: usize = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;

type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

fn check_same_shape(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Result<(), InferenceError> {
    if a.shape() != b.shape() {
        return Err(InferenceError::Preprocessing(format!(
            "image shapes differ: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(())
}

pub fn mean_squared_error(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Result<f64, InferenceError> {
    check_same_shape(&a, &b)?;
    if a.is_empty() {
        return Err(InferenceError::Preprocessing("cannot compare empty images".into()));
    }
    let total = Zip::from(&a).and(&b).fold(0.0f64, |acc, &x, &y| {
        let d = f64::from(x) - f64::from(y);
        acc + d * d
    });
    Ok(total / a.len() as f64)
}

/// `max - min` of the finite values, 0 for an empty or non-finite view.
pub fn value_range(values: ArrayView2<f32>) -> f64 {
    let (min, max) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if min > max {
        0.0
    } else {
        f64::from(max) - f64::from(min)
    }
}

/// Summed-area table with a zero first row and column.
struct IntegralImage {
    table: Array2<f64>,
}

impl IntegralImage {
    fn new(values: &Array2<f64>) -> Self {
        let (rows, cols) = values.dim();
        let mut table = Array2::<f64>::zeros((rows + 1, cols + 1));
        for r in 0..rows {
            let mut row_sum = 0.0;
            for c in 0..cols {
                row_sum += values[[r, c]];
                table[[r + 1, c + 1]] = table[[r, c + 1]] + row_sum;
            }
        }
        Self { table }
    }

    /// Sum over rows `r0..r1` and columns `c0..c1`.
    fn window_sum(&self, r0: usize, c0: usize, r1: usize, c1: usize) -> f64 {
        self.table[[r1, c1]] - self.table[[r0, c1]] - self.table[[r1, c0]] + self.table[[r0, c0]]
    }
}

/// Mean structural similarity with a uniform `SSIM_WINDOW` window and sample
/// covariance, averaged over the pixels whose window fits inside the image.
pub fn structural_similarity(
    x: ArrayView2<f32>,
    y: ArrayView2<f32>,
    data_range: f64,
) -> Result<f64, InferenceError> {
    check_same_shape(&x, &y)?;
    let (rows, cols) = x.dim();
    if rows < SSIM_WINDOW || cols < SSIM_WINDOW {
        return Err(InferenceError::Preprocessing(format!(
            "image of {}x{} is smaller than the {}x{} SSIM window",
            rows, cols, SSIM_WINDOW, SSIM_WINDOW
        )));
    }

    let x = x.mapv(f64::from);
    let y = y.mapv(f64::from);
    let sum_x = IntegralImage::new(&x);
    let sum_y = IntegralImage::new(&y);
    let sum_xx = IntegralImage::new(&(&x * &x));
    let sum_yy = IntegralImage::new(&(&y * &y));
    let sum_xy = IntegralImage::new(&(&x * &y));

    let np = (SSIM_WINDOW * SSIM_WINDOW) as f64;
    let cov_norm = np / (np - 1.0);
    let c1 = (SSIM_K1 * data_range).powi(2);
    let c2 = (SSIM_K2 * data_range).powi(2);
    let pad = (SSIM_WINDOW - 1) / 2;

    let mut total = 0.0;
    let mut count = 0usize;
    for r in pad..rows - pad {
        for c in pad..cols - pad {
            let (r0, c0, r1, c1_) = (r - pad, c - pad, r + pad + 1, c + pad + 1);
            let ux = sum_x.window_sum(r0, c0, r1, c1_) / np;
            let uy = sum_y.window_sum(r0, c0, r1, c1_) / np;
            let uxx = sum_xx.window_sum(r0, c0, r1, c1_) / np;
            let uyy = sum_yy.window_sum(r0, c0, r1, c1_) / np;
            let uxy = sum_xy.window_sum(r0, c0, r1, c1_) / np;

            let vx = cov_norm * (uxx - ux * ux);
            let vy = cov_norm * (uyy - uy * uy);
            let vxy = cov_norm * (uxy - ux * uy);

            let numerator = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
            let denominator = (ux * ux + uy * uy + c1) * (vx + vy + c2);
            total += numerator / denominator;
            count += 1;
        }
    }
    Ok(total / count as f64)
}

/// Normalized Gaussian weights over `[-radius, radius]`, `radius = round(truncate * sigma)`.
pub fn gaussian_kernel(sigma: f64, truncate: f64) -> Vec<f64> {
    let radius = (truncate * sigma + 0.5) as i64;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|x| (-0.5 * (x * x) as f64 / (sigma * sigma)).exp())
        .collect();
    let sum: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / sum).collect()
}

/// Separable Gaussian blur. Samples past the border repeat the edge value.
pub fn gaussian_blur(
    input: ArrayView2<f32>,
    sigma: f64,
    truncate: f64,
) -> Result<Array2<f32>, InferenceError> {
    if sigma <= 0.0 || input.is_empty() {
        return Ok(input.to_owned());
    }
    let (rows, cols) = input.dim();
    let plane = GrayF32::from_raw(cols as u32, rows as u32, input.iter().copied().collect())
        .ok_or_else(|| {
            InferenceError::Preprocessing(format!("cannot build a {}x{} plane", cols, rows))
        })?;

    let kernel: Vec<f32> = gaussian_kernel(sigma, truncate)
        .into_iter()
        .map(|w| w as f32)
        .collect();
    let blurred = separable_filter_equal(&plane, &kernel);
    Ok(Array2::from_shape_vec((rows, cols), blurred.into_raw())?)
}
