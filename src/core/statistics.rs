//! NaN-aware pixel statistics shared by the estimation and correction stages.
//!
//! Every reduction here works per pixel and ignores non-finite samples at
//! that pixel; a pixel only becomes NaN when too few finite samples remain.

use crate::types::{MaskRaster, Raster};
use ndarray::{Array2, ArrayView2, Zip};
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Median of the finite values, averaging the two central values for even counts
pub fn nanmedian<T: Float>(values: &mut Vec<T>) -> Option<T> {
    values.retain(|v| v.is_finite());
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    let two = T::one() + T::one();
    if n % 2 == 1 {
        Some(values[n / 2])
    } else {
        Some((values[n / 2 - 1] + values[n / 2]) / two)
    }
}

/// Median absolute deviation about the median of the finite values
pub fn nanmad<T: Float>(values: &mut Vec<T>) -> Option<T> {
    let median = nanmedian(values)?;
    let mut deviations: Vec<T> = values.iter().map(|v| (*v - median).abs()).collect();
    nanmedian(&mut deviations)
}

/// Pixel-wise reduction output
#[derive(Debug, Clone)]
pub struct PixelStack {
    pub median: Raster,
    /// Median absolute deviation; only filled by [`pixelwise_median_mad`]
    pub mad: Option<Raster>,
    pub counts: Array2<u32>,
}

fn check_shapes(layers: &[ArrayView2<'_, f32>]) -> Option<(usize, usize)> {
    let shape = layers.first()?.dim();
    if layers.iter().all(|l| l.dim() == shape) {
        Some(shape)
    } else {
        None
    }
}

/// Per-pixel median over `layers`, NaN where fewer than `min_samples` finite values exist.
///
/// Returns `None` for an empty or ragged stack.
pub fn pixelwise_median(layers: &[ArrayView2<'_, f32>], min_samples: usize) -> Option<PixelStack> {
    reduce(layers, min_samples, false)
}

/// As [`pixelwise_median`], also producing the per-pixel median absolute deviation
pub fn pixelwise_median_mad(
    layers: &[ArrayView2<'_, f32>],
    min_samples: usize,
) -> Option<PixelStack> {
    reduce(layers, min_samples, true)
}

fn reduce(
    layers: &[ArrayView2<'_, f32>],
    min_samples: usize,
    with_mad: bool,
) -> Option<PixelStack> {
    let shape = check_shapes(layers)?;
    let min_samples = min_samples.max(1);
    let mut median = Array2::<f32>::from_elem(shape, f32::NAN);
    let mut mad = Array2::<f32>::from_elem(shape, f32::NAN);
    let mut counts = Array2::<u32>::zeros(shape);

    let kernel = |(row, col): (usize, usize), m: &mut f32, d: &mut f32, n: &mut u32| {
        let mut samples: Vec<f32> = layers.iter().map(|l| l[[row, col]]).collect();
        samples.retain(|v| v.is_finite());
        *n = samples.len() as u32;
        if samples.len() < min_samples {
            return;
        }
        if let Some(value) = nanmedian(&mut samples) {
            *m = value;
        }
        if with_mad {
            if let Some(value) = nanmad(&mut samples) {
                *d = value;
            }
        }
    };

    let zip = Zip::indexed(&mut median).and(&mut mad).and(&mut counts);
    #[cfg(feature = "parallel")]
    zip.par_for_each(kernel);
    #[cfg(not(feature = "parallel"))]
    zip.for_each(kernel);

    Some(PixelStack {
        median,
        mad: with_mad.then_some(mad),
        counts,
    })
}

/// 3x3 median smoothing over finite neighbours; NaN pixels stay NaN
pub fn median_filter_3x3(raster: &Raster) -> Raster {
    let (rows, cols) = raster.dim();
    let mut out = raster.clone();
    let kernel = |(row, col): (usize, usize), o: &mut f32| {
        if !raster[[row, col]].is_finite() {
            return;
        }
        let mut window = Vec::with_capacity(9);
        for r in row.saturating_sub(1)..=(row + 1).min(rows - 1) {
            for c in col.saturating_sub(1)..=(col + 1).min(cols - 1) {
                window.push(raster[[r, c]]);
            }
        }
        if let Some(value) = nanmedian(&mut window) {
            *o = value;
        }
    };
    let zip = Zip::indexed(&mut out);
    #[cfg(feature = "parallel")]
    zip.par_for_each(kernel);
    #[cfg(not(feature = "parallel"))]
    zip.for_each(kernel);
    out
}

/// Euclidean magnitude, NaN where either component is NaN
pub fn magnitude(dx: &Raster, dy: &Raster) -> Raster {
    Zip::from(dx).and(dy).map_collect(|x, y| x.hypot(*y))
}

/// Flow direction in degrees anticlockwise from +x, in (-180, 180]
pub fn flow_direction(dx: &Raster, dy: &Raster) -> Raster {
    Zip::from(dx)
        .and(dy)
        .map_collect(|x, y| y.atan2(*x).to_degrees())
}

/// Smallest absolute angle between two directions in degrees, in [0, 180]
pub fn angular_difference(a: f32, b: f32) -> f32 {
    let diff = (a - b).rem_euclid(360.0);
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}

/// Summary statistics over the finite pixels inside a mask
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaskedStats {
    pub mean: f64,
    pub std: f64,
    pub rmse: f64,
    pub count: usize,
}

impl MaskedStats {
    pub fn empty() -> Self {
        Self {
            mean: f64::NAN,
            std: f64::NAN,
            rmse: f64::NAN,
            count: 0,
        }
    }
}

/// Mean, population standard deviation and RMSE about zero of finite masked pixels
pub fn masked_stats(values: &Raster, mask: &MaskRaster) -> MaskedStats {
    let samples: Vec<f64> = values
        .iter()
        .zip(mask.iter())
        .filter(|(v, m)| **m != 0 && v.is_finite())
        .map(|(v, _)| *v as f64)
        .collect();
    if samples.is_empty() {
        return MaskedStats::empty();
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let rmse = (samples.iter().map(|v| v * v).sum::<f64>() / n).sqrt();
    MaskedStats {
        mean,
        std: var.sqrt(),
        rmse,
        count: samples.len(),
    }
}

/// Count of finite pixels inside a mask
pub fn count_valid(values: &Raster, mask: &MaskRaster) -> usize {
    values
        .iter()
        .zip(mask.iter())
        .filter(|(v, m)| **m != 0 && v.is_finite())
        .count()
}
