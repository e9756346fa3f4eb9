use crate::io::workspace::commit_with;
use crate::types::{GlacierResult, Raster};
use image::{ImageFormat, Rgba, RgbaImage};
use std::path::Path;

// Coarse viridis control points, low to high
const PALETTE: [[u8; 3]; 5] = [
    [68, 1, 84],
    [59, 82, 139],
    [33, 145, 140],
    [94, 201, 98],
    [253, 231, 37],
];

fn colour(t: f32) -> Rgba<u8> {
    let t = t.clamp(0.0, 1.0) * (PALETTE.len() - 1) as f32;
    let i = (t.floor() as usize).min(PALETTE.len() - 2);
    let f = t - i as f32;
    let lerp = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * f).round() as u8;
    let (a, b) = (PALETTE[i], PALETTE[i + 1]);
    Rgba([lerp(a[0], b[0]), lerp(a[1], b[1]), lerp(a[2], b[2]), 255])
}

/// Upper colour-scale limit: the 98th percentile of finite values
pub fn scale_limit(values: &Raster) -> Option<f32> {
    let mut finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    finite.sort_by(|a, b| a.total_cmp(b));
    let idx = ((finite.len() - 1) as f32 * 0.98).round() as usize;
    Some(finite[idx])
}

/// Render `values` to an RGBA image; NaN pixels are transparent
pub fn render(values: &Raster) -> RgbaImage {
    let (rows, cols) = values.dim();
    let limit = scale_limit(values).filter(|v| *v > 0.0).unwrap_or(1.0);
    RgbaImage::from_fn(cols as u32, rows as u32, |x, y| {
        let v = values[[y as usize, x as usize]];
        if v.is_finite() {
            colour(v.abs() / limit)
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}

/// Write a PNG preview of a magnitude raster
pub fn write_png(path: &Path, values: &Raster) -> GlacierResult<()> {
    let img = render(values);
    commit_with(path, |tmp| {
        img.save_with_format(tmp, ImageFormat::Png)?;
        Ok(())
    })
}
