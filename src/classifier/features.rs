//! Image → feature vector conversion shared by training and inference.

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::Path;

/// Length of the feature vector produced for a square `size` input.
pub fn feature_len(size: u32) -> usize {
    (size as usize) * (size as usize) * 3
}

/// Resize to `size`×`size`, drop alpha, and rescale channels to [0, 1].
/// Layout is row-major HWC: `[r, g, b, r, g, b, ...]`.
pub fn extract(img: &DynamicImage, size: u32) -> Vec<f64> {
    let rgb = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();
    rgb.pixels()
        .flat_map(|p| p.0)
        .map(|channel| channel as f64 / 255.0)
        .collect()
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| anyhow!("Failed to decode image: {}", e))
}

pub fn extract_file(path: &Path, size: u32) -> Result<Vec<f64>> {
    let img = image::open(path)
        .map_err(|e| anyhow!("Failed to load image {}: {}", path.display(), e))?;
    Ok(extract(&img, size))
}
