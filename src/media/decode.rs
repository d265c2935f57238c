use std::path::Path;

use image::RgbImage;

use crate::error::DetectError;

/// Decode encoded image bytes (JPEG, PNG, BMP, WebP) into RGB pixels.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, DetectError> {
    if bytes.is_empty() {
        return Err(DetectError::MediaRead("empty image payload".into()));
    }
    let decoded = image::load_from_memory(bytes)?;
    Ok(decoded.to_rgb8())
}

pub fn load_image(path: &Path) -> Result<RgbImage, DetectError> {
    let bytes = std::fs::read(path)
        .map_err(|e| DetectError::MediaRead(format!("{}: {}", path.display(), e)))?;
    decode_image(&bytes)
}
