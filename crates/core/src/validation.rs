//! Input checks applied before any work is admitted.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::model::ImageFormat;

/// Largest accepted decoded image.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Why an image payload was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageError {
    /// Nothing to decode.
    #[error("image payload is empty")]
    Empty,
    /// Decoder error text.
    #[error("image payload is not valid base64: {0}")]
    Base64(String),
    /// Decoded size over [`MAX_IMAGE_BYTES`].
    #[error("image is {size} bytes, limit is {limit}")]
    TooLarge {
        /// Decoded size in bytes.
        size: usize,
        /// The limit that was exceeded.
        limit: usize,
    },
    /// Magic bytes match no accepted format.
    #[error("unsupported image format (expected jpeg, png, bmp or tiff)")]
    UnsupportedFormat,
}

/// Drops a `data:image/...;base64,` prefix if present.
pub fn strip_data_url(s: &str) -> &str {
    match s.find("base64,") {
        Some(i) => &s[i + "base64,".len()..],
        None => s,
    }
}

/// Decodes a base64 image payload, enforcing [`MAX_IMAGE_BYTES`].
pub fn decode_image_base64(s: &str) -> Result<Vec<u8>, ImageError> {
    let body = strip_data_url(s.trim());
    if body.is_empty() {
        return Err(ImageError::Empty);
    }

    // Reject oversize payloads before paying for the decode.
    let approx = body.len() / 4 * 3;
    if approx > MAX_IMAGE_BYTES + 3 {
        return Err(ImageError::TooLarge {
            size: approx,
            limit: MAX_IMAGE_BYTES,
        });
    }

    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ImageError::Base64(e.to_string()))?;
    check_size(bytes.len())?;
    Ok(bytes)
}

/// Detects the container format from magic bytes.
pub fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(ImageFormat::Jpeg)
    } else if bytes.starts_with(PNG) {
        Some(ImageFormat::Png)
    } else if bytes.starts_with(b"BM") {
        Some(ImageFormat::Bmp)
    } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
        Some(ImageFormat::Tiff)
    } else {
        None
    }
}

/// Checks size and format of decoded image bytes.
pub fn validate_image(bytes: &[u8]) -> Result<ImageFormat, ImageError> {
    check_size(bytes.len())?;
    sniff_format(bytes).ok_or(ImageError::UnsupportedFormat)
}

fn check_size(size: usize) -> Result<(), ImageError> {
    if size == 0 {
        return Err(ImageError::Empty);
    }
    if size > MAX_IMAGE_BYTES {
        return Err(ImageError::TooLarge {
            size,
            limit: MAX_IMAGE_BYTES,
        });
    }
    Ok(())
}
