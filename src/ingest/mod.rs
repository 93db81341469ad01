//! Image ingestion.
//!
//! Decodes uploaded JPEG/PNG payloads into RGB8 frames for detection.
//! The analyzer consumes each decoded frame once; nothing here touches
//! disk except the explicit path loader used by the CLI.

use anyhow::{Context, Result};
use image::GenericImageView;
use std::path::Path;

/// A decoded RGB8 frame ready for inference.
pub struct DecodedImage {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl DecodedImage {
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Decode an encoded JPEG/PNG payload.
pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage> {
    let image = image::load_from_memory(bytes).context("decode image")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok(DecodedImage {
        pixels: rgb.into_raw(),
        width,
        height,
    })
}

/// Read and decode an image file.
pub fn load_image(path: &Path) -> Result<DecodedImage> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("read image {}", path.display()))?;
    decode_image(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_png_payloads() {
        let image = image::RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]));
        let mut bytes = std::io::Cursor::new(Vec::new());
        image
            .write_to(&mut bytes, image::ImageFormat::Png)
            .expect("encode test png");

        let decoded = decode_image(&bytes.into_inner()).expect("decode");
        assert_eq!(decoded.width, 3);
        assert_eq!(decoded.height, 2);
        assert_eq!(decoded.pixels().len(), 3 * 2 * 3);
        assert_eq!(decoded.pixels()[0], 10);
    }

    #[test]
    fn rejects_garbage_payloads() {
        assert!(decode_image(b"definitely not an image").is_err());
    }
}
