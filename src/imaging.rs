//! Preview generation
//!
//! Decodes an uploaded photo, scales it to a fixed width (height follows the
//! aspect ratio) and re-encodes it as JPEG. Decoding and resampling are CPU
//! bound, so async callers go through [`resize_to_jpeg_blocking`].

use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("failed to encode JPEG: {0}")]
    Encode(#[source] image::ImageError),

    #[error("resize task failed: {0}")]
    Task(String),
}

/// Target width in pixels and JPEG quality (1-100)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeSpec {
    pub width: u32,
    pub quality: u8,
}

impl ResizeSpec {
    /// Gallery previews
    pub const GALLERY: ResizeSpec = ResizeSpec {
        width: 1000,
        quality: 80,
    };

    /// Phone-sized copies of the final delivery
    pub const FINAL: ResizeSpec = ResizeSpec {
        width: 1920,
        quality: 85,
    };

    /// Height that keeps the aspect ratio at the target width
    pub fn scaled_height(&self, width: u32, height: u32) -> u32 {
        let width = u64::from(width.max(1));
        let scaled = (u64::from(height) * u64::from(self.width) + width / 2) / width;
        scaled.clamp(1, u64::from(u32::MAX)) as u32
    }
}

pub fn resize_to_jpeg(bytes: &[u8], spec: ResizeSpec) -> Result<Vec<u8>, ImageError> {
    let img = image::load_from_memory(bytes).map_err(ImageError::Decode)?;
    let height = spec.scaled_height(img.width(), img.height());
    let resized = img.resize_exact(spec.width, height, FilterType::CatmullRom);

    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut out = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, spec.quality))
        .map_err(ImageError::Encode)?;

    Ok(out)
}

pub async fn resize_to_jpeg_blocking(bytes: Bytes, spec: ResizeSpec) -> Result<Vec<u8>, ImageError> {
    tokio::task::spawn_blocking(move || resize_to_jpeg(&bytes, spec))
        .await
        .map_err(|e| ImageError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 200])
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_scaled_height() {
        let spec = ResizeSpec { width: 1000, quality: 80 };
        assert_eq!(spec.scaled_height(4000, 3000), 750);
        assert_eq!(spec.scaled_height(3000, 4000), 1333);
        assert_eq!(spec.scaled_height(5000, 1), 1);
    }

    #[test]
    fn test_resize_reencodes_as_jpeg() {
        let spec = ResizeSpec { width: 100, quality: 80 };
        let out = resize_to_jpeg(&png(400, 200), spec).unwrap();

        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 50));
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let err = resize_to_jpeg(b"not an image", ResizeSpec::GALLERY).unwrap_err();
        assert!(matches!(err, ImageError::Decode(_)));
    }

    #[tokio::test]
    async fn test_blocking_wrapper() {
        let spec = ResizeSpec { width: 64, quality: 85 };
        let out = resize_to_jpeg_blocking(Bytes::from(png(128, 128)), spec)
            .await
            .unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 64));
    }
}
