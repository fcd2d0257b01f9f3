//! Encodes raw engine output into the requested container format.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::engine::RawImage;
use crate::error::{Result, ServeError};
use crate::models::ImageFormat;

pub const JPEG_QUALITY: u8 = 90;

pub fn encode(image: &RawImage, format: ImageFormat) -> Result<Vec<u8>> {
    if image.width == 0 || image.height == 0 {
        return Err(ServeError::Encoding {
            format,
            reason: format!("empty image {}x{}", image.width, image.height),
        });
    }
    if image.pixels.len() != image.expected_len() {
        return Err(ServeError::Encoding {
            format,
            reason: format!(
                "expected {} RGB bytes for {}x{}, got {}",
                image.expected_len(),
                image.width,
                image.height,
                image.pixels.len()
            ),
        });
    }

    let mut buf = Vec::new();
    let written = match format {
        ImageFormat::Jpeg => JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).write_image(
            &image.pixels,
            image.width,
            image.height,
            ExtendedColorType::Rgb8,
        ),
        ImageFormat::Png => {
            PngEncoder::new_with_quality(&mut buf, CompressionType::Best, FilterType::Adaptive)
                .write_image(
                    &image.pixels,
                    image.width,
                    image.height,
                    ExtendedColorType::Rgb8,
                )
        }
        // Lossless only; the encoder has no quality setting.
        ImageFormat::Webp => WebPEncoder::new_lossless(&mut buf).write_image(
            &image.pixels,
            image.width,
            image.height,
            ExtendedColorType::Rgb8,
        ),
    };

    written.map_err(|e| ServeError::Encoding {
        format,
        reason: e.to_string(),
    })?;
    Ok(buf)
}
