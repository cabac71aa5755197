//! Frame preparation before upload
//!
//! Frames are downscaled and re-encoded as JPEG to bound request size and
//! latency.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageResult};

/// Decode, downscale to `max_width` (aspect preserved) and re-encode as JPEG
pub fn prepare_image(encoded: &[u8], max_width: u32, quality: u8) -> ImageResult<Vec<u8>> {
    let decoded = image::load_from_memory(encoded)?;
    let (width, height) = decoded.dimensions();

    let scaled = if width > max_width {
        let ratio = max_width as f32 / width as f32;
        let scaled_height = ((height as f32 * ratio) as u32).max(1);
        decoded.resize_exact(max_width, scaled_height, FilterType::Triangle)
    } else {
        decoded
    };

    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(scaled.to_rgb8());

    let mut out = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, RgbaImage};

    use super::*;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            image::Rgba([200, 40, 40, 255]),
        ));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn test_wide_frame_is_downscaled() {
        let jpeg = prepare_image(&png(1024, 768), 512, 60).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (512, 384));
    }

    #[test]
    fn test_narrow_frame_keeps_size() {
        let jpeg = prepare_image(&png(320, 240), 512, 60).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (320, 240));
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(prepare_image(b"not an image", 512, 60).is_err());
    }
}
