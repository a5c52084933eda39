use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

fn join_error(e: tokio::task::JoinError) -> image::ImageError {
    image::ImageError::IoError(std::io::Error::other(e))
}

/// Asynchronously load an image from bytes using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for full webtoon strips.
pub async fn load_image_from_memory_async(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
        .await
        .map_err(join_error)?
}

/// Asynchronously crop and encode a region to PNG in a single blocking task.
///
/// Used by the region re-scan path, which ships a cropped rectangle back to
/// the detection provider. The rectangle must already be clamped to the
/// image bounds.
pub async fn crop_and_encode_png_async(
    img: DynamicImage,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, image::ImageError> {
    tokio::task::spawn_blocking(move || {
        let cropped = img.crop_imm(x, y, width, height);
        let mut png_bytes = Vec::new();
        cropped.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)?;
        Ok(png_bytes)
    })
    .await
    .map_err(join_error)?
}

/// Encode an image preserving the source format where the pipeline supports
/// it losslessly: PNG stays PNG, WebP is re-encoded lossless, JPEG stays
/// JPEG, anything else becomes PNG.
pub fn encode_preserving_format(
    img: &DynamicImage,
    format: ImageFormat,
) -> Result<Vec<u8>, image::ImageError> {
    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    match format {
        ImageFormat::WebP => {
            let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut cursor);
            img.write_with_encoder(encoder)?;
        }
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_to(&mut cursor, ImageFormat::Jpeg)?;
        }
        _ => {
            img.write_to(&mut cursor, ImageFormat::Png)?;
        }
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn red_image(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([255, 0, 0, 255])))
    }

    #[tokio::test]
    async fn test_crop_and_encode_async() {
        let result = crop_and_encode_png_async(red_image(100, 100), 10, 10, 50, 50).await;
        assert!(result.is_ok());
        let png_bytes = result.unwrap();
        assert!(!png_bytes.is_empty());
        let decoded = image::load_from_memory(&png_bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (50, 50));
    }

    #[tokio::test]
    async fn test_load_image_async() {
        let mut png_bytes = Vec::new();
        red_image(1, 1)
            .write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
            .unwrap();
        let result = load_image_from_memory_async(&png_bytes).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_load_rejects_garbage() {
        assert!(load_image_from_memory_async(b"not an image").await.is_err());
    }

    #[test]
    fn png_roundtrip_preserves_pixels() {
        let img = red_image(8, 8);
        let bytes = encode_preserving_format(&img, ImageFormat::Png).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.to_rgba8(), img.to_rgba8());
    }

    #[test]
    fn webp_roundtrip_is_lossless() {
        let img = red_image(8, 8);
        let bytes = encode_preserving_format(&img, ImageFormat::WebP).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::WebP);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.to_rgba8(), img.to_rgba8());
    }

    #[test]
    fn jpeg_encode_drops_alpha_without_error() {
        let img = red_image(8, 8);
        let bytes = encode_preserving_format(&img, ImageFormat::Jpeg).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
    }
}
