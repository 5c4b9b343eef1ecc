//! Decoding submitted images and cutting out face regions.

use crate::pipeline::FaceCrop;
use crate::types::BoundingBox;
use base64::Engine as _;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageInputError {
    #[error("image payload is empty")]
    Empty,
    #[error("image payload exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unsupported or corrupt image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Decode a `data:<mime>;base64,<payload>` string into an RGB image.
///
/// Everything up to the first comma is treated as the prefix and discarded.
/// A string with no comma is decoded as bare base64. `max_bytes` bounds the
/// decoded payload size.
pub fn decode_data_url(input: &str, max_bytes: usize) -> Result<RgbImage, ImageInputError> {
    let payload = match input.split_once(',') {
        Some((_, rest)) => rest,
        None => input,
    }
    .trim();

    if payload.is_empty() {
        return Err(ImageInputError::Empty);
    }
    // base64 expands by 4/3; reject before allocating the decoded buffer.
    if payload.len() / 4 * 3 > max_bytes {
        return Err(ImageInputError::TooLarge { limit: max_bytes });
    }

    let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;
    if bytes.len() > max_bytes {
        return Err(ImageInputError::TooLarge { limit: max_bytes });
    }

    let image = image::load_from_memory(&bytes)?;
    Ok(image.to_rgb8())
}

/// Cut the region of `face` out of `image`, clamped to the image bounds.
///
/// Landmarks are translated into crop coordinates. A box that clamps to an
/// empty region yields a 1×1 crop at the nearest edge pixel.
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> FaceCrop {
    let [x, y, w, h] = face.pixel_rect(image.width(), image.height());
    let x = x.min(image.width().saturating_sub(1));
    let y = y.min(image.height().saturating_sub(1));
    let w = w.max(1).min(image.width() - x);
    let h = h.max(1).min(image.height() - y);

    let cropped = image::imageops::crop_imm(image, x, y, w, h).to_image();
    let landmarks = face.landmarks.map(|lms| {
        lms.map(|(lx, ly)| (lx - x as f32, ly - y as f32))
    });

    FaceCrop { image: cropped, landmarks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn png_base64(width: u32, height: u32) -> String {
        let img = RgbImage::from_pixel(width, height, Rgb([10, 200, 30]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        base64::engine::general_purpose::STANDARD.encode(buf.into_inner())
    }

    #[test]
    fn test_decode_data_url_strips_prefix() {
        let url = format!("data:image/png;base64,{}", png_base64(8, 6));
        let img = decode_data_url(&url, 1 << 20).unwrap();
        assert_eq!(img.dimensions(), (8, 6));
        assert_eq!(img.get_pixel(0, 0), &Rgb([10, 200, 30]));
    }

    #[test]
    fn test_decode_bare_base64() {
        let img = decode_data_url(&png_base64(4, 4), 1 << 20).unwrap();
        assert_eq!(img.dimensions(), (4, 4));
    }

    #[test]
    fn test_decode_rejects_empty_payload() {
        assert!(matches!(
            decode_data_url("data:image/png;base64,", 1024),
            Err(ImageInputError::Empty)
        ));
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        assert!(matches!(
            decode_data_url("data:image/png;base64,@@@@", 1024),
            Err(ImageInputError::Base64(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_image_bytes() {
        let payload = base64::engine::general_purpose::STANDARD.encode(b"not an image at all");
        assert!(matches!(
            decode_data_url(&payload, 1024),
            Err(ImageInputError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_enforces_size_limit() {
        let url = format!("data:image/png;base64,{}", png_base64(64, 64));
        assert!(matches!(
            decode_data_url(&url, 16),
            Err(ImageInputError::TooLarge { limit: 16 })
        ));
    }

    #[test]
    fn test_crop_face_translates_landmarks() {
        let img = RgbImage::new(100, 100);
        let face = BoundingBox {
            x: 20.0, y: 30.0, width: 40.0, height: 50.0, confidence: 0.9,
            landmarks: Some([(30.0, 40.0), (50.0, 40.0), (40.0, 55.0), (32.0, 70.0), (48.0, 70.0)]),
        };
        let crop = crop_face(&img, &face);
        assert_eq!(crop.image.dimensions(), (40, 50));
        let lms = crop.landmarks.unwrap();
        assert_eq!(lms[0], (10.0, 10.0));
        assert_eq!(lms[4], (28.0, 40.0));
    }

    #[test]
    fn test_crop_face_outside_image_is_not_empty() {
        let img = RgbImage::new(10, 10);
        let face = BoundingBox {
            x: 50.0, y: 50.0, width: 5.0, height: 5.0, confidence: 0.9, landmarks: None,
        };
        let crop = crop_face(&img, &face);
        assert_eq!(crop.image.dimensions(), (1, 1));
    }
}
