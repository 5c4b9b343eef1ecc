//! Deterministic face pipeline for daemon tests.
//!
//! Images are strips of 100×100 slots. A slot whose center pixel is not
//! black holds one face; [`ColorEncoder`] embeds a face as its mean color.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use rollcall_core::fakes::face_at;
use rollcall_core::{BoundingBox, CollaboratorError, FaceLocator};
use std::io::Cursor;
use std::time::Duration;

pub use rollcall_core::fakes::ColorEncoder;

const SLOT: u32 = 100;

pub const RED: [u8; 3] = [255, 0, 0];
/// Within matching distance of [`RED`].
pub const DARK_RED: [u8; 3] = [179, 0, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];

#[derive(Default)]
pub struct SlotLocator {
    /// Sleep before answering, to simulate a slow detector.
    pub delay: Duration,
}

impl FaceLocator for SlotLocator {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, CollaboratorError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let faces = (0..image.width() / SLOT)
            .filter(|slot| image.get_pixel(slot * SLOT + SLOT / 2, SLOT / 2).0 != [0, 0, 0])
            .map(face_at)
            .collect();
        Ok(faces)
    }
}

/// PNG data URL with one slot per entry; `None` leaves the slot empty.
pub fn data_url(slots: &[Option<[u8; 3]>]) -> String {
    let mut img = RgbImage::new(SLOT * slots.len().max(1) as u32, SLOT);
    for (i, color) in slots.iter().enumerate() {
        let Some(color) = color else { continue };
        let x0 = i as u32 * SLOT;
        for y in 10..90 {
            for x in x0 + 10..x0 + 90 {
                img.put_pixel(x, y, Rgb(*color));
            }
        }
    }
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png).unwrap();
    format!("data:image/png;base64,{}", STANDARD.encode(png))
}
