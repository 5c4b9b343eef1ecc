//! Face locator / encoder collaborator traits.

use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("face detection failed: {0}")]
    Detection(String),
    #[error("face encoding failed: {0}")]
    Encoding(String),
}

/// A face region cut out of the submitted image.
///
/// Landmarks, when present, are expressed in crop coordinates.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub image: RgbImage,
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Finds faces in a decoded image.
pub trait FaceLocator {
    /// Return zero or more face boxes in a stable detection order.
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, CollaboratorError>;
}

/// Turns a face crop into a fixed-length embedding.
pub trait FaceEncoder {
    fn encode(&mut self, face: &FaceCrop) -> Result<Embedding, CollaboratorError>;
}

impl<T: FaceLocator + ?Sized> FaceLocator for Box<T> {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, CollaboratorError> {
        (**self).locate(image)
    }
}

impl<T: FaceEncoder + ?Sized> FaceEncoder for Box<T> {
    fn encode(&mut self, face: &FaceCrop) -> Result<Embedding, CollaboratorError> {
        (**self).encode(face)
    }
}
