//! rollcall-vision: ONNX-backed face locator and encoder.
//!
//! [`FaceDetector`] (SCRFD) implements [`rollcall_core::FaceLocator`] and
//! [`FaceRecognizer`] (ArcFace) implements [`rollcall_core::FaceEncoder`].

pub mod alignment;
pub mod detector;
pub mod recognizer;

use std::path::PathBuf;

pub use detector::{DetectorError, FaceDetector};
pub use recognizer::{FaceRecognizer, RecognizerError};

/// File name of the SCRFD detection model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default directory searched for ONNX model files.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/rollcall/models")
}
