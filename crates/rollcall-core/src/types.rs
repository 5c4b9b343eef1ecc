use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Label reported for faces that match no enrolled student.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Integer `[x, y, width, height]` clamped to an image of the given size.
    ///
    /// A box lying entirely outside the image collapses to zero width/height
    /// at the nearest edge.
    pub fn pixel_rect(&self, image_width: u32, image_height: u32) -> [u32; 4] {
        let clamp = |v: f32, max: u32| -> u32 {
            if v.is_nan() {
                0
            } else {
                (v.round().max(0.0) as u32).min(max)
            }
        };
        let x1 = clamp(self.x, image_width);
        let y1 = clamp(self.y, image_height);
        let x2 = clamp(self.x + self.width, image_width);
        let y2 = clamp(self.y + self.height, image_height);
        [x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1)]
    }
}

/// Face embedding vector produced by a [`FaceEncoder`](crate::FaceEncoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Returns `None` when the dimensions differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>()
                .sqrt(),
        )
    }
}

/// Optional contact fields attached to a student.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub mobile: Option<String>,
    pub email: Option<String>,
}

/// An enrolled student and their reference embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentProfile {
    /// Unique, case-sensitive name.
    pub identity: String,
    pub contact: ContactInfo,
    pub embedding: Embedding,
    pub enrolled_at: NaiveDateTime,
}

/// One row of the embedding snapshot used for matching.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub identity: String,
    pub embedding: Embedding,
}

/// Attendance for one student on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity: String,
    pub date: NaiveDate,
    pub first_seen: NaiveTime,
    pub last_seen: NaiveTime,
}

/// Outcome label for a recognized face.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    Known(String),
    Unknown,
}

impl Label {
    pub fn as_str(&self) -> &str {
        match self {
            Label::Known(name) => name,
            Label::Unknown => UNKNOWN_LABEL,
        }
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            Label::Known(name) => Some(name),
            Label::Unknown => None,
        }
    }
}

impl Serialize for Label {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Per-face recognition output returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResult {
    #[serde(rename = "name")]
    pub label: Label,
    /// `[x, y, width, height]` in pixels of the submitted image.
    pub bbox: [u32; 4],
    /// Time of day formatted `HH:MM:SS`.
    pub time: String,
}
