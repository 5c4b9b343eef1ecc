//! In-memory collaborators for workflow tests.

use crate::pipeline::{CollaboratorError, FaceCrop, FaceEncoder, FaceLocator};
use crate::store::{AttendanceLedger, EmbeddingStore, InsertOutcome, StoreError, UpsertOutcome};
use crate::types::{AttendanceRecord, BoundingBox, Embedding, GalleryEntry, StudentProfile};
use chrono::{NaiveDate, NaiveTime};
use image::{Rgb, RgbImage};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};

const SLOT_SIZE: u32 = 80;
const SLOT_STRIDE: u32 = 100;

/// Box for face slot `i` in a [`painted_image`].
pub fn face_at(slot: u32) -> BoundingBox {
    BoundingBox {
        x: (10 + slot * SLOT_STRIDE) as f32,
        y: 10.0,
        width: SLOT_SIZE as f32,
        height: SLOT_SIZE as f32,
        confidence: 0.99,
        landmarks: None,
    }
}

/// A black 220×100 image with each face box filled with a solid color.
pub fn painted_image(faces: &[(&BoundingBox, [u8; 3])]) -> RgbImage {
    let mut img = RgbImage::new(220, 100);
    for (face, color) in faces {
        let [x, y, w, h] = face.pixel_rect(img.width(), img.height());
        for py in y..y + h {
            for px in x..x + w {
                img.put_pixel(px, py, Rgb(*color));
            }
        }
    }
    img
}

/// Returns whatever boxes the test put in `faces`.
#[derive(Default)]
pub struct ScriptedLocator {
    pub faces: Vec<BoundingBox>,
}

impl FaceLocator for ScriptedLocator {
    fn locate(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, CollaboratorError> {
        Ok(self.faces.clone())
    }
}

/// Embeds a crop as its mean RGB color scaled to [0, 1].
pub struct ColorEncoder;

impl FaceEncoder for ColorEncoder {
    fn encode(&mut self, face: &FaceCrop) -> Result<Embedding, CollaboratorError> {
        let count = (face.image.width() * face.image.height()) as f32;
        let mut sums = [0u64; 3];
        for pixel in face.image.pixels() {
            for (sum, channel) in sums.iter_mut().zip(pixel.0) {
                *sum += channel as u64;
            }
        }
        Ok(Embedding::new(
            sums.iter().map(|&s| s as f32 / count / 255.0).collect(),
        ))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    students: RefCell<BTreeMap<String, StudentProfile>>,
    attendance: RefCell<BTreeMap<(String, NaiveDate), AttendanceRecord>>,
    hidden: RefCell<HashSet<String>>,
    failing: RefCell<HashSet<String>>,
    writes: Cell<usize>,
}

impl MemoryStore {
    /// Make `find` miss this identity, as if another writer inserted it
    /// after our lookup.
    pub fn hide_from_find(&self, identity: &str) {
        self.hidden.borrow_mut().insert(identity.to_string());
    }

    pub fn find_unhidden(&self, identity: &str) -> Option<StudentProfile> {
        self.students.borrow().get(identity).cloned()
    }

    pub fn fail_ledger_for(&self, identity: &str) {
        self.failing.borrow_mut().insert(identity.to_string());
    }

    /// Number of successful ledger writes.
    pub fn ledger_writes(&self) -> usize {
        self.writes.get()
    }
}

impl EmbeddingStore for MemoryStore {
    fn find(&self, identity: &str) -> Result<Option<StudentProfile>, StoreError> {
        if self.hidden.borrow().contains(identity) {
            return Ok(None);
        }
        Ok(self.students.borrow().get(identity).cloned())
    }

    fn insert(&self, profile: &StudentProfile) -> Result<InsertOutcome, StoreError> {
        let mut students = self.students.borrow_mut();
        if students.contains_key(&profile.identity) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        students.insert(profile.identity.clone(), profile.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn replace_embedding(&self, identity: &str, embedding: &Embedding) -> Result<bool, StoreError> {
        match self.students.borrow_mut().get_mut(identity) {
            Some(profile) => {
                profile.embedding = embedding.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn snapshot(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        Ok(self
            .students
            .borrow()
            .values()
            .map(|p| GalleryEntry { identity: p.identity.clone(), embedding: p.embedding.clone() })
            .collect())
    }

    fn list(&self) -> Result<Vec<StudentProfile>, StoreError> {
        Ok(self.students.borrow().values().cloned().collect())
    }
}

impl AttendanceLedger for MemoryStore {
    fn upsert(&self, identity: &str, date: NaiveDate, time: NaiveTime) -> Result<UpsertOutcome, StoreError> {
        if self.failing.borrow().contains(identity) {
            return Err(StoreError::Backend("disk I/O error".into()));
        }
        let mut attendance = self.attendance.borrow_mut();
        let outcome = match attendance.get_mut(&(identity.to_string(), date)) {
            Some(record) => {
                record.last_seen = time;
                UpsertOutcome::Updated
            }
            None => {
                attendance.insert(
                    (identity.to_string(), date),
                    AttendanceRecord {
                        identity: identity.to_string(),
                        date,
                        first_seen: time,
                        last_seen: time,
                    },
                );
                UpsertOutcome::Created
            }
        };
        self.writes.set(self.writes.get() + 1);
        Ok(outcome)
    }

    fn record(&self, identity: &str, date: NaiveDate) -> Result<Option<AttendanceRecord>, StoreError> {
        Ok(self.attendance.borrow().get(&(identity.to_string(), date)).cloned())
    }

    fn records_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self
            .attendance
            .borrow()
            .values()
            .filter(|r| r.date == date)
            .cloned()
            .collect())
    }
}
