//! Enrollment, face update and recognition workflows.
//!
//! Each workflow runs synchronously start to finish: locate faces, crop and
//! encode them, then consult the embedding store and attendance ledger.

use crate::confirmation::{ConfirmationBook, ConfirmationError, ConfirmationState};
use crate::imaging::{crop_face, ImageInputError};
use crate::matcher::Matcher;
use crate::pipeline::{CollaboratorError, FaceEncoder, FaceLocator};
use crate::store::{AttendanceLedger, EmbeddingStore, InsertOutcome, StoreError, UpsertOutcome};
use crate::types::{BoundingBox, ContactInfo, Embedding, Label, RecognitionResult, StudentProfile};
use chrono::{NaiveDateTime, NaiveTime, Timelike};
use image::RgbImage;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("No face detected")]
    NoFaceDetected,
    #[error("Multiple faces detected ({count}). Please provide an image with a single face.")]
    MultipleFacesDetected { count: usize },
    #[error("Student '{0}' not found.")]
    StudentNotFound(String),
    #[error("student name must not be empty")]
    InvalidIdentity,
    #[error(transparent)]
    InvalidImage(#[from] ImageInputError),
    #[error(transparent)]
    Confirmation(#[from] ConfirmationError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub identity: String,
    pub contact: ContactInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollOutcome {
    Enrolled { identity: String, faces_detected: usize },
    /// The identity is already enrolled. The stored embedding is untouched;
    /// `token` names the pending overwrite awaiting confirmation.
    ConflictRequiresConfirmation { identity: String, token: Uuid },
}

/// What happened to the attendance ledger for one recognized face.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerWrite {
    /// Face did not match an enrolled student.
    Skipped,
    Created,
    Updated,
    /// The write failed and was rolled back; other faces are unaffected.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceOutcome {
    pub result: RecognitionResult,
    pub ledger: LedgerWrite,
}

/// Face pipeline plus matching policy.
pub struct Workflows<L, E, M> {
    locator: L,
    encoder: E,
    matcher: M,
    threshold: f32,
}

impl<L: FaceLocator, E: FaceEncoder, M: Matcher> Workflows<L, E, M> {
    pub fn new(locator: L, encoder: E, matcher: M, threshold: f32) -> Self {
        Self { locator, encoder, matcher, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Enroll a new student from an image containing exactly one face.
    pub fn enroll<S: EmbeddingStore + ?Sized>(
        &mut self,
        store: &S,
        book: &mut ConfirmationBook,
        request: EnrollRequest,
        image: &RgbImage,
        now: NaiveDateTime,
    ) -> Result<EnrollOutcome, WorkflowError> {
        let identity = request.identity.as_str();
        if identity.trim().is_empty() {
            return Err(WorkflowError::InvalidIdentity);
        }

        let face = self.locate_single(image)?;
        let embedding = self.encode(image, &face)?;

        if store.find(identity)?.is_some() {
            let token = book.open(identity, embedding, now);
            tracing::info!(identity, %token, "student exists; overwrite awaits confirmation");
            return Ok(EnrollOutcome::ConflictRequiresConfirmation {
                identity: identity.to_string(),
                token,
            });
        }

        let profile = StudentProfile {
            identity: identity.to_string(),
            contact: request.contact,
            embedding,
            enrolled_at: now,
        };

        match store.insert(&profile)? {
            InsertOutcome::Inserted => {
                tracing::info!(identity, dim = profile.embedding.dim(), "student enrolled");
                Ok(EnrollOutcome::Enrolled {
                    identity: profile.identity,
                    faces_detected: 1,
                })
            }
            InsertOutcome::AlreadyExists => {
                // Lost a race with a concurrent enrollment of the same name.
                let token = book.open(identity, profile.embedding, now);
                tracing::warn!(identity, %token, "concurrent enrollment detected; overwrite awaits confirmation");
                Ok(EnrollOutcome::ConflictRequiresConfirmation { identity: profile.identity, token })
            }
        }
    }

    /// Replace the stored embedding of an enrolled student.
    pub fn update_face<S: EmbeddingStore + ?Sized>(
        &mut self,
        store: &S,
        identity: &str,
        image: &RgbImage,
    ) -> Result<(), WorkflowError> {
        let face = self.locate_single(image)?;

        if store.find(identity)?.is_none() {
            return Err(WorkflowError::StudentNotFound(identity.to_string()));
        }

        let embedding = self.encode(image, &face)?;
        if !store.replace_embedding(identity, &embedding)? {
            return Err(WorkflowError::StudentNotFound(identity.to_string()));
        }

        tracing::info!(identity, "facial data updated");
        Ok(())
    }

    /// Recognize every face in `image` and record attendance for matches.
    ///
    /// Results come back in detection order, one per face. A ledger failure
    /// for one face is captured in its [`FaceOutcome`] and does not stop the
    /// remaining faces.
    pub fn recognize<S, G>(
        &mut self,
        store: &S,
        ledger: &G,
        image: &RgbImage,
        now: NaiveDateTime,
    ) -> Result<Vec<FaceOutcome>, WorkflowError>
    where
        S: EmbeddingStore + ?Sized,
        G: AttendanceLedger + ?Sized,
    {
        let faces = self.locator.locate(image)?;
        if faces.is_empty() {
            return Err(WorkflowError::NoFaceDetected);
        }

        let gallery = store.snapshot()?;
        let today = now.date();
        let time = truncate_to_seconds(now.time());
        let time_str = time.format("%H:%M:%S").to_string();

        let mut outcomes = Vec::with_capacity(faces.len());
        for (index, face) in faces.iter().enumerate() {
            let probe = self.encode(image, face)?;
            let matched = self.matcher.compare(&probe, &gallery, self.threshold);

            let ledger_write = match matched.label.identity() {
                None => LedgerWrite::Skipped,
                Some(identity) => match ledger.upsert(identity, today, time) {
                    Ok(UpsertOutcome::Created) => LedgerWrite::Created,
                    Ok(UpsertOutcome::Updated) => LedgerWrite::Updated,
                    Err(e) => {
                        tracing::warn!(face = index, identity, error = %e, "attendance write failed");
                        LedgerWrite::Failed(e.to_string())
                    }
                },
            };

            tracing::debug!(
                face = index,
                label = matched.label.as_str(),
                distance = ?matched.best_distance,
                "face matched"
            );

            outcomes.push(FaceOutcome {
                result: RecognitionResult {
                    label: matched.label,
                    bbox: face.pixel_rect(image.width(), image.height()),
                    time: time_str.clone(),
                },
                ledger: ledger_write,
            });
        }

        let known = outcomes.iter().filter(|o| o.result.label != Label::Unknown).count();
        tracing::info!(faces = outcomes.len(), known, gallery = gallery.len(), "recognition complete");
        Ok(outcomes)
    }

    fn locate_single(&mut self, image: &RgbImage) -> Result<BoundingBox, WorkflowError> {
        let mut faces = self.locator.locate(image)?;
        match faces.len() {
            0 => Err(WorkflowError::NoFaceDetected),
            1 => Ok(faces.remove(0)),
            count => Err(WorkflowError::MultipleFacesDetected { count }),
        }
    }

    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, WorkflowError> {
        let crop = crop_face(image, face);
        let embedding = self.encoder.encode(&crop)?;
        if embedding.values.is_empty() {
            return Err(CollaboratorError::Encoding("encoder returned an empty embedding".into()).into());
        }
        // NaN and infinity do not round-trip through the JSON embedding column.
        if !embedding.values.iter().all(|v| v.is_finite()) {
            return Err(CollaboratorError::Encoding("encoder returned a non-finite embedding".into()).into());
        }
        Ok(embedding)
    }
}

/// Apply a pending overwrite: replace the stored embedding and mark the
/// confirmation confirmed. Returns the identity that was updated.
///
/// If the store write fails the confirmation stays pending.
pub fn confirm_update<S: EmbeddingStore + ?Sized>(
    store: &S,
    book: &mut ConfirmationBook,
    token: Uuid,
    now: NaiveDateTime,
) -> Result<String, WorkflowError> {
    let pending = book.pending(token, now)?;
    let identity = pending.identity.clone();

    if !store.replace_embedding(&identity, &pending.embedding)? {
        book.resolve(token, ConfirmationState::Rejected, now)?;
        return Err(WorkflowError::StudentNotFound(identity));
    }

    book.resolve(token, ConfirmationState::Confirmed, now)?;
    tracing::info!(identity = %identity, %token, "facial data overwritten after confirmation");
    Ok(identity)
}

/// Discard a pending overwrite. Returns the identity it was for.
pub fn reject_update(
    book: &mut ConfirmationBook,
    token: Uuid,
    now: NaiveDateTime,
) -> Result<String, WorkflowError> {
    let resolved = book.resolve(token, ConfirmationState::Rejected, now)?;
    Ok(resolved.identity)
}

fn truncate_to_seconds(time: NaiveTime) -> NaiveTime {
    time.with_nanosecond(0).unwrap_or(time)
}
