//! rollcall-core: attendance matching engine.
//!
//! Owns the domain model (students, attendance records, embeddings), the
//! nearest-embedding matcher, and the enrollment / recognition workflows.
//! Face detection and embedding extraction are plugged in through the
//! [`FaceLocator`] and [`FaceEncoder`] traits; persistence through
//! [`EmbeddingStore`] and [`AttendanceLedger`].

pub mod confirmation;
pub mod imaging;
pub mod matcher;
pub mod pipeline;
pub mod store;
pub mod types;
pub mod workflow;

#[cfg(any(test, feature = "test-support"))]
#[doc(hidden)]
pub mod fakes;

pub use confirmation::{
    ConfirmationBook, ConfirmationError, ConfirmationState, PendingConfirmation,
};
pub use imaging::{decode_data_url, ImageInputError};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_DISTANCE_THRESHOLD};
pub use pipeline::{CollaboratorError, FaceCrop, FaceEncoder, FaceLocator};
pub use store::{AttendanceLedger, EmbeddingStore, InsertOutcome, StoreError, UpsertOutcome};
pub use types::{
    AttendanceRecord, BoundingBox, ContactInfo, Embedding, GalleryEntry, Label,
    RecognitionResult, StudentProfile, UNKNOWN_LABEL,
};
pub use workflow::{
    confirm_update, reject_update, EnrollOutcome, EnrollRequest, FaceOutcome, LedgerWrite,
    WorkflowError, Workflows,
};
