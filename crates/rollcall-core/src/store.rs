//! Persistence seams for the embedding store and attendance ledger.
//!
//! Methods take `&self`; implementations are responsible for their own
//! interior mutability and per-call transactions.

use crate::types::{AttendanceRecord, Embedding, GalleryEntry, StudentProfile};
use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("persistence failure: {0}")]
    Backend(String),
    #[error("corrupt stored embedding for '{identity}': {reason}")]
    CorruptEmbedding { identity: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A profile with this identity already exists; nothing was written.
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Durable identity → embedding mapping.
pub trait EmbeddingStore {
    fn find(&self, identity: &str) -> Result<Option<StudentProfile>, StoreError>;

    /// Insert a new profile. Must not overwrite an existing identity.
    fn insert(&self, profile: &StudentProfile) -> Result<InsertOutcome, StoreError>;

    /// Replace the embedding of an existing profile wholesale.
    ///
    /// Returns `false` if the identity is not enrolled.
    fn replace_embedding(&self, identity: &str, embedding: &Embedding) -> Result<bool, StoreError>;

    /// All enrolled embeddings, ordered by identity.
    fn snapshot(&self) -> Result<Vec<GalleryEntry>, StoreError>;

    /// All enrolled profiles, ordered by identity.
    fn list(&self) -> Result<Vec<StudentProfile>, StoreError>;
}

/// Durable per-(identity, date) attendance records.
pub trait AttendanceLedger {
    /// Create the record with `first_seen = last_seen = time`, or set
    /// `last_seen = time` if one exists for (identity, date).
    fn upsert(&self, identity: &str, date: NaiveDate, time: NaiveTime)
        -> Result<UpsertOutcome, StoreError>;

    fn record(&self, identity: &str, date: NaiveDate) -> Result<Option<AttendanceRecord>, StoreError>;

    /// All records for a date, ordered by identity.
    fn records_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError>;
}
