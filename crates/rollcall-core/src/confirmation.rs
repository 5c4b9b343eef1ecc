//! Two-step confirmation for overwriting an enrolled face.
//!
//! Re-enrolling an existing identity never overwrites it. Instead a
//! [`PendingConfirmation`] is opened holding the candidate embedding, and the
//! caller resolves it explicitly:
//!
//! ```text
//! PendingConfirmation --confirm--> Confirmed
//!                     --reject---> Rejected
//!                     --ttl------> Expired
//! ```

use crate::types::Embedding;
use chrono::{Duration, NaiveDateTime};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationState {
    PendingConfirmation,
    Confirmed,
    Rejected,
    Expired,
}

impl ConfirmationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationState::PendingConfirmation => "pending",
            ConfirmationState::Confirmed => "confirmed",
            ConfirmationState::Rejected => "rejected",
            ConfirmationState::Expired => "expired",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfirmationError {
    #[error("no pending confirmation with token {0}")]
    NotFound(Uuid),
    #[error("confirmation {token} is already {}", .state.as_str())]
    Closed { token: Uuid, state: ConfirmationState },
}

#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub token: Uuid,
    pub identity: String,
    pub embedding: Embedding,
    pub opened_at: NaiveDateTime,
    pub state: ConfirmationState,
    pub resolved_at: Option<NaiveDateTime>,
}

/// In-memory book of open and recently resolved confirmations.
pub struct ConfirmationBook {
    ttl: Duration,
    entries: HashMap<Uuid, PendingConfirmation>,
}

impl ConfirmationBook {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: HashMap::new() }
    }

    /// Open a confirmation for `identity`, superseding any still-pending one.
    pub fn open(
        &mut self,
        identity: &str,
        embedding: Embedding,
        now: NaiveDateTime,
    ) -> Uuid {
        self.sweep(now);

        for entry in self.entries.values_mut() {
            if entry.identity == identity && entry.state == ConfirmationState::PendingConfirmation {
                tracing::info!(token = %entry.token, identity, "superseding pending confirmation");
                entry.state = ConfirmationState::Rejected;
                entry.resolved_at = Some(now);
            }
        }

        let token = Uuid::new_v4();
        self.entries.insert(
            token,
            PendingConfirmation {
                token,
                identity: identity.to_string(),
                embedding,
                opened_at: now,
                state: ConfirmationState::PendingConfirmation,
                resolved_at: None,
            },
        );
        token
    }

    /// Look up a confirmation that is still awaiting a decision.
    pub fn pending(
        &mut self,
        token: Uuid,
        now: NaiveDateTime,
    ) -> Result<&PendingConfirmation, ConfirmationError> {
        self.sweep(now);
        let entry = self.entries.get(&token).ok_or(ConfirmationError::NotFound(token))?;
        if entry.state != ConfirmationState::PendingConfirmation {
            return Err(ConfirmationError::Closed { token, state: entry.state });
        }
        Ok(entry)
    }

    /// Move a pending confirmation into a terminal state.
    pub fn resolve(
        &mut self,
        token: Uuid,
        state: ConfirmationState,
        now: NaiveDateTime,
    ) -> Result<PendingConfirmation, ConfirmationError> {
        self.pending(token, now)?;
        let entry = self.entries.get_mut(&token).ok_or(ConfirmationError::NotFound(token))?;
        entry.state = state;
        entry.resolved_at = Some(now);
        tracing::info!(%token, identity = %entry.identity, state = state.as_str(), "confirmation resolved");
        Ok(entry.clone())
    }

    pub fn state(&self, token: Uuid) -> Option<ConfirmationState> {
        self.entries.get(&token).map(|e| e.state)
    }

    /// Expire stale pending entries and forget resolved ones older than the TTL.
    fn sweep(&mut self, now: NaiveDateTime) {
        let ttl = self.ttl;
        for entry in self.entries.values_mut() {
            if entry.state == ConfirmationState::PendingConfirmation && now - entry.opened_at > ttl {
                entry.state = ConfirmationState::Expired;
                entry.resolved_at = Some(entry.opened_at + ttl);
            }
        }
        self.entries.retain(|_, e| match e.resolved_at {
            Some(at) => now - at <= ttl,
            None => true,
        });
    }
}
