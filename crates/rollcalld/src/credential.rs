//! Admin credential store: a single salted Argon2 hash in SQLite.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Old password is incorrect")]
    InvalidCredentials,
    #[error("new password must not be empty")]
    EmptyPassword,
    #[error("admin credential has not been initialized")]
    NotInitialized,
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("credential storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("cannot prepare credential directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Verifies and rotates the admin password.
pub trait CredentialStore {
    fn verify(&self, password: &str) -> Result<bool, AuthError>;

    /// Replace the password. Fails with [`AuthError::InvalidCredentials`]
    /// unless `old` verifies.
    fn update(&self, old: &str, new: &str) -> Result<(), AuthError>;
}

pub struct SqliteCredentialStore {
    conn: Connection,
}

impl SqliteCredentialStore {
    pub fn open(path: &Path) -> Result<Self, AuthError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, AuthError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AuthError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS admin_credential (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                password_hash TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    /// Install `default_password` if no credential exists yet.
    ///
    /// Returns `true` when a credential was created. Safe to call on every
    /// startup.
    pub fn bootstrap(&self, default_password: &str) -> Result<bool, AuthError> {
        if self.stored_hash()?.is_some() {
            return Ok(false);
        }
        let hash = hash_password(default_password)?;
        let created = self.conn.execute(
            "INSERT OR IGNORE INTO admin_credential (id, password_hash) VALUES (1, ?1)",
            params![hash],
        )?;
        if created == 1 {
            tracing::warn!("installed default admin password; change it with UpdatePassword");
        }
        Ok(created == 1)
    }

    fn stored_hash(&self) -> Result<Option<String>, AuthError> {
        Ok(self
            .conn
            .query_row("SELECT password_hash FROM admin_credential WHERE id = 1", [], |r| r.get(0))
            .optional()?)
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn verify(&self, password: &str) -> Result<bool, AuthError> {
        let stored = self.stored_hash()?.ok_or(AuthError::NotInitialized)?;
        verify_password(password, &stored)
    }

    fn update(&self, old: &str, new: &str) -> Result<(), AuthError> {
        let stored = self.stored_hash()?.ok_or(AuthError::NotInitialized)?;
        if !verify_password(old, &stored)? {
            return Err(AuthError::InvalidCredentials);
        }
        if new.is_empty() {
            return Err(AuthError::EmptyPassword);
        }

        let hash = hash_password(new)?;
        // Compare-and-swap so a concurrent change between verify and write loses.
        let changed = self.conn.execute(
            "UPDATE admin_credential SET password_hash = ?1 WHERE id = 1 AND password_hash = ?2",
            params![hash, stored],
        )?;
        if changed != 1 {
            return Err(AuthError::InvalidCredentials);
        }
        tracing::info!("admin password updated");
        Ok(())
    }
}

fn hash_password(plain: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| {
            tracing::error!(error = %e, "argon2 hash_password error");
            AuthError::Hash(e.to_string())
        })
}

fn verify_password(plain: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        tracing::error!(error = %e, "stored admin hash is not a valid PHC string");
        AuthError::Hash(e.to_string())
    })?;
    Ok(Argon2::default().verify_password(plain.as_bytes(), &parsed).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteCredentialStore {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        store.bootstrap("admin123").unwrap();
        store
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        assert!(store.bootstrap("admin123").unwrap());
        assert!(!store.bootstrap("something-else").unwrap());
        assert!(store.verify("admin123").unwrap());
        assert!(!store.verify("something-else").unwrap());
    }

    #[test]
    fn test_hash_is_salted_not_plaintext() {
        let store = store();
        let stored = store.stored_hash().unwrap().unwrap();
        assert!(stored.starts_with("$argon2"));
        assert!(!stored.contains("admin123"));
    }

    #[test]
    fn test_verify_before_bootstrap() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        assert!(matches!(store.verify("admin123"), Err(AuthError::NotInitialized)));
    }

    #[test]
    fn test_update_requires_old_password() {
        let store = store();
        assert!(matches!(
            store.update("wrong", "new-secret"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(store.verify("admin123").unwrap());
    }

    #[test]
    fn test_update_replaces_password() {
        let store = store();
        store.update("admin123", "new-secret").unwrap();
        assert!(store.verify("new-secret").unwrap());
        assert!(!store.verify("admin123").unwrap());
    }

    #[test]
    fn test_update_rejects_empty_password() {
        let store = store();
        assert!(matches!(store.update("admin123", ""), Err(AuthError::EmptyPassword)));
        assert!(store.verify("admin123").unwrap());
    }

    #[test]
    fn test_bootstrap_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin.db");
        {
            let store = SqliteCredentialStore::open(&path).unwrap();
            store.bootstrap("admin123").unwrap();
            store.update("admin123", "rotated").unwrap();
        }
        let store = SqliteCredentialStore::open(&path).unwrap();
        assert!(!store.bootstrap("admin123").unwrap());
        assert!(store.verify("rotated").unwrap());
    }
}
