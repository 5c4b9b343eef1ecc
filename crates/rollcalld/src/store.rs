//! SQLite-backed embedding store and attendance ledger.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rollcall_core::{
    AttendanceLedger, AttendanceRecord, ContactInfo, Embedding, EmbeddingStore, GalleryEntry,
    InsertOutcome, StoreError, StudentProfile, UpsertOutcome,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS students (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        mobile TEXT,
        email TEXT,
        embedding TEXT NOT NULL,
        model_version TEXT,
        enrolled_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS attendance (
        id INTEGER PRIMARY KEY,
        student TEXT NOT NULL,
        date TEXT NOT NULL,
        intime TEXT NOT NULL,
        outtime TEXT NOT NULL,
        UNIQUE (student, date)
    );
";

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// True for a UNIQUE / PRIMARY KEY violation, as opposed to other constraint
/// failures such as CHECK or trigger aborts.
fn is_unique_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => {
            err.code == ErrorCode::ConstraintViolation
                && matches!(
                    err.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        }
        _ => false,
    }
}

/// Students and attendance in one SQLite database.
///
/// Every write runs in its own transaction; an error drops the transaction
/// uncommitted, which rolls it back.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(backend)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(backend)?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened attendance database");
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self { conn })
    }

    /// Number of enrolled students, without decoding any embedding.
    pub fn student_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))
            .map_err(backend)?;
        Ok(count as usize)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<RawProfile> {
        Ok(RawProfile {
            name: row.get(0)?,
            mobile: row.get(1)?,
            email: row.get(2)?,
            embedding: row.get(3)?,
            model_version: row.get(4)?,
            enrolled_at: row.get(5)?,
        })
    }

    fn query_profiles(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<StudentProfile>, StoreError> {
        let mut stmt = self.conn.prepare(sql).map_err(backend)?;
        let rows = stmt.query_map(args, Self::profile_from_row).map_err(backend)?;
        rows.map(|r| r.map_err(backend)?.into_profile()).collect()
    }
}

/// Row shape before decoding the embedding and timestamps.
struct RawProfile {
    name: String,
    mobile: Option<String>,
    email: Option<String>,
    embedding: String,
    model_version: Option<String>,
    enrolled_at: String,
}

impl RawProfile {
    fn into_profile(self) -> Result<StudentProfile, StoreError> {
        let values: Vec<f32> =
            serde_json::from_str(&self.embedding).map_err(|e| StoreError::CorruptEmbedding {
                identity: self.name.clone(),
                reason: e.to_string(),
            })?;
        if values.is_empty() {
            return Err(StoreError::CorruptEmbedding {
                identity: self.name,
                reason: "embedding is empty".into(),
            });
        }
        let enrolled_at = NaiveDateTime::parse_from_str(&self.enrolled_at, TIMESTAMP_FORMAT)
            .map_err(|e| StoreError::Backend(format!("bad enrolled_at for '{}': {e}", self.name)))?;

        Ok(StudentProfile {
            identity: self.name,
            contact: ContactInfo { mobile: self.mobile, email: self.email },
            embedding: Embedding { values, model_version: self.model_version },
            enrolled_at,
        })
    }
}

fn encode_embedding(embedding: &Embedding) -> Result<String, StoreError> {
    serde_json::to_string(&embedding.values).map_err(|e| StoreError::Backend(e.to_string()))
}

const PROFILE_COLUMNS: &str = "name, mobile, email, embedding, model_version, enrolled_at";

impl EmbeddingStore for SqliteStore {
    fn find(&self, identity: &str) -> Result<Option<StudentProfile>, StoreError> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM students WHERE name = ?1");
        let raw = self
            .conn
            .query_row(&sql, [identity], Self::profile_from_row)
            .optional()
            .map_err(backend)?;
        raw.map(RawProfile::into_profile).transpose()
    }

    fn insert(&self, profile: &StudentProfile) -> Result<InsertOutcome, StoreError> {
        let tx = self.conn.unchecked_transaction().map_err(backend)?;
        let inserted = tx.execute(
            "INSERT INTO students (name, mobile, email, embedding, model_version, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                profile.identity,
                profile.contact.mobile,
                profile.contact.email,
                encode_embedding(&profile.embedding)?,
                profile.embedding.model_version,
                profile.enrolled_at.format(TIMESTAMP_FORMAT).to_string(),
            ],
        );
        match inserted {
            Ok(_) => {
                tx.commit().map_err(backend)?;
                Ok(InsertOutcome::Inserted)
            }
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::AlreadyExists),
            Err(e) => Err(backend(e)),
        }
    }

    fn replace_embedding(&self, identity: &str, embedding: &Embedding) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction().map_err(backend)?;
        let changed = tx
            .execute(
                "UPDATE students SET embedding = ?1, model_version = ?2 WHERE name = ?3",
                params![encode_embedding(embedding)?, embedding.model_version, identity],
            )
            .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(changed == 1)
    }

    fn snapshot(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .map(|p| GalleryEntry { identity: p.identity, embedding: p.embedding })
            .collect())
    }

    fn list(&self) -> Result<Vec<StudentProfile>, StoreError> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM students ORDER BY name");
        self.query_profiles(&sql, [])
    }
}

impl AttendanceLedger for SqliteStore {
    /// Insert first; on a (student, date) unique violation fall back to
    /// updating `outtime`. Both statements share one transaction.
    fn upsert(
        &self,
        identity: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<UpsertOutcome, StoreError> {
        let date = date.format(DATE_FORMAT).to_string();
        let time = time.format(TIME_FORMAT).to_string();

        let tx = self.conn.unchecked_transaction().map_err(backend)?;
        let inserted = tx.execute(
            "INSERT INTO attendance (student, date, intime, outtime) VALUES (?1, ?2, ?3, ?3)",
            params![identity, date, time],
        );
        let outcome = match inserted {
            Ok(_) => UpsertOutcome::Created,
            Err(e) if is_unique_violation(&e) => {
                let changed = tx
                    .execute(
                        "UPDATE attendance SET outtime = ?3 WHERE student = ?1 AND date = ?2",
                        params![identity, date, time],
                    )
                    .map_err(backend)?;
                if changed != 1 {
                    return Err(StoreError::Backend(format!(
                        "attendance row for '{identity}' on {date} disappeared during update"
                    )));
                }
                UpsertOutcome::Updated
            }
            Err(e) => return Err(backend(e)),
        };
        tx.commit().map_err(backend)?;
        Ok(outcome)
    }

    fn record(&self, identity: &str, date: NaiveDate) -> Result<Option<AttendanceRecord>, StoreError> {
        let raw = self
            .conn
            .query_row(
                "SELECT student, date, intime, outtime FROM attendance WHERE student = ?1 AND date = ?2",
                params![identity, date.format(DATE_FORMAT).to_string()],
                raw_record,
            )
            .optional()
            .map_err(backend)?;
        raw.map(parse_record).transpose()
    }

    fn records_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT student, date, intime, outtime FROM attendance
                 WHERE date = ?1 ORDER BY student",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([date.format(DATE_FORMAT).to_string()], raw_record)
            .map_err(backend)?;
        rows.map(|r| parse_record(r.map_err(backend)?)).collect()
    }
}

type RawRecord = (String, String, String, String);

fn raw_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn parse_record((identity, date, intime, outtime): RawRecord) -> Result<AttendanceRecord, StoreError> {
    let bad = |what: &str, e: chrono::ParseError| {
        StoreError::Backend(format!("bad {what} in attendance for '{identity}': {e}"))
    };
    Ok(AttendanceRecord {
        date: NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|e| bad("date", e))?,
        first_seen: NaiveTime::parse_from_str(&intime, TIME_FORMAT).map_err(|e| bad("intime", e))?,
        last_seen: NaiveTime::parse_from_str(&outtime, TIME_FORMAT).map_err(|e| bad("outtime", e))?,
        identity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, values: Vec<f32>) -> StudentProfile {
        StudentProfile {
            identity: name.into(),
            contact: ContactInfo { mobile: None, email: Some(format!("{name}@school.test")) },
            embedding: Embedding { values, model_version: Some("w600k_r50".into()) },
            enrolled_at: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(8, 0, 0).unwrap(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_insert_and_find() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = profile("Alice", vec![0.25, -0.5, 1.0]);
        assert_eq!(store.insert(&alice).unwrap(), InsertOutcome::Inserted);

        let found = store.find("Alice").unwrap().unwrap();
        assert_eq!(found, alice);
        assert!(store.find("alice").unwrap().is_none(), "lookup is case-sensitive");
    }

    #[test]
    fn test_insert_duplicate_leaves_original() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&profile("Alice", vec![1.0])).unwrap();
        assert_eq!(
            store.insert(&profile("Alice", vec![2.0])).unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(store.find("Alice").unwrap().unwrap().embedding.values, vec![1.0]);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_replace_embedding() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&profile("Alice", vec![1.0, 1.0])).unwrap();

        let replacement = Embedding { values: vec![0.5, 0.5], model_version: None };
        assert!(store.replace_embedding("Alice", &replacement).unwrap());
        assert!(!store.replace_embedding("Bob", &replacement).unwrap());

        let found = store.find("Alice").unwrap().unwrap();
        assert_eq!(found.embedding, replacement);
        assert!(store.find("Bob").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_sorted_by_identity() {
        let store = SqliteStore::open_in_memory().unwrap();
        for name in ["carol", "Bob", "alice"] {
            store.insert(&profile(name, vec![1.0])).unwrap();
        }
        let names: Vec<String> = store.snapshot().unwrap().into_iter().map(|e| e.identity).collect();
        assert_eq!(names, vec!["Bob", "alice", "carol"]);
    }

    #[test]
    fn test_corrupt_embedding_is_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&profile("Alice", vec![1.0])).unwrap();
        store
            .connection()
            .execute("UPDATE students SET embedding = 'not json' WHERE name = 'Alice'", [])
            .unwrap();
        assert!(matches!(
            store.find("Alice"),
            Err(StoreError::CorruptEmbedding { identity, .. }) if identity == "Alice"
        ));
        assert_eq!(store.student_count().unwrap(), 1);
    }

    #[test]
    fn test_upsert_creates_then_updates() {
        let store = SqliteStore::open_in_memory().unwrap();

        assert_eq!(store.upsert("Alice", day(), hms(9, 0, 0)).unwrap(), UpsertOutcome::Created);
        let record = store.record("Alice", day()).unwrap().unwrap();
        assert_eq!(record.first_seen, hms(9, 0, 0));
        assert_eq!(record.last_seen, hms(9, 0, 0));

        assert_eq!(store.upsert("Alice", day(), hms(15, 30, 5)).unwrap(), UpsertOutcome::Updated);
        let record = store.record("Alice", day()).unwrap().unwrap();
        assert_eq!(record.first_seen, hms(9, 0, 0));
        assert_eq!(record.last_seen, hms(15, 30, 5));

        let count: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM attendance", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_records_for_date() {
        let store = SqliteStore::open_in_memory().unwrap();
        let next = day().succ_opt().unwrap();
        store.upsert("Bob", day(), hms(9, 0, 0)).unwrap();
        store.upsert("Alice", day(), hms(9, 5, 0)).unwrap();
        store.upsert("Alice", next, hms(9, 1, 0)).unwrap();

        let records = store.records_for_date(day()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].identity, "Alice");
        assert_eq!(records[1].identity, "Bob");
        assert_eq!(store.records_for_date(next).unwrap().len(), 1);
    }

    #[test]
    fn test_trigger_abort_is_not_treated_as_duplicate() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_bob BEFORE INSERT ON attendance
                 WHEN NEW.student = 'Bob'
                 BEGIN SELECT RAISE(ABORT, 'ledger offline'); END;",
            )
            .unwrap();

        assert!(matches!(
            store.upsert("Bob", day(), hms(9, 0, 0)),
            Err(StoreError::Backend(_))
        ));
        assert!(store.record("Bob", day()).unwrap().is_none());
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("attendance.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert(&profile("Alice", vec![1.0, 2.0])).unwrap();
            store.upsert("Alice", day(), hms(8, 30, 0)).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.find("Alice").unwrap().unwrap().embedding.values, vec![1.0, 2.0]);
        assert!(store.record("Alice", day()).unwrap().is_some());
    }
}
