//! JSON replies for the D-Bus surface.
//!
//! Every reply is an object carrying an HTTP-equivalent `status` next to
//! its payload, so clients can treat the daemon like the web API it
//! replaces.

use crate::engine::{AttendanceDay, EngineError, StatusReport};
use chrono::NaiveDate;
use rollcall_core::{EnrollOutcome, FaceOutcome, StudentProfile};
use serde_json::{json, Value};
use uuid::Uuid;

const TIME_FORMAT: &str = "%H:%M:%S";

fn with_status(status: u16, mut body: Value) -> String {
    if let Value::Object(map) = &mut body {
        map.insert("status".into(), status.into());
    }
    body.to_string()
}

pub fn error_reply(err: &EngineError) -> String {
    with_status(err.status(), json!({ "error": err.to_string() }))
}

fn reply<T>(result: Result<T, EngineError>, ok: impl FnOnce(T) -> Value) -> String {
    match result {
        Ok(value) => with_status(200, ok(value)),
        Err(e) => error_reply(&e),
    }
}

/// `""` means today.
pub fn parse_date(raw: &str) -> Result<Option<NaiveDate>, EngineError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| EngineError::InvalidDate(raw.to_string()))
}

pub fn parse_token(raw: &str) -> Result<Uuid, EngineError> {
    Uuid::parse_str(raw.trim()).map_err(|_| EngineError::InvalidToken(raw.to_string()))
}

/// Empty D-Bus strings stand in for absent optional fields.
pub fn optional(raw: &str) -> Option<String> {
    let raw = raw.trim();
    (!raw.is_empty()).then(|| raw.to_string())
}

pub fn enroll_reply(result: Result<EnrollOutcome, EngineError>) -> String {
    reply(result, |outcome| match outcome {
        EnrollOutcome::Enrolled { identity, faces_detected } => json!({
            "message": format!("Student '{identity}' enrolled successfully."),
            "faces_detected": faces_detected,
            "updated": false,
        }),
        EnrollOutcome::ConflictRequiresConfirmation { identity, token } => json!({
            "message": format!("Student '{identity}' already exists. Do you want to update facial data?"),
            "student_exists": true,
            "confirmation_token": token.to_string(),
        }),
    })
}

pub fn confirm_reply(result: Result<String, EngineError>) -> String {
    reply(result, |identity| {
        json!({
            "message": format!("Facial data for student '{identity}' updated successfully."),
            "updated": true,
        })
    })
}

pub fn reject_reply(result: Result<String, EngineError>) -> String {
    reply(result, |identity| {
        json!({
            "message": format!("Facial data for student '{identity}' left unchanged."),
            "updated": false,
        })
    })
}

pub fn update_face_reply(identity: &str, result: Result<(), EngineError>) -> String {
    reply(result, |()| {
        json!({
            "message": format!("Facial data for student '{identity}' updated successfully."),
            "updated": true,
        })
    })
}

pub fn recognize_reply(result: Result<Vec<FaceOutcome>, EngineError>) -> String {
    reply(result, |faces| {
        let faces: Vec<_> = faces.into_iter().map(|f| f.result).collect();
        json!({ "faces": faces })
    })
}

/// A wrong password is reported as 401 with `success: false`.
pub fn verify_reply(result: Result<bool, EngineError>) -> String {
    match result {
        Ok(true) => with_status(200, json!({ "success": true })),
        Ok(false) => with_status(401, json!({ "success": false })),
        Err(e) => error_reply(&e),
    }
}

pub fn update_password_reply(result: Result<(), EngineError>) -> String {
    reply(result, |()| json!({ "message": "Password updated successfully!" }))
}

pub fn students_reply(result: Result<Vec<StudentProfile>, EngineError>) -> String {
    reply(result, |students| {
        let students: Vec<_> = students
            .into_iter()
            .map(|s| {
                json!({
                    "name": s.identity,
                    "mobile": s.contact.mobile,
                    "email": s.contact.email,
                })
            })
            .collect();
        json!({ "students": students })
    })
}

pub fn attendance_reply(result: Result<AttendanceDay, EngineError>) -> String {
    reply(result, |day| {
        let records: Vec<_> = day
            .records
            .into_iter()
            .map(|r| {
                json!({
                    "name": r.identity,
                    "date": r.date.to_string(),
                    "intime": r.first_seen.format(TIME_FORMAT).to_string(),
                    "outtime": r.last_seen.format(TIME_FORMAT).to_string(),
                })
            })
            .collect();
        json!({ "date": day.date.to_string(), "records": records })
    })
}

pub fn status_reply(result: Result<StatusReport, EngineError>) -> String {
    reply(result, |report| {
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "threshold": report.distance_threshold,
            "students": report.students,
        })
    })
}
