use crate::api;
use crate::engine::EngineHandle;
use rollcall_core::{ContactInfo, EnrollRequest};
use zbus::interface;

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Every method returns a JSON document with a `status` field; failures are
/// reported in-band rather than as D-Bus errors.
pub struct AttendanceService {
    pub engine: EngineHandle,
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll a student from a single-face image (data URL or bare base64).
    async fn enroll(&self, name: &str, mobile: &str, email: &str, image: &str) -> String {
        tracing::info!(name, "enroll requested");
        let request = EnrollRequest {
            identity: name.to_string(),
            contact: ContactInfo { mobile: api::optional(mobile), email: api::optional(email) },
        };
        api::enroll_reply(self.engine.enroll(request, image.to_string()).await)
    }

    /// Apply the overwrite named by a confirmation token from `Enroll`.
    async fn confirm_update(&self, token: &str) -> String {
        tracing::info!(token, "confirm_update requested");
        let result = match api::parse_token(token) {
            Ok(token) => self.engine.confirm_update(token).await,
            Err(e) => Err(e),
        };
        api::confirm_reply(result)
    }

    async fn reject_update(&self, token: &str) -> String {
        tracing::info!(token, "reject_update requested");
        let result = match api::parse_token(token) {
            Ok(token) => self.engine.reject_update(token).await,
            Err(e) => Err(e),
        };
        api::reject_reply(result)
    }

    async fn update_face(&self, name: &str, image: &str) -> String {
        tracing::info!(name, "update_face requested");
        api::update_face_reply(name, self.engine.update_face(name.to_string(), image.to_string()).await)
    }

    /// Recognize every face in the image and record attendance for matches.
    async fn recognize(&self, image: &str) -> String {
        tracing::debug!(bytes = image.len(), "recognize requested");
        api::recognize_reply(self.engine.recognize(image.to_string()).await)
    }

    async fn verify_password(&self, password: &str) -> String {
        api::verify_reply(self.engine.verify_password(password.to_string()).await)
    }

    async fn update_password(&self, old_password: &str, new_password: &str) -> String {
        tracing::info!("update_password requested");
        api::update_password_reply(
            self.engine
                .update_password(old_password.to_string(), new_password.to_string())
                .await,
        )
    }

    async fn list_students(&self) -> String {
        api::students_reply(self.engine.list_students().await)
    }

    /// Attendance for a `YYYY-MM-DD` date; empty means today.
    async fn attendance(&self, date: &str) -> String {
        let result = match api::parse_date(date) {
            Ok(date) => self.engine.attendance(date).await,
            Err(e) => Err(e),
        };
        api::attendance_reply(result)
    }

    async fn status(&self) -> String {
        api::status_reply(self.engine.status().await)
    }
}
