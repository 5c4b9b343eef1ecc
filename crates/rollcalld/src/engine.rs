use crate::config::Config;
use crate::credential::{AuthError, CredentialStore};
use crate::store::SqliteStore;
use chrono::{Local, NaiveDate, NaiveDateTime};
use image::RgbImage;
use rollcall_core::{
    confirm_update, decode_data_url, reject_update, AttendanceLedger, AttendanceRecord,
    ConfirmationBook, ConfirmationError, EmbeddingStore, EnrollOutcome, EnrollRequest,
    EuclideanMatcher, FaceEncoder, FaceLocator, FaceOutcome, StoreError, StudentProfile,
    WorkflowError, Workflows,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid date '{0}': expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("confirmation token '{0}' not recognized")]
    InvalidToken(String),
    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl EngineError {
    /// HTTP-equivalent status code reported to clients.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::Workflow(e) => match e {
                WorkflowError::NoFaceDetected
                | WorkflowError::MultipleFacesDetected { .. }
                | WorkflowError::InvalidIdentity
                | WorkflowError::InvalidImage(_) => 400,
                WorkflowError::StudentNotFound(_) => 404,
                WorkflowError::Confirmation(ConfirmationError::NotFound(_)) => 404,
                WorkflowError::Confirmation(ConfirmationError::Closed { .. }) => 409,
                WorkflowError::Collaborator(_) | WorkflowError::Persistence(_) => 500,
            },
            EngineError::Auth(AuthError::InvalidCredentials) => 401,
            EngineError::Auth(AuthError::EmptyPassword) => 400,
            EngineError::Auth(_) => 500,
            EngineError::Store(_) => 500,
            EngineError::InvalidDate(_) => 400,
            EngineError::InvalidToken(_) => 404,
            EngineError::Timeout(_) => 504,
            EngineError::ChannelClosed => 503,
            EngineError::Spawn(_) => 500,
        }
    }
}

/// Runtime knobs for the engine thread.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub distance_threshold: f32,
    pub request_timeout: Duration,
    pub confirmation_ttl: chrono::Duration,
    pub max_image_bytes: usize,
    /// Source of "now" for attendance timestamps.
    pub clock: fn() -> NaiveDateTime,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            distance_threshold: config.distance_threshold,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            confirmation_ttl: chrono::Duration::seconds(config.confirmation_ttl_secs as i64),
            max_image_bytes: config.max_image_bytes,
            clock: local_now,
        }
    }
}

pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Attendance for one day.
#[derive(Debug, Clone)]
pub struct AttendanceDay {
    pub date: NaiveDate,
    pub records: Vec<AttendanceRecord>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub students: usize,
    pub distance_threshold: f32,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll { request: EnrollRequest, image: String, reply: Reply<EnrollOutcome> },
    ConfirmUpdate { token: Uuid, reply: Reply<String> },
    RejectUpdate { token: Uuid, reply: Reply<String> },
    UpdateFace { identity: String, image: String, reply: Reply<()> },
    Recognize { image: String, reply: Reply<Vec<FaceOutcome>> },
    ListStudents { reply: Reply<Vec<StudentProfile>> },
    Attendance { date: Option<NaiveDate>, reply: Reply<AttendanceDay> },
    VerifyPassword { password: String, reply: Reply<bool> },
    UpdatePassword { old: String, new: String, reply: Reply<()> },
    Status { reply: Reply<StatusReport> },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Send a request and wait for its reply, bounded by the request timeout.
    ///
    /// On timeout the engine still finishes the work; only the caller stops
    /// waiting.
    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(build(reply_tx))
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
    }

    pub async fn enroll(&self, request: EnrollRequest, image: String) -> Result<EnrollOutcome, EngineError> {
        self.call(|reply| EngineRequest::Enroll { request, image, reply }).await
    }

    pub async fn confirm_update(&self, token: Uuid) -> Result<String, EngineError> {
        self.call(|reply| EngineRequest::ConfirmUpdate { token, reply }).await
    }

    pub async fn reject_update(&self, token: Uuid) -> Result<String, EngineError> {
        self.call(|reply| EngineRequest::RejectUpdate { token, reply }).await
    }

    pub async fn update_face(&self, identity: String, image: String) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::UpdateFace { identity, image, reply }).await
    }

    pub async fn recognize(&self, image: String) -> Result<Vec<FaceOutcome>, EngineError> {
        self.call(|reply| EngineRequest::Recognize { image, reply }).await
    }

    pub async fn list_students(&self) -> Result<Vec<StudentProfile>, EngineError> {
        self.call(|reply| EngineRequest::ListStudents { reply }).await
    }

    /// Attendance for `date`, or for today when `None`.
    pub async fn attendance(&self, date: Option<NaiveDate>) -> Result<AttendanceDay, EngineError> {
        self.call(|reply| EngineRequest::Attendance { date, reply }).await
    }

    pub async fn verify_password(&self, password: String) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::VerifyPassword { password, reply }).await
    }

    pub async fn update_password(&self, old: String, new: String) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::UpdatePassword { old, new, reply }).await
    }

    pub async fn status(&self) -> Result<StatusReport, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the face pipeline, both stores and the confirmation book;
/// all blocking work (image decoding, inference, SQLite, password hashing)
/// happens there, one request at a time.
pub fn spawn_engine<L, E, C>(
    locator: L,
    encoder: E,
    store: SqliteStore,
    credentials: C,
    settings: EngineSettings,
) -> Result<EngineHandle, EngineError>
where
    L: FaceLocator + Send + 'static,
    E: FaceEncoder + Send + 'static,
    C: CredentialStore + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let timeout = settings.request_timeout;

    let mut engine = Engine {
        workflows: Workflows::new(locator, encoder, EuclideanMatcher, settings.distance_threshold),
        store,
        credentials,
        book: ConfirmationBook::new(settings.confirmation_ttl),
        max_image_bytes: settings.max_image_bytes,
        clock: settings.clock,
    };

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout })
}

struct Engine<L, E, C> {
    workflows: Workflows<L, E, EuclideanMatcher>,
    store: SqliteStore,
    credentials: C,
    book: ConfirmationBook,
    max_image_bytes: usize,
    clock: fn() -> NaiveDateTime,
}

impl<L: FaceLocator, E: FaceEncoder, C: CredentialStore> Engine<L, E, C> {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Enroll { request, image, reply } => {
                let result = self.enroll(request, &image);
                let _ = reply.send(logged("enroll", result));
            }
            EngineRequest::ConfirmUpdate { token, reply } => {
                let now = (self.clock)();
                let result = confirm_update(&self.store, &mut self.book, token, now).map_err(Into::into);
                let _ = reply.send(logged("confirm_update", result));
            }
            EngineRequest::RejectUpdate { token, reply } => {
                let now = (self.clock)();
                let result = reject_update(&mut self.book, token, now).map_err(Into::into);
                let _ = reply.send(logged("reject_update", result));
            }
            EngineRequest::UpdateFace { identity, image, reply } => {
                let result = self.update_face(&identity, &image);
                let _ = reply.send(logged("update_face", result));
            }
            EngineRequest::Recognize { image, reply } => {
                let result = self.recognize(&image);
                let _ = reply.send(logged("recognize", result));
            }
            EngineRequest::ListStudents { reply } => {
                let result = self.store.list().map_err(Into::into);
                let _ = reply.send(logged("list_students", result));
            }
            EngineRequest::Attendance { date, reply } => {
                let date = date.unwrap_or_else(|| (self.clock)().date());
                let result = self
                    .store
                    .records_for_date(date)
                    .map(|records| AttendanceDay { date, records })
                    .map_err(Into::into);
                let _ = reply.send(logged("attendance", result));
            }
            EngineRequest::VerifyPassword { password, reply } => {
                let result = self.credentials.verify(&password).map_err(Into::into);
                let _ = reply.send(logged("verify_password", result));
            }
            EngineRequest::UpdatePassword { old, new, reply } => {
                let result = self.credentials.update(&old, &new).map_err(Into::into);
                let _ = reply.send(logged("update_password", result));
            }
            EngineRequest::Status { reply } => {
                let result = self
                    .store
                    .student_count()
                    .map(|students| StatusReport {
                        students,
                        distance_threshold: self.workflows.threshold(),
                    })
                    .map_err(Into::into);
                let _ = reply.send(logged("status", result));
            }
        }
    }

    fn decode(&self, image: &str) -> Result<RgbImage, EngineError> {
        let decoded = decode_data_url(image, self.max_image_bytes).map_err(WorkflowError::from)?;
        tracing::debug!(width = decoded.width(), height = decoded.height(), "image decoded");
        Ok(decoded)
    }

    fn enroll(&mut self, request: EnrollRequest, image: &str) -> Result<EnrollOutcome, EngineError> {
        let image = self.decode(image)?;
        let now = (self.clock)();
        Ok(self.workflows.enroll(&self.store, &mut self.book, request, &image, now)?)
    }

    fn update_face(&mut self, identity: &str, image: &str) -> Result<(), EngineError> {
        let image = self.decode(image)?;
        Ok(self.workflows.update_face(&self.store, identity, &image)?)
    }

    fn recognize(&mut self, image: &str) -> Result<Vec<FaceOutcome>, EngineError> {
        let image = self.decode(image)?;
        let now = (self.clock)();
        Ok(self.workflows.recognize(&self.store, &self.store, &image, now)?)
    }
}

/// Log a failed request at a level matching who is at fault.
fn logged<T>(op: &'static str, result: Result<T, EngineError>) -> Result<T, EngineError> {
    if let Err(e) = &result {
        if e.status() >= 500 {
            tracing::error!(op, error = %e, "request failed");
        } else {
            tracing::info!(op, error = %e, status = e.status(), "request rejected");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::SqliteCredentialStore;
    use crate::testing::{data_url, ColorEncoder, SlotLocator, BLUE, DARK_RED, RED};
    use rollcall_core::{Label, LedgerWrite};

    fn fixed_now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(9, 15, 0).unwrap()
    }

    fn settings(timeout: Duration) -> EngineSettings {
        EngineSettings {
            distance_threshold: 1.0,
            request_timeout: timeout,
            confirmation_ttl: chrono::Duration::seconds(300),
            max_image_bytes: 1 << 20,
            clock: fixed_now,
        }
    }

    fn spawn_with(locator: SlotLocator, store: SqliteStore) -> EngineHandle {
        let credentials = SqliteCredentialStore::open_in_memory().unwrap();
        credentials.bootstrap("admin123").unwrap();
        spawn_engine(locator, ColorEncoder, store, credentials, settings(Duration::from_secs(5))).unwrap()
    }

    fn spawn() -> EngineHandle {
        spawn_with(SlotLocator::default(), SqliteStore::open_in_memory().unwrap())
    }

    fn enroll_request(name: &str) -> EnrollRequest {
        EnrollRequest { identity: name.into(), contact: Default::default() }
    }

    #[tokio::test]
    async fn test_enroll_conflict_confirm_flow() {
        let engine = spawn();

        let outcome = engine.enroll(enroll_request("Alice"), data_url(&[Some(RED)])).await.unwrap();
        assert!(matches!(outcome, EnrollOutcome::Enrolled { faces_detected: 1, .. }));

        let outcome = engine.enroll(enroll_request("Alice"), data_url(&[Some(BLUE)])).await.unwrap();
        let EnrollOutcome::ConflictRequiresConfirmation { token, .. } = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };

        // Not overwritten yet: the red face still matches.
        let faces = engine.recognize(data_url(&[Some(RED)])).await.unwrap();
        assert_eq!(faces[0].result.label, Label::Known("Alice".into()));

        assert_eq!(engine.confirm_update(token).await.unwrap(), "Alice");
        let faces = engine.recognize(data_url(&[Some(BLUE)])).await.unwrap();
        assert_eq!(faces[0].result.label, Label::Known("Alice".into()));

        let err = engine.reject_update(token).await.unwrap_err();
        assert_eq!(err.status(), 409);
    }

    #[tokio::test]
    async fn test_recognize_two_faces_one_ledger_write() {
        let engine = spawn();
        engine.enroll(enroll_request("Alice"), data_url(&[Some(RED)])).await.unwrap();

        let faces = engine.recognize(data_url(&[Some(DARK_RED), Some(BLUE)])).await.unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].result.label, Label::Known("Alice".into()));
        assert_eq!(faces[0].result.time, "09:15:00");
        assert_eq!(faces[1].result.label, Label::Unknown);
        assert_eq!(faces[1].ledger, LedgerWrite::Skipped);

        let day = engine.attendance(None).await.unwrap();
        assert_eq!(day.date, fixed_now().date());
        assert_eq!(day.records.len(), 1);
        assert_eq!(day.records[0].identity, "Alice");
    }

    #[tokio::test]
    async fn test_recognize_without_faces_is_bad_request() {
        let engine = spawn();
        let err = engine.recognize(data_url(&[None, None])).await.unwrap_err();
        assert!(matches!(err, EngineError::Workflow(WorkflowError::NoFaceDetected)));
        assert_eq!(err.status(), 400);
        assert!(engine.attendance(None).await.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn test_ledger_failure_does_not_fail_request() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_alice BEFORE INSERT ON attendance
                 WHEN NEW.student = 'Alice'
                 BEGIN SELECT RAISE(ABORT, 'ledger offline'); END;",
            )
            .unwrap();
        let engine = spawn_with(SlotLocator::default(), store);
        engine.enroll(enroll_request("Alice"), data_url(&[Some(RED)])).await.unwrap();
        engine.enroll(enroll_request("Bob"), data_url(&[Some(BLUE)])).await.unwrap();

        let faces = engine.recognize(data_url(&[Some(RED), Some(BLUE)])).await.unwrap();
        assert!(matches!(faces[0].ledger, LedgerWrite::Failed(_)));
        assert_eq!(faces[1].ledger, LedgerWrite::Created);

        let names: Vec<String> = engine
            .attendance(None)
            .await
            .unwrap()
            .records
            .into_iter()
            .map(|r| r.identity)
            .collect();
        assert_eq!(names, vec!["Bob"]);
    }

    #[tokio::test]
    async fn test_update_face_unknown_student_is_not_found() {
        let engine = spawn();
        let err = engine.update_face("Nobody".into(), data_url(&[Some(RED)])).await.unwrap_err();
        assert_eq!(err.status(), 404);
        assert!(engine.list_students().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_image_is_bad_request() {
        let engine = spawn();
        let err = engine
            .enroll(enroll_request("Alice"), "data:image/png;base64,AAAA".into())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_password_flow() {
        let engine = spawn();
        assert!(engine.verify_password("admin123".into()).await.unwrap());
        assert!(!engine.verify_password("guess".into()).await.unwrap());

        let err = engine.update_password("guess".into(), "x".into()).await.unwrap_err();
        assert_eq!(err.status(), 401);

        engine.update_password("admin123".into(), "s3cret".into()).await.unwrap();
        assert!(engine.verify_password("s3cret".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_slow_pipeline_times_out() {
        let credentials = SqliteCredentialStore::open_in_memory().unwrap();
        let locator = SlotLocator { delay: Duration::from_millis(500) };
        let engine = spawn_engine(
            locator,
            ColorEncoder,
            SqliteStore::open_in_memory().unwrap(),
            credentials,
            settings(Duration::from_millis(50)),
        )
        .unwrap();

        let err = engine.recognize(data_url(&[Some(RED)])).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert_eq!(err.status(), 504);
    }

    #[tokio::test]
    async fn test_status_reports_students() {
        let engine = spawn();
        engine.enroll(enroll_request("Alice"), data_url(&[Some(RED)])).await.unwrap();
        let status = engine.status().await.unwrap();
        assert_eq!(status.students, 1);
        assert_eq!(status.distance_threshold, 1.0);
    }

    #[tokio::test]
    async fn test_status_survives_corrupt_embedding() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute(
                "INSERT INTO students (name, embedding, enrolled_at)
                 VALUES ('Alice', 'not json', '2024-03-01 08:00:00')",
                [],
            )
            .unwrap();
        let engine = spawn_with(SlotLocator::default(), store);

        assert_eq!(engine.list_students().await.unwrap_err().status(), 500);
        assert_eq!(engine.status().await.unwrap().students, 1);
    }
}
