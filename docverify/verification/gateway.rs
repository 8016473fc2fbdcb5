use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    dispatcher::VerificationDispatcher,
    model::{IdError, SubjectId, Verdict},
    store::{ClaimOutcome, StoreError, SubjectStore},
    telemetry::VerificationTelemetry,
};

/// Number of documents returned by the connection test.
pub const SAMPLE_LIMIT: usize = 5;

/// Request-level failures, rendered as `{"detail": ...}` bodies.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Identifier is not a store object id.
    #[error("Invalid userId format")]
    InvalidId(#[from] IdError),
    /// No such subject.
    #[error("User not found")]
    NotFound,
    /// A run already owns the subject.
    #[error("User verification is already in progress")]
    Conflict,
    /// Store failed while handling the request.
    #[error("Database error: {0}")]
    Store(#[from] StoreError),
    /// Connection test failed.
    #[error("Database connection test failed: {0}")]
    ConnectionTest(StoreError),
    /// Run could not be scheduled.
    #[error("Verification scheduler is unavailable")]
    Unavailable,
}

impl GatewayError {
    /// HTTP status for the error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidId(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Store(_) | Self::ConnectionTest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Shared handles behind the HTTP surface.
#[derive(Clone)]
pub struct GatewayState {
    store: Arc<dyn SubjectStore>,
    dispatcher: VerificationDispatcher,
    telemetry: VerificationTelemetry,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("dispatcher", &self.dispatcher)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

impl GatewayState {
    /// Creates gateway state.
    #[must_use]
    pub fn new(
        store: Arc<dyn SubjectStore>,
        dispatcher: VerificationDispatcher,
        telemetry: VerificationTelemetry,
    ) -> Self {
        Self {
            store,
            dispatcher,
            telemetry,
        }
    }
}

/// Claims the subject and schedules its run without waiting for it.
pub async fn request_verification(
    state: &GatewayState,
    raw_id: &str,
) -> Result<SubjectId, GatewayError> {
    let id = SubjectId::parse(raw_id)?;
    match state.store.claim_for_processing(&id).await? {
        ClaimOutcome::NotFound => return Err(GatewayError::NotFound),
        ClaimOutcome::AlreadyProcessing => {
            state.telemetry.log(
                LogLevel::Info,
                "verification.request.conflict",
                Some(&id),
                json!({}),
            );
            return Err(GatewayError::Conflict);
        }
        ClaimOutcome::Acquired => {}
    }
    if state.dispatcher.submit(id.clone()).is_err() {
        // The claim is held; release it so the subject is not left PROCESSING.
        let released = state
            .store
            .write_verdict(&id, &Verdict::system_error())
            .await
            .is_ok();
        state.telemetry.log(
            LogLevel::Error,
            "verification.request.unscheduled",
            Some(&id),
            json!({ "released": released }),
        );
        return Err(GatewayError::Unavailable);
    }
    state
        .telemetry
        .log(LogLevel::Info, "verification.request.accepted", Some(&id), json!({}));
    state
        .telemetry
        .event("verification.accepted", json!({ "subjectId": id.as_str() }))
        .await;
    Ok(id)
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    #[serde(rename = "userId")]
    user_id: String,
}

async fn verify_user(
    State(state): State<GatewayState>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<Value>, GatewayError> {
    let id = request_verification(&state, &request.user_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("User {id} has been queued for verification."),
    })))
}

async fn test_db_connection(State(state): State<GatewayState>) -> Result<Json<Value>, GatewayError> {
    let sample = state
        .store
        .sample_subjects(SAMPLE_LIMIT)
        .await
        .map_err(GatewayError::ConnectionTest)?;
    Ok(Json(json!({
        "message": "Connection successful",
        "users_sample": sample,
    })))
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Builds the HTTP router.
#[must_use]
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/verify_user", post(verify_user))
        .route("/test_db_connection", get(test_db_connection))
        .route("/healthz", get(healthz))
        .with_state(state)
}
