//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use weave_core::definition::DefinitionError;
use weave_core::scheduler::SchedulerError;
use weave_core::trigger::TriggerError;
use weave_infra::webhook::WebhookError;
use weave_types::error::StoreError;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Scheduler errors (unknown instance, terminal cancel, ...).
    Scheduler(SchedulerError),
    /// Trigger dispatch errors.
    Trigger(TriggerError),
    /// Store errors.
    Store(StoreError),
    /// Definition parse/validation errors.
    Definition(DefinitionError),
    /// Webhook lookup/auth errors.
    Webhook(WebhookError),
    /// Validation error.
    Validation(String),
    /// Generic internal error.
    Internal(String),
}

impl From<SchedulerError> for AppError {
    fn from(e: SchedulerError) -> Self {
        AppError::Scheduler(e)
    }
}

impl From<TriggerError> for AppError {
    fn from(e: TriggerError) -> Self {
        AppError::Trigger(e)
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Store(e)
    }
}

impl From<DefinitionError> for AppError {
    fn from(e: DefinitionError) -> Self {
        AppError::Definition(e)
    }
}

impl From<WebhookError> for AppError {
    fn from(e: WebhookError) -> Self {
        AppError::Webhook(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Scheduler(SchedulerError::InstanceNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "INSTANCE_NOT_FOUND",
                format!("Instance {id} not found"),
            ),
            AppError::Scheduler(SchedulerError::DefinitionNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "WORKFLOW_NOT_FOUND",
                format!("Workflow definition {id} not found"),
            ),
            AppError::Scheduler(SchedulerError::AlreadyTerminal(id, status)) => (
                StatusCode::CONFLICT,
                "ALREADY_TERMINAL",
                format!("Instance {id} is already {status:?}"),
            ),
            AppError::Scheduler(SchedulerError::Graph(e)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
            }
            AppError::Scheduler(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SCHEDULER_ERROR",
                e.to_string(),
            ),
            AppError::Trigger(TriggerError::UnknownWorkflow(name)) => (
                StatusCode::NOT_FOUND,
                "WORKFLOW_NOT_FOUND",
                format!("Workflow '{name}' not found"),
            ),
            AppError::Trigger(TriggerError::UnknownRoute(path)) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("No webhook registered at {path}"),
            ),
            AppError::Trigger(TriggerError::Scheduler(e)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SCHEDULER_ERROR",
                e.to_string(),
            ),
            AppError::Trigger(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "TRIGGER_ERROR",
                e.to_string(),
            ),
            AppError::Store(StoreError::NotFound) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "Entity not found".to_string(),
            ),
            AppError::Store(StoreError::Conflict(msg)) => {
                (StatusCode::CONFLICT, "CONFLICT", msg.clone())
            }
            AppError::Store(StoreError::RevisionConflict { expected, actual }) => (
                StatusCode::CONFLICT,
                "CONFLICT",
                format!("Revision conflict: expected {expected}, got {actual}"),
            ),
            AppError::Store(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORE_ERROR",
                e.to_string(),
            ),
            AppError::Definition(e) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
            }
            AppError::Webhook(WebhookError::PathNotFound(path)) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("No webhook registered at {path}"),
            ),
            AppError::Webhook(
                WebhookError::HmacVerificationFailed
                | WebhookError::CredentialVerificationFailed,
            ) => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Webhook authentication failed".to_string(),
            ),
            AppError::Webhook(WebhookError::MissingAuth(msg)) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone())
            }
            AppError::Webhook(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "WEBHOOK_ERROR",
                e.to_string(),
            ),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        let body = json!({
            "data": null,
            "meta": {
                "request_id": "",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
