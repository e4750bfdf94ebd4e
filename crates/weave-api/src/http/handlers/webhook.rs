//! Inbound webhook and platform event handlers.
//!
//! Webhooks arrive on `/hooks/{*path}`; the raw body is verified
//! against the route's configured authentication before the payload is
//! handed to the trigger dispatcher.

use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// POST /hooks/{*path} - Receive a webhook delivery.
///
/// Authentication runs over the raw body bytes; only after it passes is
/// the body parsed as JSON. Non-JSON bodies are delivered as a string
/// payload so text webhooks still work.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();
    let path = format!("/hooks/{rest}");

    let route = state.webhooks.verify_request(&path, &body, |name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    })?;

    let payload = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(v) => v,
        Err(_) => serde_json::Value::String(String::from_utf8_lossy(&body).into_owned()),
    };

    tracing::info!(path = %path, workflow = %route.workflow_name, "webhook received");
    let instances = state.dispatcher.fire_webhook(&path, payload).await?;

    // 202 when work started; a delivery dropped by trigger filters is
    // still acknowledged, with a plain 200.
    let status = if instances.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    let disposition = if instances.is_empty() { "filtered" } else { "accepted" };

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(
        serde_json::json!({ "status": disposition, "instances": instances }),
        request_id,
        elapsed,
    );
    Ok((status, resp))
}

/// Body for POST /api/v1/events.
#[derive(Debug, Deserialize)]
pub struct PostEventRequest {
    /// Event class routed to subscribed workflows.
    pub event_class: String,
    /// Idempotency key; repeated deliveries with the same id start at
    /// most one instance.
    pub event_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// POST /api/v1/events - Publish a platform event.
pub async fn post_event(
    State(state): State<AppState>,
    Json(body): Json<PostEventRequest>,
) -> Result<impl IntoResponse, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let instances = state
        .dispatcher
        .fire_event(&body.event_class, body.event_id, body.payload)
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(
        serde_json::json!({ "instances": instances }),
        request_id,
        elapsed,
    );
    Ok((StatusCode::ACCEPTED, resp))
}
