//! Execution instance handlers for the REST API.
//!
//! Starting instances, inspecting their status and step records, and
//! requesting cancellation.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use uuid::Uuid;

use weave_core::scheduler::SchedulerError;
use weave_core::store::ExecutionStore;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / query types
// ---------------------------------------------------------------------------

/// Body for POST /instances. The workflow is addressed by definition
/// id or by name; exactly one is required.
#[derive(Debug, Deserialize)]
pub struct StartInstanceRequest {
    /// Workflow definition id.
    pub definition_id: Option<Uuid>,
    /// Workflow name (newest version wins).
    pub workflow: Option<String>,
    /// Trigger input, defaults to `{}`.
    #[serde(default, alias = "payload")]
    pub input: serde_json::Value,
}

/// Query parameters for listing instances.
#[derive(Debug, Deserialize)]
pub struct ListInstancesQuery {
    /// Filter by workflow definition id.
    pub definition_id: Option<Uuid>,
    /// Maximum number of instances to return (default 20).
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/instances - Start an instance of a named workflow.
///
/// Returns 202 Accepted with the instance id; execution continues in
/// the background.
pub async fn start_instance(
    State(state): State<AppState>,
    Json(body): Json<StartInstanceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let input = if body.input.is_null() {
        serde_json::json!({})
    } else {
        body.input
    };
    let instance_id = match (&body.definition_id, &body.workflow) {
        (Some(id), _) => {
            let definition = state
                .store
                .get_definition(id)
                .await?
                .ok_or(SchedulerError::DefinitionNotFound(*id))?;
            state
                .scheduler
                .start(definition, "manual", input, None, serde_json::json!({}))
                .await?
        }
        (None, Some(name)) => state.dispatcher.fire_manual(name, input).await?,
        (None, None) => {
            return Err(AppError::Validation(
                "either definition_id or workflow is required".to_string(),
            ));
        }
    };

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(
        serde_json::json!({ "instance_id": instance_id }),
        request_id,
        elapsed,
    )
    .with_link("self", &format!("/api/v1/instances/{instance_id}"));

    Ok((StatusCode::ACCEPTED, resp))
}

/// GET /api/v1/instances - List recent instances.
pub async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<ListInstancesQuery>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let instances = state
        .store
        .list_instances(query.definition_id, query.limit)
        .await?;

    let summaries: Vec<serde_json::Value> = instances
        .iter()
        .map(|i| {
            serde_json::json!({
                "instance_id": i.instance_id,
                "workflow_name": i.workflow_name,
                "status": i.status,
                "trigger_type": i.trigger_type,
                "started_at": i.started_at,
                "ended_at": i.ended_at,
                "error": i.error,
            })
        })
        .collect();

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(ApiResponse::success(
        serde_json::json!({ "instances": summaries }),
        request_id,
        elapsed,
    ))
}

/// GET /api/v1/instances/{id} - Full instance state including step
/// records and context. 404 for unknown ids.
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let instance = state
        .store
        .load_instance(&id)
        .await?
        .ok_or(AppError::Scheduler(SchedulerError::InstanceNotFound(id)))?;

    let elapsed = start.elapsed().as_millis() as u64;
    let value = serde_json::to_value(&instance)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(ApiResponse::success(value, request_id, elapsed)
        .with_link("self", &format!("/api/v1/instances/{id}")))
}

/// POST /api/v1/instances/{id}/cancel - Request cancellation.
///
/// Cancellation is asynchronous (running steps get a grace period), so
/// this returns 202. 409 when the instance is already terminal, 404
/// when unknown.
pub async fn cancel_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.scheduler.cancel(&id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(
        serde_json::json!({ "instance_id": id, "cancellation": "requested" }),
        request_id,
        elapsed,
    );
    Ok((StatusCode::ACCEPTED, resp))
}
