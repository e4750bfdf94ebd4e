//! Workflow definition handlers for the REST API.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use uuid::Uuid;

use weave_core::store::{ExecutionStore, StoreError};
use weave_types::workflow::WorkflowDefinition;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// POST /api/v1/workflows - Register a workflow definition.
///
/// The definition is validated (graph compiles, trigger paths well
/// formed) before it is stored and its triggers are wired up.
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<impl IntoResponse, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    weave_core::definition::validate(&definition)?;
    state.store.save_definition(&definition).await?;
    state.register(definition.clone());

    tracing::info!(
        workflow = %definition.name,
        version = definition.version,
        "registered workflow definition"
    );

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(
        serde_json::json!({
            "id": definition.id,
            "name": definition.name,
            "version": definition.version,
        }),
        request_id,
        elapsed,
    )
    .with_link("self", &format!("/api/v1/workflows/{}", definition.id));

    Ok((StatusCode::CREATED, resp))
}

/// GET /api/v1/workflows - List registered definitions.
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let definitions = state.store.list_definitions().await?;
    let summaries: Vec<serde_json::Value> = definitions
        .iter()
        .map(|d| {
            serde_json::json!({
                "id": d.id,
                "name": d.name,
                "version": d.version,
                "description": d.description,
                "steps": d.steps.len(),
                "triggers": d.triggers.len(),
            })
        })
        .collect();

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(ApiResponse::success(
        serde_json::json!({ "workflows": summaries }),
        request_id,
        elapsed,
    ))
}

/// GET /api/v1/workflows/{id} - Fetch a full definition.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let definition = state
        .store
        .get_definition(&id)
        .await?
        .ok_or(AppError::Store(StoreError::NotFound))?;

    let elapsed = start.elapsed().as_millis() as u64;
    let value = serde_json::to_value(&definition)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(ApiResponse::success(value, request_id, elapsed)
        .with_link("self", &format!("/api/v1/workflows/{id}")))
}

/// DELETE /api/v1/workflows/{id} - Remove a definition and unwire its
/// triggers. In-flight instances are unaffected.
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let removed = state.store.delete_definition(&id).await?;
    if !removed {
        return Err(AppError::Store(StoreError::NotFound));
    }
    state.dispatcher.unregister_definition(&id);
    state.webhooks.unregister_definition(&id);
    if let Err(e) = state.cron.unschedule(id).await {
        tracing::warn!(definition_id = %id, error = %e, "failed to unschedule cron triggers");
    }

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(ApiResponse::success(
        serde_json::json!({ "id": id, "deleted": true }),
        request_id,
        elapsed,
    ))
}
