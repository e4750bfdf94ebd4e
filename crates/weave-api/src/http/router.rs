//! Axum router wiring.

use axum::Router;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers::{definition, instance, webhook};
use crate::state::AppState;

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route(
            "/workflows",
            post(definition::create_workflow).get(definition::list_workflows),
        )
        .route(
            "/workflows/{id}",
            get(definition::get_workflow).delete(definition::delete_workflow),
        )
        .route(
            "/instances",
            post(instance::start_instance).get(instance::list_instances),
        )
        .route("/instances/{id}", get(instance::get_instance))
        .route("/instances/{id}/cancel", post(instance::cancel_instance))
        .route("/events", post(webhook::post_event));

    Router::new()
        .route("/health", get(health_check))
        .route("/hooks/{*path}", post(webhook::receive_webhook))
        .nest("/api/v1", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Liveness probe.
async fn health_check() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
