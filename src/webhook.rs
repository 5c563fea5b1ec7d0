//! Inbound webhook routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::error::PipelineError;
use crate::pipeline::{EmailProcessor, InboundEmailEvent};

/// Shared state for webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub processor: Arc<EmailProcessor>,
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// POST /webhooks/email/{workspace_id}
///
/// Runs the whole pipeline before responding. 200 when at least one agent
/// pipeline completed (or nothing needed doing), 502 when all failed.
async fn receive_email(
    State(state): State<WebhookState>,
    Path(workspace_id): Path<String>,
    Json(email): Json<InboundEmailEvent>,
) -> Response {
    match state.processor.process(&workspace_id, email).await {
        Ok(outcome) => {
            let status = if outcome.success {
                StatusCode::OK
            } else {
                StatusCode::BAD_GATEWAY
            };
            (status, Json(outcome)).into_response()
        }
        Err(PipelineError::UnknownWorkspace(id)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown workspace: {id}") })),
        )
            .into_response(),
        Err(e) => {
            error!(workspace_id = %workspace_id, error = %e, "Webhook processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

/// Build the webhook router.
pub fn webhook_routes(processor: Arc<EmailProcessor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/email/{workspace_id}", post(receive_email))
        .layer(CorsLayer::permissive())
        .with_state(WebhookState { processor })
}
