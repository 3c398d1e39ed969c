//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::app::controller::UpdateOutcome;
use crate::deploy::fsm::{UpdateJob, UpdateTrigger};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "iotagent".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Aggregate status handler
pub async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.controller.status().await)
}

/// Host health and metrics handler
pub async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.controller.health().await)
}

/// Manual update request
#[derive(Debug, Default, Deserialize)]
pub struct UpdateQuery {
    /// Deploy this tag of the configured repository instead of checking for
    /// the latest one
    pub tag: Option<String>,
}

/// Manual update response
#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    pub accepted: bool,
    pub message: String,
    pub job: Option<UpdateJob>,
}

/// Manual update handler. Blocks until the job finishes; `409` while another
/// update holds the gate.
pub async fn update_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<UpdateQuery>,
) -> (StatusCode, Json<UpdateResponse>) {
    let controller = &state.controller;
    let tag = query
        .tag
        .as_deref()
        .map(str::trim)
        .filter(|tag| !tag.is_empty());

    let outcome = match tag {
        Some(tag) => {
            let target = controller.identity().image.with_tag(tag);
            info!("Manual deploy of {} requested", target);
            Ok(controller.deploy(UpdateTrigger::Manual, target).await)
        }
        None => {
            info!("Manual update check requested");
            controller.request_update(UpdateTrigger::Manual).await
        }
    };

    match outcome {
        Ok(UpdateOutcome::Rejected) => (
            StatusCode::CONFLICT,
            Json(UpdateResponse {
                accepted: false,
                message: "Update already in progress".to_string(),
                job: None,
            }),
        ),
        Ok(UpdateOutcome::UpToDate(decision)) => (
            StatusCode::OK,
            Json(UpdateResponse {
                accepted: true,
                message: format!(
                    "No update needed. Current: {}, Latest: {}",
                    decision.current_tag, decision.latest_tag
                ),
                job: None,
            }),
        ),
        Ok(UpdateOutcome::Completed(job)) => (
            StatusCode::OK,
            Json(UpdateResponse {
                accepted: true,
                message: format!("Update finished: {}", job.phase()),
                job: Some(job),
            }),
        ),
        Err(e) => {
            error!("Manual update failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(UpdateResponse {
                    accepted: false,
                    message: e.to_string(),
                    job: None,
                }),
            )
        }
    }
}
