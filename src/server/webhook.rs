//! GitLab webhook receiver. Validated events become refresh hints keyed by
//! project path; the orchestrator turns them into on-demand collector runs.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, warn};

use super::AppState;

/// Event kinds the exporter reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookKind {
    Pipeline,
    MergeRequest,
}

/// A refresh hint extracted from a webhook payload.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub kind: WebhookKind,
    pub project: String,
}

/// Webhook configuration and the callback receiving validated events.
#[derive(Clone)]
pub struct WebhookState {
    /// Expected `X-Gitlab-Token` value. Empty disables validation.
    pub secret_token: String,
    pub on_event: Arc<dyn Fn(WebhookEvent) + Send + Sync>,
}

/// The minimal envelope needed to classify an event and extract the project.
#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    object_kind: String,
    #[serde(default)]
    project: WebhookProject,
}

#[derive(Debug, Deserialize, Default)]
struct WebhookProject {
    #[serde(default)]
    path_with_namespace: String,
}

pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(webhook) = &state.webhook else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if !webhook.secret_token.is_empty() {
        let token = headers
            .get("x-gitlab-token")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if token != webhook.secret_token {
            warn!("webhook received with invalid token");
            return (StatusCode::FORBIDDEN, "forbidden").into_response();
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to parse webhook payload");
            return (StatusCode::BAD_REQUEST, "bad request").into_response();
        }
    };

    let project = payload.project.path_with_namespace;
    if project.is_empty() {
        warn!("webhook payload missing project path");
        return (StatusCode::BAD_REQUEST, "bad request").into_response();
    }

    debug!(object_kind = %payload.object_kind, project = %project, "webhook event received");

    match payload.object_kind.as_str() {
        "pipeline" => (webhook.on_event)(WebhookEvent {
            kind: WebhookKind::Pipeline,
            project,
        }),
        "merge_request" => (webhook.on_event)(WebhookEvent {
            kind: WebhookKind::MergeRequest,
            project,
        }),
        other => {
            debug!(object_kind = other, "ignoring unhandled webhook event type");
        }
    }

    Json(serde_json::json!({"status": "accepted"})).into_response()
}
