//! Repo-controller webhook ingress: host issue events and backlog push
//! events. Signature verification is explicitly out of scope (spec §1);
//! malformed bodies never surface as `5xx` so the host doesn't redeliver.

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use devorch_core::ports::HostIssuePayload;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct GithubIssueWebhookBody {
    pub action: String,
    pub issue: GhIssueBody,
}

#[derive(Debug, Deserialize)]
pub struct GhIssueBody {
    pub id: i64,
    pub number: i64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub labels: Vec<GhLabelBody>,
    pub assignee: Option<GhAssigneeBody>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub closed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct GhLabelBody {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct GhAssigneeBody {
    pub login: String,
}

pub async fn github_webhook(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<OkResponse>) {
    let parsed: Result<GithubIssueWebhookBody, _> = serde_json::from_slice(&body);
    let Ok(webhook) = parsed else {
        warn!("malformed github webhook body");
        return (StatusCode::OK, Json(OkResponse { ok: false }));
    };

    let payload = HostIssuePayload {
        number: webhook.issue.number,
        id: webhook.issue.id,
        title: webhook.issue.title,
        body: webhook.issue.body.unwrap_or_default(),
        state: webhook.issue.state,
        labels: webhook.issue.labels.into_iter().map(|l| l.name).collect(),
        assignee: webhook.issue.assignee.map(|a| a.login),
        created_at: webhook.issue.created_at,
        updated_at: webhook.issue.updated_at,
        closed_at: webhook.issue.closed_at,
    };

    match state.repo.on_host_issue(payload).await {
        Ok(()) => {
            info!(action = %webhook.action, "host issue webhook processed");
            (StatusCode::OK, Json(OkResponse { ok: true }))
        }
        Err(err) => {
            warn!(error = %err, "host issue webhook processing failed");
            (StatusCode::OK, Json(OkResponse { ok: false }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BacklogPushWebhookBody {
    pub commit: String,
    pub files: Vec<String>,
    #[allow(dead_code)]
    pub repo_full_name: String,
    #[allow(dead_code)]
    pub installation_id: i64,
}

pub async fn beads_webhook(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<OkResponse>) {
    let parsed: Result<BacklogPushWebhookBody, _> = serde_json::from_slice(&body);
    let Ok(webhook) = parsed else {
        warn!("malformed backlog push webhook body");
        return (StatusCode::OK, Json(OkResponse { ok: false }));
    };

    match state.repo.on_backlog_push(&webhook.commit, &webhook.files).await {
        Ok(_) => {
            info!(commit = %webhook.commit, "backlog push webhook processed");
            (StatusCode::OK, Json(OkResponse { ok: true }))
        }
        Err(err) => {
            warn!(error = %err, "backlog push webhook processing failed");
            (StatusCode::OK, Json(OkResponse { ok: false }))
        }
    }
}
