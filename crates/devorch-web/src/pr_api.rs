//! PR controller HTTP surface (spec §6): event ingestion, status, session
//! callbacks, human approval, and rollback.

use crate::issue_api::ErrorBody;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use devorch_core::pr_controller::{ApprovalGateConfig, PrEvent, ReviewDecision};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (status, Json(ErrorBody { error: message.into() }))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrEventBody {
    ConfigLoaded {
        org: ApprovalGateConfig,
        repo: ApprovalGateConfig,
        labels: Vec<String>,
        files_changed: Vec<String>,
    },
    SessionStarted {
        session_id: String,
    },
    SessionFailed {
        error: String,
    },
    Retry,
    ReviewComplete {
        decision: ReviewDecision,
        comment: String,
        #[serde(default)]
        escalations: Vec<String>,
    },
    FixComplete,
    Close {
        merged: bool,
    },
}

impl From<PrEventBody> for PrEvent {
    fn from(body: PrEventBody) -> Self {
        match body {
            PrEventBody::ConfigLoaded { org, repo, labels, files_changed } => {
                PrEvent::ConfigLoaded { org, repo, labels, files_changed }
            }
            PrEventBody::SessionStarted { session_id } => PrEvent::SessionStarted(session_id),
            PrEventBody::SessionFailed { error } => PrEvent::SessionFailed(error),
            PrEventBody::Retry => PrEvent::Retry,
            PrEventBody::ReviewComplete { decision, comment, escalations } => {
                PrEvent::ReviewComplete { decision, comment, escalations }
            }
            PrEventBody::FixComplete => PrEvent::FixComplete,
            PrEventBody::Close { merged } => PrEvent::Close { merged },
        }
    }
}

pub async fn post_event(
    State(state): State<Arc<AppState>>,
    Path(pr_number): Path<i64>,
    Json(body): Json<PrEventBody>,
) -> impl IntoResponse {
    let controller = match state.pr_controller(pr_number).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    match controller.handle_event(body.into()).await {
        Ok(()) => {
            let (machine_state, _) = controller.snapshot().await;
            (StatusCode::OK, Json(json!({ "ok": true, "state": machine_state.as_str() }))).into_response()
        }
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn get_status(State(state): State<Arc<AppState>>, Path(pr_number): Path<i64>) -> impl IntoResponse {
    let controller = match state.pr_controller(pr_number).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let (machine_state, context) = controller.snapshot().await;
    (StatusCode::OK, Json(json!({ "state": machine_state.as_str(), "context": context }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SessionCallbackBody {
    pub session_id: String,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

pub async fn post_session(
    State(state): State<Arc<AppState>>,
    Path(pr_number): Path<i64>,
    Json(body): Json<SessionCallbackBody>,
) -> impl IntoResponse {
    let controller = match state.pr_controller(pr_number).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let event = match body.status.as_str() {
        "started" => PrEvent::SessionStarted(body.session_id),
        "failed" => PrEvent::SessionFailed(body.error.unwrap_or_else(|| "session failed".to_string())),
        other => return err(StatusCode::BAD_REQUEST, format!("unknown session status: {other}")).into_response(),
    };
    match controller.handle_event(event).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ApproveBody {
    pub approver: String,
    pub approved: bool,
    #[serde(default)]
    #[allow(dead_code)]
    pub reason: Option<String>,
}

pub async fn approve(
    State(state): State<Arc<AppState>>,
    Path(pr_number): Path<i64>,
    Json(body): Json<ApproveBody>,
) -> impl IntoResponse {
    let controller = match state.pr_controller(pr_number).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    match controller
        .handle_event(PrEvent::HumanApproval { approved: body.approved, approver: body.approver })
        .await
    {
        Ok(()) => {
            let (machine_state, _) = controller.snapshot().await;
            (StatusCode::OK, Json(json!({ "ok": true, "state": machine_state.as_str() }))).into_response()
        }
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct RollbackBody {
    pub target_commit: String,
    pub reason: String,
    pub requested_by: String,
}

#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub ok: bool,
}

pub async fn rollback(
    State(state): State<Arc<AppState>>,
    Path(pr_number): Path<i64>,
    Json(body): Json<RollbackBody>,
) -> impl IntoResponse {
    let controller = match state.pr_controller(pr_number).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    match controller.rollback(&body.target_commit, &body.reason, &body.requested_by).await {
        Ok(info) => (StatusCode::OK, Json(json!({ "ok": true, "rollback": info }))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn rollback_info(State(state): State<Arc<AppState>>, Path(pr_number): Path<i64>) -> impl IntoResponse {
    let controller = match state.pr_controller(pr_number).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    match controller.rollback_info().await {
        Ok(info) => (StatusCode::OK, Json(json!({ "rollback": info }))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::{get, post};
    use axum::Router;
    use devorch_core::database::Database;
    use devorch_core::ports::{AgentDescriptor, FileContent, HostIssuePayload, PutFileOutcome};
    use devorch_core::repo_controller::{RepoController, WorkflowRegistry};
    use devorch_core::stateful_entity::NoopMirror;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct FakeHost;
    #[async_trait::async_trait]
    impl devorch_core::ports::HostApi for FakeHost {
        async fn create_issue(&self, _: &str, _: &str, _: &str, _: &[String]) -> anyhow::Result<HostIssuePayload> {
            unimplemented!()
        }
        async fn update_issue(&self, _: &str, _: i64, _: &str, _: &str, _: &[String], _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_file(&self, _: &str, _: &str) -> anyhow::Result<Option<FileContent>> {
            Ok(None)
        }
        async fn put_file(&self, _: &str, _: &str, _: &str, _: &str, _: Option<&str>) -> anyhow::Result<PutFileOutcome> {
            Ok(PutFileOutcome::Committed { sha: "sha".into() })
        }
        async fn create_pr(&self, _: &str, _: &str, _: &str, _: &str, _: &str) -> anyhow::Result<i64> {
            Ok(99)
        }
        async fn merge_pr(&self, _: &str, _: i64, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn files_changed(&self, _: &str, _: i64) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    struct FakeRoster;
    #[async_trait::async_trait]
    impl devorch_core::ports::AgentRoster for FakeRoster {
        async fn resolve(&self, _: &str) -> anyhow::Result<Option<AgentDescriptor>> {
            Ok(None)
        }
    }

    struct FakeSandbox;
    #[async_trait::async_trait]
    impl devorch_core::ports::SandboxRpc for FakeSandbox {
        async fn submit_task(
            &self,
            _: devorch_core::ports::SandboxTaskRequest,
        ) -> anyhow::Result<tokio::sync::mpsc::Receiver<devorch_core::ports::SandboxEvent>> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(rx)
        }
    }

    async fn test_app() -> Router {
        let db = Database::in_memory().await.unwrap();
        let repo = Arc::new(RepoController::new(db.clone(), Arc::new(FakeHost), "o/r", Arc::new(WorkflowRegistry::new())));
        let state = Arc::new(AppState::new(
            db,
            repo,
            Arc::new(FakeHost),
            Arc::new(FakeSandbox),
            Arc::new(FakeRoster),
            Arc::new(NoopMirror),
            None,
        ));
        Router::new()
            .route("/prs/:n/event", post(post_event))
            .route("/prs/:n/status", get(get_status))
            .route("/prs/:n/approve", post(approve))
            .with_state(state)
    }

    #[tokio::test]
    async fn status_starts_pending() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/prs/42/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["state"], "pending");
    }

    #[tokio::test]
    async fn config_loaded_event_moves_to_reviewing() {
        let app = test_app().await;
        let empty_gate = json!({
            "require_human_approval": false,
            "allow_full_autonomy": true,
            "risk_threshold": null,
            "critical_paths": [],
            "auto_approve_labels": [],
            "require_approval_labels": []
        });
        let body = json!({
            "type": "config_loaded",
            "org": empty_gate.clone(), "repo": empty_gate, "labels": [], "files_changed": ["src/main.rs"]
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/prs/42/event")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["state"], "reviewing");
    }
}
