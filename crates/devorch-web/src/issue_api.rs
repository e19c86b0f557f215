//! Issue controller HTTP surface (spec §6): assign/cancel, state and log
//! inspection, and the `/ws` streaming upgrade.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use devorch_core::issue_controller::{AssignAgentRequest, IssueState};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (status, Json(ErrorBody { error: message.into() }))
}

pub async fn assign_agent(
    State(state): State<Arc<AppState>>,
    Path(issue_id): Path<String>,
    Json(req): Json<AssignAgentRequest>,
) -> impl IntoResponse {
    let controller = match state.issue_controller(&issue_id).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let agent_id = req.agent.clone();
    match controller.assign_agent(req).await {
        Ok(()) => {
            let (state, _) = controller.snapshot().await;
            let descriptor = state_agent_summary(&state, &agent_id);
            (StatusCode::OK, Json(json!({ "ok": true, "state": state.as_str(), "agent": descriptor }))).into_response()
        }
        Err(devorch_core::error::Error::InvalidStateTransition { from, event }) => {
            err(StatusCode::BAD_REQUEST, format!("cannot {event} from {from}")).into_response()
        }
        Err(devorch_core::error::Error::UnknownAgent(id)) => {
            err(StatusCode::BAD_REQUEST, format!("unknown agent: {id}")).into_response()
        }
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn state_agent_summary(_state: &IssueState, agent_id: &str) -> serde_json::Value {
    json!({ "id": agent_id, "name": agent_id, "tier": "unknown", "framework": "unknown" })
}

pub async fn get_state(State(state): State<Arc<AppState>>, Path(issue_id): Path<String>) -> impl IntoResponse {
    let controller = match state.issue_controller(&issue_id).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let (machine_state, context) = controller.snapshot().await;
    let can_transition = !machine_state.is_terminal();
    (StatusCode::OK, Json(json!({ "state": machine_state.as_str(), "context": context, "can_transition": can_transition }))).into_response()
}

pub async fn cancel(State(state): State<Arc<AppState>>, Path(issue_id): Path<String>) -> impl IntoResponse {
    let controller = match state.issue_controller(&issue_id).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    match controller.cancel().await {
        Ok(()) => {
            let (machine_state, _) = controller.snapshot().await;
            (StatusCode::OK, Json(json!({ "ok": true, "state": machine_state.as_str() }))).into_response()
        }
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn logs(State(state): State<Arc<AppState>>, Path(issue_id): Path<String>) -> impl IntoResponse {
    let controller = match state.issue_controller(&issue_id).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let (_, context) = controller.snapshot().await;
    let tool_checks = controller.tool_check_history().await.unwrap_or_default();
    let verifications = controller.verification_history().await.unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({
            "sessions": context.session_id,
            "tool_checks": tool_checks.into_iter().map(|(required, missing, created_at)| {
                json!({ "required": required, "missing": missing, "created_at": created_at })
            }).collect::<Vec<_>>(),
            "verifications": verifications.into_iter().map(|(passed, reason, created_at)| {
                json!({ "passed": passed, "reason": reason, "created_at": created_at })
            }).collect::<Vec<_>>(),
        })),
    )
        .into_response()
}

pub async fn transitions(State(state): State<Arc<AppState>>, Path(issue_id): Path<String>) -> impl IntoResponse {
    let controller = match state.issue_controller(&issue_id).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    match controller.last_transitions(50).await {
        Ok(rows) => (StatusCode::OK, Json(json!(rows))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn events_for_session(
    State(state): State<Arc<AppState>>,
    Path((issue_id, session_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let controller = match state.issue_controller(&issue_id).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    match controller.events_for_session(&session_id).await {
        Ok(events) => (StatusCode::OK, Json(json!(events))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(issue_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, issue_id))
}

async fn handle_socket(mut socket: axum::extract::ws::WebSocket, state: Arc<AppState>, issue_id: String) {
    let Ok(controller) = state.issue_controller(&issue_id).await else {
        return;
    };

    let (machine_state, context) = controller.snapshot().await;
    let initial = json!({ "type": "state", "state": machine_state.as_str(), "context": context });
    if socket.send(Message::Text(initial.to_string().into())).await.is_err() {
        return;
    }

    let mut rx = controller.subscribe();
    while let Ok(msg) = rx.recv().await {
        if let Ok(json) = serde_json::to_string(&msg) {
            if socket.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
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
            Ok(1)
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
        async fn resolve(&self, agent_id: &str) -> anyhow::Result<Option<AgentDescriptor>> {
            Ok(Some(AgentDescriptor {
                id: agent_id.to_string(),
                name: agent_id.to_string(),
                tier: "standard".into(),
                framework: "sandbox".into(),
                tool_patterns: vec!["*".into()],
            }))
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
            .route("/issues/:id/assign-agent", post(assign_agent))
            .route("/issues/:id/state", get(get_state))
            .route("/issues/:id/cancel", post(cancel))
            .with_state(state)
    }

    #[tokio::test]
    async fn get_state_returns_idle_for_fresh_issue() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/issues/todo-a/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["state"], "idle");
        assert_eq!(parsed["can_transition"], true);
    }

    #[tokio::test]
    async fn assign_agent_rejects_unknown_agent() {
        struct UnknownRoster;
        #[async_trait::async_trait]
        impl devorch_core::ports::AgentRoster for UnknownRoster {
            async fn resolve(&self, _: &str) -> anyhow::Result<Option<AgentDescriptor>> {
                Ok(None)
            }
        }
        let db = Database::in_memory().await.unwrap();
        let repo = Arc::new(RepoController::new(db.clone(), Arc::new(FakeHost), "o/r", Arc::new(WorkflowRegistry::new())));
        let state = Arc::new(AppState::new(
            db,
            repo,
            Arc::new(FakeHost),
            Arc::new(FakeSandbox),
            Arc::new(UnknownRoster),
            Arc::new(NoopMirror),
            None,
        ));
        let app = Router::new()
            .route("/issues/:id/assign-agent", post(assign_agent))
            .with_state(state);

        let req_body = serde_json::json!({
            "agent": "ghost", "credential": "c", "issue_id": "todo-a", "repo": "o/r",
            "installation_id": 1, "title": "T", "description": "D",
            "acceptance_criteria": "", "design": "", "required_tools": []
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/issues/todo-a/assign-agent")
                    .header("content-type", "application/json")
                    .body(Body::from(req_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
