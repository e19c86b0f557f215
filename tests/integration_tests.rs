//! End-to-end HTTP surface tests driving the full axum router, matching
//! the scenarios in spec §8 (escalation insertion, risk escalation) over
//! the wire rather than through direct controller calls.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use devorch_core::database::Database;
use devorch_core::ports::{
    AgentDescriptor, AgentRoster, FileContent, HostApi, HostIssuePayload, PutFileOutcome,
    SandboxEvent, SandboxRpc, SandboxTaskRequest,
};
use devorch_core::repo_controller::{RepoController, WorkflowRegistry};
use devorch_core::stateful_entity::NoopMirror;
use devorch_web::{create_router, AppState};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

struct FakeHost;

#[async_trait::async_trait]
impl HostApi for FakeHost {
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
        Ok(101)
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
impl AgentRoster for FakeRoster {
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
impl SandboxRpc for FakeSandbox {
    async fn submit_task(&self, _: SandboxTaskRequest) -> anyhow::Result<tokio::sync::mpsc::Receiver<SandboxEvent>> {
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        Ok(rx)
    }
}

async fn test_app() -> axum::Router {
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
    create_router(state)
}

#[tokio::test]
async fn webhook_then_ready_issue_flows_through_assign_agent() {
    let app = test_app().await;

    let webhook_body = serde_json::json!({
        "action": "opened",
        "issue": {
            "id": 1, "number": 55, "title": "Add retry logic", "body": "desc",
            "state": "open", "labels": [], "assignee": null,
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z",
            "closed_at": null
        }
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/github")
                .header("content-type", "application/json")
                .body(Body::from(webhook_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["ok"], true);

    let assign_body = serde_json::json!({
        "agent": "claude-standard", "credential": "tok", "issue_id": "gh-55",
        "repo": "o/r", "installation_id": 1, "title": "Add retry logic",
        "description": "desc", "acceptance_criteria": "", "design": "",
        "required_tools": []
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/issues/gh-55/assign-agent")
                .header("content-type", "application/json")
                .body(Body::from(assign_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["ok"], true);
    assert_eq!(parsed["state"], "preparing");
}

#[tokio::test]
async fn pr_risk_escalation_forces_human_approval_over_http() {
    let app = test_app().await;

    let empty_gate = serde_json::json!({
        "require_human_approval": false,
        "allow_full_autonomy": true,
        "risk_threshold": "high",
        "critical_paths": ["**/auth/**"],
        "auto_approve_labels": [],
        "require_approval_labels": []
    });
    let event_body = serde_json::json!({
        "type": "config_loaded",
        "org": empty_gate,
        "repo": {
            "require_human_approval": false,
            "allow_full_autonomy": true,
            "risk_threshold": null,
            "critical_paths": [],
            "auto_approve_labels": [],
            "require_approval_labels": [],
            "inherit_from_org": true
        },
        "labels": [],
        "files_changed": ["src/auth/login.rs"]
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/prs/7/event")
                .header("content-type", "application/json")
                .body(Body::from(event_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/prs/7/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["state"], "reviewing");
    assert_eq!(parsed["context"]["risk_assessment"]["requires_human_approval"], true);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/not-a-real-route").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
