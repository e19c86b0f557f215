//! IssueController: per-issue execution state machine
//! (`idle -> preparing -> executing -> verifying -> done`, with
//! `blocked`/`failed` side branches).

use crate::backoff::retry_delay_ms;
use crate::database::Database;
use crate::ports::{AgentRoster, SandboxEvent, SandboxRpc, SandboxTaskRequest};
use crate::stateful_entity::{CanonicalMirror, StatefulEntity};
use crate::state_machine::{MachineContext, PendingAction, Snapshot};
use crate::tool_availability::check_tools;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const MAX_VERIFICATION_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Idle,
    Preparing,
    Executing,
    Blocked,
    Verifying,
    Done,
    Failed,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueState::Idle => "idle",
            IssueState::Preparing => "preparing",
            IssueState::Executing => "executing",
            IssueState::Blocked => "blocked",
            IssueState::Verifying => "verifying",
            IssueState::Done => "done",
            IssueState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IssueState::Done | IssueState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResults {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl Default for TestResults {
    fn default() -> Self {
        Self { passed: 0, failed: 0, skipped: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRef {
    pub sha: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignAgentRequest {
    pub agent: String,
    pub credential: String,
    pub issue_id: String,
    pub repo: String,
    pub installation_id: i64,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: String,
    pub design: String,
    pub required_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IssueContext {
    pub assigned_agent: Option<String>,
    pub agent_credential: Option<String>,
    pub repo: Option<String>,
    pub installation_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: String,
    pub design: String,
    pub required_tools: Vec<String>,
    pub available_tools: Vec<String>,
    pub missing_tools: Vec<String>,
    pub session_id: Option<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub pr_number: Option<i64>,
    pub commits: Vec<CommitRef>,
    pub test_results: TestResults,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub max_retries: u32,
    pub verification_attempts: u32,
    pub verification_errors: Vec<String>,
    #[serde(default)]
    pub pending_actions: Vec<PendingAction>,
}

impl MachineContext for IssueContext {
    fn pending_actions_mut(&mut self) -> &mut Vec<PendingAction> {
        &mut self.pending_actions
    }
}

#[derive(Debug, Clone)]
pub enum IssueEvent {
    AssignAgent(AssignAgentRequest),
    ToolsReady(Vec<String>),
    ToolsMissing(Vec<String>),
    Completed { pr_number: Option<i64>, commits: Vec<CommitRef>, test_results: TestResults },
    Failed(String),
    Timeout,
    Rejected(String),
    Verified,
    Retry,
    Cancel,
}

impl IssueEvent {
    fn name(&self) -> &'static str {
        match self {
            IssueEvent::AssignAgent(_) => "ASSIGN_AGENT",
            IssueEvent::ToolsReady(_) => "TOOLS_READY",
            IssueEvent::ToolsMissing(_) => "TOOLS_MISSING",
            IssueEvent::Completed { .. } => "COMPLETED",
            IssueEvent::Failed(_) => "FAILED",
            IssueEvent::Timeout => "TIMEOUT",
            IssueEvent::Rejected(_) => "REJECTED",
            IssueEvent::Verified => "VERIFIED",
            IssueEvent::Retry => "RETRY",
            IssueEvent::Cancel => "CANCEL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    State { state: String, context: IssueContext },
    AgentEvent { session_id: String, event: SandboxEvent },
}

/// Pure transition function: `(state, event, context) -> (next_state, context')`.
/// Side effects are appended to `context.pending_actions`, never executed here.
fn transition(state: IssueState, event: IssueEvent, mut ctx: IssueContext) -> (IssueState, IssueContext) {
    use IssueEvent::*;
    use IssueState::*;

    if let Cancel = event {
        ctx.last_error = Some("Cancelled".to_string());
        return (Failed, ctx);
    }

    match (state, event) {
        (Idle, AssignAgent(req)) => {
            ctx.assigned_agent = Some(req.agent);
            ctx.agent_credential = Some(req.credential);
            ctx.repo = Some(req.repo);
            ctx.installation_id = Some(req.installation_id);
            ctx.title = req.title;
            ctx.description = req.description;
            ctx.acceptance_criteria = req.acceptance_criteria;
            ctx.design = req.design;
            ctx.required_tools = req.required_tools;
            ctx.push_action("check_tools", json!({ "issue_id": req.issue_id }));
            (Preparing, ctx)
        }
        (Preparing, ToolsReady(available)) | (Blocked, ToolsReady(available)) => {
            ctx.available_tools = available;
            ctx.missing_tools.clear();
            ctx.push_action("execute_task", json!({}));
            (Executing, ctx)
        }
        (Preparing, ToolsMissing(missing)) => {
            ctx.missing_tools = missing;
            (Blocked, ctx)
        }
        (Executing, Completed { pr_number, commits, test_results }) => {
            ctx.pr_number = pr_number;
            ctx.commits = commits;
            ctx.test_results = test_results;
            ctx.completed_at = Some(chrono::Utc::now());
            ctx.push_action("verify_results", json!({}));
            (Verifying, ctx)
        }
        (Executing, ev @ Failed(_)) | (Executing, ev @ Timeout) => {
            let err = match &ev {
                Failed(e) => e.clone(),
                Timeout => "Timeout".to_string(),
                _ => unreachable!(),
            };
            ctx.last_error = Some(err);
            ctx.error_count += 1;
            if ctx.error_count < ctx.max_retries {
                let delay_ms = retry_delay_ms(1000, ctx.error_count - 1);
                ctx.push_action("schedule_alarm", json!({ "delay_ms": delay_ms }));
                (Executing, ctx)
            } else {
                (Failed, ctx)
            }
        }
        (Executing, Retry) => {
            ctx.push_action("execute_task", json!({}));
            (Executing, ctx)
        }
        (Verifying, Verified) => (Done, ctx),
        (Verifying, Rejected(reason)) => {
            ctx.verification_attempts += 1;
            ctx.verification_errors.push(reason);
            if ctx.verification_attempts < MAX_VERIFICATION_ATTEMPTS {
                ctx.push_action("execute_task", json!({}));
                (Executing, ctx)
            } else {
                (Failed, ctx)
            }
        }
        (s, _) => (s, ctx),
    }
}

pub struct IssueController {
    db: Database,
    entity: StatefulEntity,
    snapshot: Mutex<Snapshot<IssueContext>>,
    issue_id: String,
    sandbox: Arc<dyn SandboxRpc>,
    roster: Arc<dyn AgentRoster>,
    active_connections: Vec<String>,
    events_tx: broadcast::Sender<WsMessage>,
}

impl IssueController {
    pub async fn new(
        db: Database,
        mirror: Arc<dyn CanonicalMirror>,
        issue_id: impl Into<String>,
        sandbox: Arc<dyn SandboxRpc>,
        roster: Arc<dyn AgentRoster>,
        active_connections: Vec<String>,
    ) -> crate::error::Result<Self> {
        let issue_id = issue_id.into();
        let entity = StatefulEntity::new(db.clone(), mirror, "issue", issue_id.clone(), "machineState");
        let snapshot = match entity.load_snapshot().await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| default_snapshot()),
            None => default_snapshot(),
        };
        let (tx, _rx) = broadcast::channel(256);
        Ok(Self {
            db,
            entity,
            snapshot: Mutex::new(snapshot),
            issue_id,
            sandbox,
            roster,
            active_connections,
            events_tx: tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsMessage> {
        self.events_tx.subscribe()
    }

    pub async fn snapshot(&self) -> (IssueState, IssueContext) {
        let snap = self.snapshot.lock().await;
        (state_from_str(&snap.value), snap.context.clone())
    }

    pub async fn assign_agent(&self, req: AssignAgentRequest) -> crate::error::Result<()> {
        let mut guard = self.snapshot.lock().await;
        let state = state_from_str(&guard.value);
        if state != IssueState::Idle {
            return Err(crate::error::Error::InvalidStateTransition {
                from: state.as_str().to_string(),
                event: "ASSIGN_AGENT".to_string(),
            });
        }
        if self.roster.resolve(&req.agent).await.map_err(|e| crate::error::Error::Other(e.to_string()))?.is_none() {
            return Err(crate::error::Error::UnknownAgent(req.agent));
        }
        self.dispatch(&mut guard, IssueEvent::AssignAgent(req)).await
    }

    pub async fn cancel(&self) -> crate::error::Result<()> {
        let mut guard = self.snapshot.lock().await;
        self.dispatch(&mut guard, IssueEvent::Cancel).await
    }

    pub async fn last_transitions(&self, limit: i64) -> crate::error::Result<Vec<(String, String, String, String)>> {
        self.db.last_transitions(&self.issue_id, limit).await
    }

    pub async fn events_for_session(&self, session_id: &str) -> crate::error::Result<Vec<(String, serde_json::Value, String)>> {
        self.db.events_for_session(session_id).await
    }

    pub async fn tool_check_history(&self) -> crate::error::Result<Vec<(Vec<String>, Vec<String>, String)>> {
        self.db.tool_checks_for_issue(&self.issue_id).await
    }

    pub async fn verification_history(&self) -> crate::error::Result<Vec<(bool, Option<String>, String)>> {
        self.db.verifications_for_issue(&self.issue_id).await
    }

    /// Apply one event, persist, and drain + execute pending actions,
    /// recursively feeding back any events they produce.
    async fn dispatch(&self, guard: &mut Snapshot<IssueContext>, event: IssueEvent) -> crate::error::Result<()> {
        let from = guard.value.clone();
        let event_name = event.name();
        let state = state_from_str(&from);
        let (next_state, mut ctx) = transition(state, event, guard.context.clone());

        guard.record(&from, event_name, next_state.as_str());
        guard.value = next_state.as_str().to_string();

        let actions = ctx.drain_actions();
        guard.context = ctx;

        self.db.insert_transition(&self.issue_id, &from, event_name, next_state.as_str()).await?;
        let serialized = serde_json::to_string(&*guard)?;
        self.entity.on_transition(serialized).await?;
        self.events_tx
            .send(WsMessage::State { state: guard.value.clone(), context: guard.context.clone() })
            .ok();

        for action in actions {
            if let Some(followup) = self.execute_action(guard, action).await? {
                // Box the recursion via an explicit loop below instead of
                // async recursion (not directly expressible without boxing).
                self.dispatch_boxed(guard, followup).await?;
            }
        }
        Ok(())
    }

    fn dispatch_boxed<'a>(
        &'a self,
        guard: &'a mut Snapshot<IssueContext>,
        event: IssueEvent,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::error::Result<()>> + Send + 'a>> {
        Box::pin(self.dispatch(guard, event))
    }

    async fn execute_action(
        &self,
        guard: &mut Snapshot<IssueContext>,
        action: PendingAction,
    ) -> crate::error::Result<Option<IssueEvent>> {
        match action.kind.as_str() {
            "check_tools" => {
                let agent_id = guard.context.assigned_agent.clone().unwrap_or_default();
                let patterns = self
                    .roster
                    .resolve(&agent_id)
                    .await
                    .map_err(|e| crate::error::Error::Other(e.to_string()))?
                    .map(|a| a.tool_patterns)
                    .unwrap_or_default();
                let result = check_tools(&guard.context.required_tools, &patterns, &self.active_connections);
                self.db
                    .insert_agent_event(
                        &self.issue_id,
                        "tool_check",
                        &json!({ "missing": result.missing }),
                    )
                    .await
                    .ok();
                self.db
                    .insert_tool_check(&self.issue_id, &guard.context.required_tools, &result.missing)
                    .await
                    .ok();
                if result.missing.is_empty() {
                    Ok(Some(IssueEvent::ToolsReady(result.available)))
                } else {
                    Ok(Some(IssueEvent::ToolsMissing(result.missing)))
                }
            }
            "execute_task" => {
                let session_id = uuid::Uuid::new_v4().to_string();
                guard.context.session_id = Some(session_id.clone());
                guard.context.started_at = Some(chrono::Utc::now());

                let yaml_header = serde_yaml::to_string(&json!({
                    "issue_id": self.issue_id,
                    "repo": guard.context.repo,
                    "title": guard.context.title,
                    "description": guard.context.description,
                    "acceptance_criteria": guard.context.acceptance_criteria,
                    "design": guard.context.design,
                }))?;
                let instructions = format!("{yaml_header}---\n");

                let request = SandboxTaskRequest {
                    session_id: session_id.clone(),
                    instructions,
                    stream: true,
                    timeout_secs: 600,
                    max_steps: 50,
                };

                let mut receiver = self
                    .sandbox
                    .submit_task(request)
                    .await
                    .map_err(|e| crate::error::Error::Other(e.to_string()))?;

                let mut artifacts = Vec::new();
                let mut outcome_event = None;
                while let Some(event) = receiver.recv().await {
                    self.db
                        .insert_agent_event(&session_id, event_kind(&event), &serde_json::to_value(&event)?)
                        .await
                        .ok();
                    self.events_tx
                        .send(WsMessage::AgentEvent { session_id: session_id.clone(), event: event.clone() })
                        .ok();
                    match event {
                        SandboxEvent::Artifact { artifact } => artifacts.push(artifact),
                        SandboxEvent::Completed { artifacts: final_artifacts } => {
                            artifacts = final_artifacts;
                            outcome_event = Some(build_completed_event(&artifacts));
                        }
                        SandboxEvent::Timeout => outcome_event = Some(IssueEvent::Timeout),
                        SandboxEvent::Error { message } => outcome_event = Some(IssueEvent::Failed(message)),
                        SandboxEvent::Step { .. } => {}
                    }
                }
                Ok(outcome_event.or_else(|| Some(build_completed_event(&artifacts))))
            }
            "schedule_alarm" => {
                let delay_ms = action.payload.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(1000);
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                // Alarm fires; caller re-checks state before honoring RETRY.
                Ok(Some(IssueEvent::Retry))
            }
            "verify_results" => {
                let reason = if guard.context.pr_number.is_none() {
                    Some("pr_missing")
                } else if guard.context.test_results.failed > 0 {
                    Some("tests_failed")
                } else if guard.context.commits.is_empty() {
                    Some("no_commits")
                } else {
                    None
                };
                self.db
                    .insert_transition(&self.issue_id, "verifying", "verify_results", reason.unwrap_or("passed"))
                    .await
                    .ok();
                self.db
                    .insert_verification(
                        &self.issue_id,
                        guard.context.session_id.as_deref().unwrap_or(""),
                        reason.is_none(),
                        reason,
                    )
                    .await
                    .ok();
                match reason {
                    Some(r) => Ok(Some(IssueEvent::Rejected(r.to_string()))),
                    None => Ok(Some(IssueEvent::Verified)),
                }
            }
            _ => Ok(None),
        }
    }
}

fn build_completed_event(artifacts: &[crate::ports::SandboxArtifact]) -> IssueEvent {
    let pr_number = artifacts
        .iter()
        .find(|a| a.kind == "pr")
        .and_then(|a| a.artifact_ref.rsplit('#').next())
        .and_then(|digits| digits.parse::<i64>().ok());
    let commits = artifacts
        .iter()
        .filter(|a| a.kind == "commit")
        .map(|a| CommitRef { sha: a.artifact_ref.clone(), message: a.message.clone().unwrap_or_default() })
        .collect();
    IssueEvent::Completed { pr_number, commits, test_results: TestResults::default() }
}

fn event_kind(event: &SandboxEvent) -> &'static str {
    match event {
        SandboxEvent::Step { .. } => "step",
        SandboxEvent::Artifact { .. } => "artifact",
        SandboxEvent::Completed { .. } => "completed",
        SandboxEvent::Timeout => "timeout",
        SandboxEvent::Error { .. } => "error",
    }
}

fn default_snapshot() -> Snapshot<IssueContext> {
    let mut ctx = IssueContext::default();
    ctx.max_retries = 3;
    Snapshot::new(IssueState::Idle.as_str(), ctx)
}

fn state_from_str(s: &str) -> IssueState {
    match s {
        "preparing" => IssueState::Preparing,
        "executing" => IssueState::Executing,
        "blocked" => IssueState::Blocked,
        "verifying" => IssueState::Verifying,
        "done" => IssueState::Done,
        "failed" => IssueState::Failed,
        _ => IssueState::Idle,
    }
}
