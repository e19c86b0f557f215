//! PRController: per-PR review pipeline
//! (`pending -> reviewing -> fixing -> checkingApproval -> approved ->
//! awaiting_approval -> merging -> merged`), with escalation, approval
//! gates, risk assessment, retry, and rollback.

use crate::audit_log::AuditLog;
use crate::backoff::retry_delay_ms;
use crate::database::Database;
use crate::glob_match::any_matches;
use crate::ports::{HostApi, SandboxEvent, SandboxRpc, SandboxTaskRequest};
use crate::stateful_entity::{CanonicalMirror, StatefulEntity};
use crate::state_machine::{MachineContext, PendingAction, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Pending,
    Reviewing,
    Fixing,
    CheckingApproval,
    Approved,
    AwaitingApproval,
    Merging,
    Merged,
    Closed,
    Error,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrState::Pending => "pending",
            PrState::Reviewing => "reviewing",
            PrState::Fixing => "fixing",
            PrState::CheckingApproval => "checkingApproval",
            PrState::Approved => "approved",
            PrState::AwaitingApproval => "awaiting_approval",
            PrState::Merging => "merging",
            PrState::Merged => "merged",
            PrState::Closed => "closed",
            PrState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PrState::Merged | PrState::Closed)
    }
}

fn state_from_str(s: &str) -> PrState {
    match s {
        "reviewing" => PrState::Reviewing,
        "fixing" => PrState::Fixing,
        "checkingApproval" => PrState::CheckingApproval,
        "approved" => PrState::Approved,
        "awaiting_approval" => PrState::AwaitingApproval,
        "merging" => PrState::Merging,
        "merged" => PrState::Merged,
        "closed" => PrState::Closed,
        "error" => PrState::Error,
        _ => PrState::Pending,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerType {
    Agent,
    Human,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerConfig {
    pub agent: String,
    #[serde(rename = "type")]
    pub reviewer_type: ReviewerType,
    pub credential: String,
    pub can_escalate: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub reviewer: String,
    pub decision: ReviewDecision,
    pub comment: String,
    pub escalations: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    fn rank(&self) -> u8 {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
            RiskLevel::Critical => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub factors: Vec<String>,
    pub touches_critical_path: bool,
    pub requires_human_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApprovalGateConfig {
    pub require_human_approval: bool,
    pub allow_full_autonomy: bool,
    pub risk_threshold: Option<RiskThreshold>,
    pub critical_paths: Vec<String>,
    pub auto_approve_labels: Vec<String>,
    pub require_approval_labels: Vec<String>,
    #[serde(default)]
    pub inherit_from_org: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskThreshold {
    Low,
    Medium,
    High,
}

impl RiskThreshold {
    fn rank(&self) -> u8 {
        match self {
            RiskThreshold::Low => 0,
            RiskThreshold::Medium => 1,
            RiskThreshold::High => 2,
        }
    }
}

/// Merge `defaults <- org <- repo` unless the repo config opts out of
/// org inheritance.
pub fn merge_configs(org: &ApprovalGateConfig, repo: &ApprovalGateConfig) -> ApprovalGateConfig {
    if !repo.inherit_from_org {
        return repo.clone();
    }
    ApprovalGateConfig {
        require_human_approval: repo.require_human_approval || org.require_human_approval,
        allow_full_autonomy: repo.allow_full_autonomy || org.allow_full_autonomy,
        risk_threshold: repo.risk_threshold.or(org.risk_threshold),
        critical_paths: if repo.critical_paths.is_empty() { org.critical_paths.clone() } else { repo.critical_paths.clone() },
        auto_approve_labels: merge_unique(&org.auto_approve_labels, &repo.auto_approve_labels),
        require_approval_labels: merge_unique(&org.require_approval_labels, &repo.require_approval_labels),
        inherit_from_org: true,
    }
}

fn merge_unique(a: &[String], b: &[String]) -> Vec<String> {
    let mut out = a.to_vec();
    for item in b {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

/// Risk assessment over `files_changed` against `critical_paths` globs.
pub fn assess_risk(files_changed: &[String], config: &ApprovalGateConfig) -> RiskAssessment {
    let touches_critical_path = files_changed
        .iter()
        .any(|f| any_matches(&config.critical_paths, f));

    let mut factors = Vec::new();
    let level = if touches_critical_path {
        factors.push("touches_critical_path".to_string());
        RiskLevel::Critical
    } else if files_changed.len() > 50 {
        factors.push(format!("{} files changed", files_changed.len()));
        RiskLevel::High
    } else if files_changed.len() > 20 {
        factors.push(format!("{} files changed", files_changed.len()));
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    let threshold = config.risk_threshold.unwrap_or(RiskThreshold::High);
    let requires_human_approval = level.rank() >= threshold.rank() || touches_critical_path;

    RiskAssessment { level, factors, touches_critical_path, requires_human_approval }
}

pub fn can_auto_merge(
    config: &ApprovalGateConfig,
    human_approval_granted: bool,
    labels: &[String],
    risk: &Option<RiskAssessment>,
) -> bool {
    config.allow_full_autonomy
        || human_approval_granted
        || labels.iter().any(|l| config.auto_approve_labels.contains(l))
        || risk.as_ref().map(|r| !r.requires_human_approval).unwrap_or(false)
}

pub fn requires_human_approval(config: &ApprovalGateConfig, labels: &[String], risk: &Option<RiskAssessment>) -> bool {
    config.require_human_approval
        || labels.iter().any(|l| config.require_approval_labels.contains(l))
        || risk.as_ref().map(|r| r.requires_human_approval).unwrap_or(false)
}

/// Extract a deduplicated ordered list of agent names from
/// `<!-- escalate: a, b -->` markers.
pub fn parse_escalations(body: &str) -> Vec<String> {
    let re = regex::Regex::new(r"<!--\s*escalate:\s*([^>]*?)\s*-->").unwrap();
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for cap in re.captures_iter(body) {
        for name in cap[1].split(',') {
            let name = name.trim().to_string();
            if !name.is_empty() && seen.insert(name.clone()) {
                out.push(name);
            }
        }
    }
    out
}

/// Insert honored escalation targets immediately after `current_index`,
/// preserving the order of remaining reviewers.
pub fn apply_escalations(
    reviewers: &mut Vec<ReviewerConfig>,
    current_index: usize,
    can_escalate: &[String],
    requested: &[String],
) -> Vec<String> {
    let existing: std::collections::HashSet<String> = reviewers.iter().map(|r| r.agent.clone()).collect();
    let mut honored = Vec::new();
    for name in requested {
        if can_escalate.contains(name) && !existing.contains(name) {
            honored.push(name.clone());
        }
    }
    for (offset, name) in honored.iter().enumerate() {
        reviewers.insert(
            current_index + 1 + offset,
            ReviewerConfig {
                agent: name.clone(),
                reviewer_type: ReviewerType::Agent,
                credential: String::new(),
                can_escalate: vec![],
            },
        );
    }
    honored
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PrContext {
    pub pr_number: i64,
    pub repo_full_name: String,
    pub installation_id: i64,
    pub author_agent: String,
    pub author_credential: String,
    pub reviewers: Vec<ReviewerConfig>,
    pub current_reviewer_index: usize,
    pub current_session_id: Option<String>,
    pub review_outcomes: Vec<ReviewOutcome>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub merge_type: Option<String>,
    pub approval_gates: ApprovalGateConfig,
    pub risk_assessment: Option<RiskAssessment>,
    pub human_approval_granted: bool,
    pub human_approver: Option<String>,
    pub issue_labels: Vec<String>,
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub pending_actions: Vec<PendingAction>,
}

impl MachineContext for PrContext {
    fn pending_actions_mut(&mut self) -> &mut Vec<PendingAction> {
        &mut self.pending_actions
    }
}

#[derive(Debug, Clone)]
pub enum PrEvent {
    ConfigLoaded { org: ApprovalGateConfig, repo: ApprovalGateConfig, labels: Vec<String>, files_changed: Vec<String> },
    SessionStarted(String),
    SessionFailed(String),
    Retry,
    ReviewComplete { decision: ReviewDecision, comment: String, escalations: Vec<String> },
    FixComplete,
    /// Internal follow-up to `check_approval`: reviewer queue exhausted,
    /// re-enters the machine so the reviewer-advance/merge-gate decision
    /// persists like any other transition.
    ApprovalResolved,
    HumanApproval { approved: bool, approver: String },
    /// Internal follow-up to a `merge_pr` action.
    MergeComplete,
    MergeFailed(String),
    Close { merged: bool },
}

impl PrEvent {
    fn name(&self) -> &'static str {
        match self {
            PrEvent::ConfigLoaded { .. } => "CONFIG_LOADED",
            PrEvent::SessionStarted(_) => "SESSION_STARTED",
            PrEvent::SessionFailed(_) => "SESSION_FAILED",
            PrEvent::Retry => "RETRY",
            PrEvent::ReviewComplete { .. } => "REVIEW_COMPLETE",
            PrEvent::FixComplete => "FIX_COMPLETE",
            PrEvent::ApprovalResolved => "APPROVAL_RESOLVED",
            PrEvent::HumanApproval { .. } => "HUMAN_APPROVAL",
            PrEvent::MergeComplete => "MERGE_COMPLETE",
            PrEvent::MergeFailed(_) => "MERGE_FAILED",
            PrEvent::Close { .. } => "CLOSE",
        }
    }
}

fn transition(state: PrState, event: PrEvent, mut ctx: PrContext) -> (PrState, PrContext) {
    use PrEvent::*;
    use PrState::*;

    if let Close { merged } = &event {
        ctx.merge_type = Some(if *merged { "forced".to_string() } else { "none".to_string() });
        return (if *merged { Merged } else { Closed }, ctx);
    }

    match (state, event) {
        (Pending, ConfigLoaded { org, repo, labels, files_changed }) => {
            ctx.approval_gates = merge_configs(&org, &repo);
            ctx.issue_labels = labels;
            ctx.files_changed = files_changed.clone();
            ctx.risk_assessment = Some(assess_risk(&files_changed, &ctx.approval_gates));
            ctx.push_action("dispatch_review", json!({ "reviewer_index": 0 }));
            (Reviewing, ctx)
        }
        (Reviewing, SessionStarted(session_id)) => {
            ctx.current_session_id = Some(session_id);
            (Reviewing, ctx)
        }
        (Reviewing, SessionFailed(err)) => {
            ctx.last_error = Some(err);
            ctx.retry_count += 1;
            if ctx.retry_count < MAX_RETRIES {
                let delay_ms = retry_delay_ms(1000, ctx.retry_count - 1);
                ctx.push_action("schedule_alarm", json!({ "delay_ms": delay_ms }));
                (Reviewing, ctx)
            } else {
                (Error, ctx)
            }
        }
        (Reviewing, Retry) => {
            ctx.push_action("dispatch_review", json!({ "reviewer_index": ctx.current_reviewer_index }));
            (Reviewing, ctx)
        }
        (Reviewing, ReviewComplete { decision, comment, escalations }) => {
            let reviewer = ctx
                .reviewers
                .get(ctx.current_reviewer_index)
                .map(|r| r.agent.clone())
                .unwrap_or_default();
            let can_escalate = ctx
                .reviewers
                .get(ctx.current_reviewer_index)
                .map(|r| r.can_escalate.clone())
                .unwrap_or_default();
            let honored = apply_escalations(&mut ctx.reviewers, ctx.current_reviewer_index, &can_escalate, &escalations);

            ctx.review_outcomes.push(ReviewOutcome {
                reviewer,
                decision,
                comment,
                escalations: honored,
                timestamp: chrono::Utc::now(),
            });

            match decision {
                ReviewDecision::Approved => {
                    ctx.push_action("check_approval", json!({}));
                    (CheckingApproval, ctx)
                }
                ReviewDecision::ChangesRequested => {
                    ctx.retry_count = 0;
                    ctx.push_action("dispatch_fix", json!({}));
                    (Fixing, ctx)
                }
            }
        }
        (Fixing, FixComplete) => {
            ctx.push_action("dispatch_review", json!({ "reviewer_index": ctx.current_reviewer_index }));
            (Reviewing, ctx)
        }
        (CheckingApproval, ApprovalResolved) => advance_after_approval(ctx),
        (CheckingApproval, _unused @ _) => (CheckingApproval, ctx),
        (Approved, _) => (Approved, ctx),
        (Merging, MergeComplete) => (Merged, ctx),
        (Merging, MergeFailed(err)) => {
            ctx.last_error = Some(err);
            (Error, ctx)
        }
        (AwaitingApproval, HumanApproval { approved, approver }) => {
            ctx.human_approval_granted = approved;
            ctx.human_approver = Some(approver);
            if approved {
                ctx.merge_type = Some("approved".to_string());
                ctx.push_action("merge_pr", json!({}));
                (Merging, ctx)
            } else {
                (Closed, ctx)
            }
        }
        (s, _) => (s, ctx),
    }
}

/// Resolves `CheckingApproval` on the `ApprovalResolved` event: advances
/// the reviewer index, or, once the queue is exhausted, decides between
/// auto-merge, awaiting human approval, or holding as approved. Kept as
/// a standalone helper since it fans out over the full reviewer list
/// rather than a single match arm's fields.
pub fn advance_after_approval(mut ctx: PrContext) -> (PrState, PrContext) {
    if ctx.current_reviewer_index + 1 < ctx.reviewers.len() {
        ctx.current_reviewer_index += 1;
        ctx.push_action("dispatch_review", json!({ "reviewer_index": ctx.current_reviewer_index }));
        return (PrState::Reviewing, ctx);
    }

    let can_merge = can_auto_merge(&ctx.approval_gates, ctx.human_approval_granted, &ctx.issue_labels, &ctx.risk_assessment);
    let needs_human = requires_human_approval(&ctx.approval_gates, &ctx.issue_labels, &ctx.risk_assessment);

    if can_merge {
        ctx.merge_type = Some("auto".to_string());
        ctx.push_action("merge_pr", json!({}));
        (PrState::Merging, ctx)
    } else if needs_human {
        (PrState::AwaitingApproval, ctx)
    } else {
        (PrState::Approved, ctx)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackInfo {
    pub target_commit: String,
    pub reason: String,
    pub requested_by: String,
    pub rollback_pr: Option<i64>,
    pub rollback_branch: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct PrController {
    db: Database,
    entity: StatefulEntity,
    snapshot: Mutex<Snapshot<PrContext>>,
    pr_number: i64,
    host: Arc<dyn HostApi>,
    sandbox: Arc<dyn SandboxRpc>,
}

impl PrController {
    pub async fn new(
        db: Database,
        mirror: Arc<dyn CanonicalMirror>,
        pr_number: i64,
        host: Arc<dyn HostApi>,
        sandbox: Arc<dyn SandboxRpc>,
    ) -> crate::error::Result<Self> {
        let entity_ref = format!("pr-{pr_number}");
        let entity = StatefulEntity::new(db.clone(), mirror, "pull_request", entity_ref, "prState");
        let snapshot = match entity.load_snapshot().await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| default_snapshot(pr_number)),
            None => default_snapshot(pr_number),
        };
        Ok(Self { db, entity, snapshot: Mutex::new(snapshot), pr_number, host, sandbox })
    }

    pub async fn snapshot(&self) -> (PrState, PrContext) {
        let snap = self.snapshot.lock().await;
        (state_from_str(&snap.value), snap.context.clone())
    }

    pub async fn handle_event(&self, event: PrEvent) -> crate::error::Result<()> {
        let mut guard = self.snapshot.lock().await;
        self.apply(&mut guard, event).await
    }

    /// Apply one event, persist, and drain + execute pending actions,
    /// recursively feeding back any follow-up events they produce (same
    /// shape as `IssueController::dispatch`).
    async fn apply(&self, guard: &mut Snapshot<PrContext>, event: PrEvent) -> crate::error::Result<()> {
        let from = guard.value.clone();
        let event_name = event.name();
        let state = state_from_str(&from);
        let (next_state, mut ctx) = transition(state, event, guard.context.clone());
        let actions = ctx.drain_actions();

        guard.record(&from, event_name, next_state.as_str());
        guard.value = next_state.as_str().to_string();
        guard.context = ctx;

        self.db.insert_transition(&format!("pr-{}", self.pr_number), &from, event_name, next_state.as_str()).await?;
        let serialized = serde_json::to_string(&*guard)?;
        self.entity.on_transition(serialized).await?;

        let audit = AuditLog::new(&self.db);
        audit
            .append("transition", &format!("pr-{}", self.pr_number), guard.context.current_session_id.as_deref(), json!({ "from": from, "to": guard.value }))
            .await;

        for action in actions {
            if let Some(followup) = self.execute_action(guard, action).await? {
                self.apply_boxed(guard, followup).await?;
            }
        }
        Ok(())
    }

    fn apply_boxed<'a>(
        &'a self,
        guard: &'a mut Snapshot<PrContext>,
        event: PrEvent,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::error::Result<()>> + Send + 'a>> {
        Box::pin(self.apply(guard, event))
    }

    async fn execute_action(&self, guard: &mut Snapshot<PrContext>, action: PendingAction) -> crate::error::Result<Option<PrEvent>> {
        match action.kind.as_str() {
            "dispatch_review" | "dispatch_fix" => {
                let session_id = uuid::Uuid::new_v4().to_string();
                let request = SandboxTaskRequest {
                    session_id: session_id.clone(),
                    instructions: format!("review pr #{}", self.pr_number),
                    stream: true,
                    timeout_secs: 600,
                    max_steps: 50,
                };
                match self.sandbox.submit_task(request).await {
                    Ok(mut receiver) => {
                        while let Some(_event) = receiver.recv().await {
                            // Streamed review/fix events are persisted as
                            // agent_events keyed by this session, same as
                            // IssueController's execution sessions.
                            self.db.insert_agent_event(&session_id, "review_event", &json!({})).await.ok();
                        }
                        Ok(Some(PrEvent::SessionStarted(session_id)))
                    }
                    Err(err) => Ok(Some(PrEvent::SessionFailed(err.to_string()))),
                }
            }
            "check_approval" => Ok(Some(PrEvent::ApprovalResolved)),
            "merge_pr" => {
                let method = guard.context.merge_type.clone().unwrap_or_else(|| "auto".to_string());
                match self.host.merge_pr(&guard.context.repo_full_name, self.pr_number, &method).await {
                    Ok(()) => Ok(Some(PrEvent::MergeComplete)),
                    Err(err) => {
                        tracing::warn!(pr = self.pr_number, error = %err, "merge failed");
                        Ok(Some(PrEvent::MergeFailed(err.to_string())))
                    }
                }
            }
            _ => Ok(None),
        }
    }

    /// Create a revert branch + PR, audit the action. Failure is audited
    /// as `rollback_failed` and returned as an error; it never changes the
    /// primary PR's state.
    pub async fn rollback(&self, target_commit: &str, reason: &str, requested_by: &str) -> crate::error::Result<RollbackInfo> {
        let guard = self.snapshot.lock().await;
        let repo = guard.context.repo_full_name.clone();
        drop(guard);

        let branch = format!("revert-{}-{}", self.pr_number, &target_commit[..target_commit.len().min(7)]);
        let audit = AuditLog::new(&self.db);

        match self.host.create_pr(&repo, &format!("Revert to {target_commit}"), reason, &branch, "main").await {
            Ok(rollback_pr) => {
                let info = RollbackInfo {
                    target_commit: target_commit.to_string(),
                    reason: reason.to_string(),
                    requested_by: requested_by.to_string(),
                    rollback_pr: Some(rollback_pr),
                    rollback_branch: branch.clone(),
                    timestamp: chrono::Utc::now(),
                };
                self.db.kv_set("rollbackInfo", &serde_json::to_string(&info)?).await?;
                audit
                    .append("rollback_created", &format!("pr-{}", self.pr_number), None, json!({ "rollback_pr": rollback_pr, "branch": branch }))
                    .await;
                Ok(info)
            }
            Err(err) => {
                audit
                    .append("rollback_failed", &format!("pr-{}", self.pr_number), None, json!({ "error": err.to_string() }))
                    .await;
                Err(crate::error::Error::Other(format!("rollback failed: {err}")))
            }
        }
    }

    pub async fn rollback_info(&self) -> crate::error::Result<Option<RollbackInfo>> {
        match self.db.kv_get("rollbackInfo").await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }
}

fn default_snapshot(pr_number: i64) -> Snapshot<PrContext> {
    let mut ctx = PrContext::default();
    ctx.pr_number = pr_number;
    Snapshot::new(PrState::Pending.as_str(), ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reviewer(agent: &str, can_escalate: &[&str]) -> ReviewerConfig {
        ReviewerConfig {
            agent: agent.to_string(),
            reviewer_type: ReviewerType::Agent,
            credential: String::new(),
            can_escalate: can_escalate.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn escalation_insertion_scenario() {
        let mut reviewers = vec![reviewer("quinn", &["sam"]), reviewer("dana", &[])];
        let requested = parse_escalations("lgtm <!-- escalate: sam -->");
        assert_eq!(requested, vec!["sam".to_string()]);

        let can_escalate = reviewers[0].can_escalate.clone();
        let honored = apply_escalations(&mut reviewers, 0, &can_escalate, &requested);
        assert_eq!(honored, vec!["sam".to_string()]);
        let names: Vec<&str> = reviewers.iter().map(|r| r.agent.as_str()).collect();
        assert_eq!(names, vec!["quinn", "sam", "dana"]);
    }

    #[test]
    fn escalation_ignores_non_honored_targets() {
        let mut reviewers = vec![reviewer("quinn", &["sam"]), reviewer("dana", &[])];
        let requested = vec!["nobody".to_string()];
        let honored = apply_escalations(&mut reviewers, 0, &["sam".to_string()], &requested);
        assert!(honored.is_empty());
        assert_eq!(reviewers.len(), 2);
    }

    #[test]
    fn risk_escalation_scenario() {
        let config = ApprovalGateConfig {
            critical_paths: vec!["**/auth/**".to_string()],
            risk_threshold: Some(RiskThreshold::High),
            ..Default::default()
        };
        let risk = assess_risk(&["src/auth/login.ts".to_string()], &config);
        assert_eq!(risk.level, RiskLevel::Critical);
        assert!(risk.touches_critical_path);
        assert!(risk.requires_human_approval);
    }

    #[test]
    fn risk_levels_scale_with_file_count() {
        let config = ApprovalGateConfig::default();
        let few: Vec<String> = (0..5).map(|i| format!("f{i}.rs")).collect();
        let many: Vec<String> = (0..30).map(|i| format!("f{i}.rs")).collect();
        let huge: Vec<String> = (0..60).map(|i| format!("f{i}.rs")).collect();
        assert_eq!(assess_risk(&few, &config).level, RiskLevel::Low);
        assert_eq!(assess_risk(&many, &config).level, RiskLevel::Medium);
        assert_eq!(assess_risk(&huge, &config).level, RiskLevel::High);
    }

    #[test]
    fn config_cascade_merges_org_then_repo() {
        let org = ApprovalGateConfig {
            auto_approve_labels: vec!["trusted".to_string()],
            ..Default::default()
        };
        let repo = ApprovalGateConfig {
            inherit_from_org: true,
            require_human_approval: true,
            ..Default::default()
        };
        let merged = merge_configs(&org, &repo);
        assert!(merged.require_human_approval);
        assert!(merged.auto_approve_labels.contains(&"trusted".to_string()));
    }

    #[test]
    fn repo_can_opt_out_of_org_inheritance() {
        let org = ApprovalGateConfig { allow_full_autonomy: true, ..Default::default() };
        let repo = ApprovalGateConfig { inherit_from_org: false, ..Default::default() };
        let merged = merge_configs(&org, &repo);
        assert!(!merged.allow_full_autonomy);
    }

    #[test]
    fn retry_backoff_sequence_matches_spec() {
        let mut ctx = PrContext::default();
        let mut state = PrState::Reviewing;
        for expected in [1000u64, 2000, 4000] {
            let (next, next_ctx) = transition(state, PrEvent::SessionFailed("boom".into()), ctx);
            state = next;
            ctx = next_ctx;
            if state == PrState::Reviewing {
                let delay = ctx.pending_actions.last().unwrap().payload["delay_ms"].as_u64().unwrap();
                assert_eq!(delay, expected);
            }
        }
        assert_eq!(state, PrState::Error);
    }

    #[test]
    fn changes_requested_goes_to_fixing_then_back_to_reviewing() {
        let ctx = PrContext { reviewers: vec![reviewer("quinn", &[])], ..Default::default() };
        let (state, ctx) = transition(
            PrState::Reviewing,
            PrEvent::ReviewComplete { decision: ReviewDecision::ChangesRequested, comment: "fix".into(), escalations: vec![] },
            ctx,
        );
        assert_eq!(state, PrState::Fixing);
        let (state, _) = transition(state, PrEvent::FixComplete, ctx);
        assert_eq!(state, PrState::Reviewing);
    }

    #[test]
    fn close_forced_sets_merge_type() {
        let (state, ctx) = transition(PrState::Reviewing, PrEvent::Close { merged: true }, PrContext::default());
        assert_eq!(state, PrState::Merged);
        assert_eq!(ctx.merge_type.as_deref(), Some("forced"));
    }

    #[test]
    fn awaiting_approval_denied_closes() {
        let (state, _) = transition(
            PrState::AwaitingApproval,
            PrEvent::HumanApproval { approved: false, approver: "alice".into() },
            PrContext::default(),
        );
        assert_eq!(state, PrState::Closed);
    }

    #[test]
    fn approval_resolved_advances_to_next_reviewer() {
        let ctx = PrContext {
            reviewers: vec![reviewer("quinn", &[]), reviewer("dana", &[])],
            current_reviewer_index: 0,
            ..Default::default()
        };
        let (state, ctx) = transition(PrState::CheckingApproval, PrEvent::ApprovalResolved, ctx);
        assert_eq!(state, PrState::Reviewing);
        assert_eq!(ctx.current_reviewer_index, 1);
        assert_eq!(ctx.pending_actions.last().unwrap().kind, "dispatch_review");
    }

    #[test]
    fn approval_resolved_with_exhausted_queue_autoapproves() {
        let ctx = PrContext {
            reviewers: vec![reviewer("quinn", &[])],
            current_reviewer_index: 0,
            approval_gates: ApprovalGateConfig { allow_full_autonomy: true, ..Default::default() },
            ..Default::default()
        };
        let (state, ctx) = transition(PrState::CheckingApproval, PrEvent::ApprovalResolved, ctx);
        assert_eq!(state, PrState::Merging);
        assert_eq!(ctx.pending_actions.last().unwrap().kind, "merge_pr");
    }

    #[test]
    fn approval_resolved_with_exhausted_queue_awaits_human() {
        let ctx = PrContext {
            reviewers: vec![reviewer("quinn", &[])],
            current_reviewer_index: 0,
            approval_gates: ApprovalGateConfig { require_human_approval: true, ..Default::default() },
            ..Default::default()
        };
        let (state, _) = transition(PrState::CheckingApproval, PrEvent::ApprovalResolved, ctx);
        assert_eq!(state, PrState::AwaitingApproval);
    }

    #[test]
    fn merge_complete_transitions_to_merged() {
        let (state, _) = transition(PrState::Merging, PrEvent::MergeComplete, PrContext::default());
        assert_eq!(state, PrState::Merged);
    }

    #[test]
    fn merge_failed_transitions_to_error_with_reason() {
        let (state, ctx) = transition(PrState::Merging, PrEvent::MergeFailed("409 conflict".into()), PrContext::default());
        assert_eq!(state, PrState::Error);
        assert_eq!(ctx.last_error.as_deref(), Some("409 conflict"));
    }
}
