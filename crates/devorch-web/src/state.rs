//! Shared application state: the long-lived `RepoController`, plus
//! lazily-created per-entity `IssueController`/`PrController` registries
//! (one controller instance per issue/PR, matching spec §5's "per-entity
//! single-threaded" concurrency model).

use devorch_core::database::Database;
use devorch_core::issue_controller::IssueController;
use devorch_core::ports::{AgentRoster, HostApi, SandboxRpc};
use devorch_core::pr_controller::PrController;
use devorch_core::repo_controller::RepoController;
use devorch_core::stateful_entity::CanonicalMirror;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub repo: Arc<RepoController>,
    pub host: Arc<dyn HostApi>,
    pub sandbox: Arc<dyn SandboxRpc>,
    pub roster: Arc<dyn AgentRoster>,
    pub mirror: Arc<dyn CanonicalMirror>,
    pub webhook_secret: Option<String>,
    issues: Arc<Mutex<HashMap<String, Arc<IssueController>>>>,
    prs: Arc<Mutex<HashMap<i64, Arc<PrController>>>>,
}

impl AppState {
    pub fn new(
        db: Database,
        repo: Arc<RepoController>,
        host: Arc<dyn HostApi>,
        sandbox: Arc<dyn SandboxRpc>,
        roster: Arc<dyn AgentRoster>,
        mirror: Arc<dyn CanonicalMirror>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            db,
            repo,
            host,
            sandbox,
            roster,
            mirror,
            webhook_secret,
            issues: Arc::new(Mutex::new(HashMap::new())),
            prs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn issue_controller(&self, issue_id: &str) -> devorch_core::error::Result<Arc<IssueController>> {
        let mut issues = self.issues.lock().await;
        if let Some(existing) = issues.get(issue_id) {
            return Ok(existing.clone());
        }
        let controller = Arc::new(
            IssueController::new(
                self.db.clone(),
                self.mirror.clone(),
                issue_id.to_string(),
                self.sandbox.clone(),
                self.roster.clone(),
                vec![],
            )
            .await?,
        );
        issues.insert(issue_id.to_string(), controller.clone());
        Ok(controller)
    }

    pub async fn pr_controller(&self, pr_number: i64) -> devorch_core::error::Result<Arc<PrController>> {
        let mut prs = self.prs.lock().await;
        if let Some(existing) = prs.get(&pr_number) {
            return Ok(existing.clone());
        }
        let controller = Arc::new(
            PrController::new(
                self.db.clone(),
                self.mirror.clone(),
                pr_number,
                self.host.clone(),
                self.sandbox.clone(),
            )
            .await?,
        );
        prs.insert(pr_number, controller.clone());
        Ok(controller)
    }
}
