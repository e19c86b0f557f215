//! RepoController: reconciles host issues, the in-repo JSON-lines backlog,
//! and the internal store; triggers development workflows for issues that
//! become newly ready.

use crate::backoff::commit_retry_delay;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::issue::Issue;
use crate::ports::{HostApi, HostIssuePayload, PutFileOutcome};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Protection window: a deletion candidate whose `last_sync_at` is within
/// this many seconds of `now` is not deleted (spec §4.3, tunable per §9).
pub const PROTECTION_WINDOW_SECS: i64 = 60;

const BACKLOG_PATH: &str = ".beads/issues.jsonl";
const MAX_COMMIT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportResult {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

/// Tracks development-workflow instance IDs so `develop-<issue.id>` is
/// started at most once while "running" or "paused".
#[derive(Default)]
pub struct WorkflowRegistry {
    active: Mutex<HashSet<String>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a new instance was started, false if one with this
    /// ID was already running/paused and the start was skipped.
    pub fn try_start(&self, instance_id: &str) -> bool {
        let mut active = self.active.lock().unwrap();
        if active.contains(instance_id) {
            false
        } else {
            active.insert(instance_id.to_string());
            true
        }
    }

    pub fn complete(&self, instance_id: &str) {
        self.active.lock().unwrap().remove(instance_id);
    }
}

pub struct RepoController {
    db: Database,
    host: Arc<dyn HostApi>,
    repo_full_name: String,
    workflows: Arc<WorkflowRegistry>,
}

impl RepoController {
    pub fn new(
        db: Database,
        host: Arc<dyn HostApi>,
        repo_full_name: impl Into<String>,
        workflows: Arc<WorkflowRegistry>,
    ) -> Self {
        Self {
            db,
            host,
            repo_full_name: repo_full_name.into(),
            workflows,
        }
    }

    // -- queries -------------------------------------------------------

    pub async fn get(&self, id: &str) -> Result<Option<Issue>> {
        self.db.get_issue(id).await
    }

    pub async fn list(&self) -> Result<Vec<Issue>> {
        self.db.list_issues().await
    }

    pub async fn list_ready(&self) -> Result<Vec<Issue>> {
        self.db.list_ready().await
    }

    pub async fn list_blocked(&self) -> Result<Vec<Issue>> {
        self.db.list_blocked().await
    }

    pub async fn search(&self, query: &str) -> Result<Vec<Issue>> {
        self.db.search(query).await
    }

    // -- host issue upsert -----------------------------------------------

    /// Idempotent upsert keyed by `host_number`; falls back to a title
    /// match against unsynced rows when the webhook races an internally
    /// created issue.
    pub async fn on_host_issue(&self, payload: HostIssuePayload) -> Result<()> {
        let existing = match self.db.find_by_host_number(payload.number).await? {
            Some(issue) => Some(issue),
            None => self.db.find_by_title_unsynced(&payload.title).await?,
        };

        let now = Utc::now();
        let (status, priority) =
            Issue::parse_from_host_labels(payload.state == "closed", &payload.labels);

        let mut issue = existing.unwrap_or_else(|| Issue {
            id: format!("gh-{}", payload.number),
            title: String::new(),
            description: String::new(),
            design: String::new(),
            acceptance_criteria: String::new(),
            notes: String::new(),
            status: "open".into(),
            priority: 2,
            issue_type: "task".into(),
            assignee: None,
            created_at: payload.created_at,
            updated_at: payload.updated_at,
            closed_at: None,
            close_reason: None,
            host_number: None,
            host_id: None,
            last_sync_at: None,
            labels: vec![],
            dependencies: vec![],
        });

        issue.title = payload.title.clone();
        issue.description = payload.body.clone();
        issue.status = status;
        issue.priority = priority;
        issue.assignee = payload.assignee.clone();
        issue.updated_at = payload.updated_at;
        issue.closed_at = payload.closed_at;
        issue.host_number = Some(payload.number);
        issue.host_id = Some(payload.id);
        issue.last_sync_at = Some(now);
        issue.labels = payload.labels.clone();

        self.db.upsert_issue(&issue).await?;
        self.commit_backlog().await?;
        Ok(())
    }

    pub async fn create_host_issue(&self, id: &str) -> Result<()> {
        let mut issue = self
            .db
            .get_issue(id)
            .await?
            .ok_or_else(|| Error::IssueNotFound(id.to_string()))?;

        let labels = issue.host_labels();
        let created = self
            .host
            .create_issue(&self.repo_full_name, &issue.title, &issue.description, &labels)
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        issue.host_number = Some(created.number);
        issue.host_id = Some(created.id);
        issue.last_sync_at = Some(Utc::now());
        self.db.upsert_issue(&issue).await?;
        Ok(())
    }

    pub async fn update_host_issue(&self, id: &str) -> Result<()> {
        let issue = self
            .db
            .get_issue(id)
            .await?
            .ok_or_else(|| Error::IssueNotFound(id.to_string()))?;
        let Some(number) = issue.host_number else {
            return Err(Error::MissingRepoContext);
        };
        let labels = issue.host_labels();
        self.host
            .update_issue(
                &self.repo_full_name,
                number,
                &issue.title,
                &issue.description,
                &labels,
                if issue.status == "closed" { "closed" } else { "open" },
            )
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(())
    }

    pub async fn close_host_issue(&self, number: i64) -> Result<()> {
        let mut issue = self
            .db
            .find_by_host_number(number)
            .await?
            .ok_or_else(|| Error::IssueNotFound(format!("host#{number}")))?;
        issue.status = "closed".into();
        issue.closed_at = Some(Utc::now());
        self.db.upsert_issue(&issue).await?;
        let labels = issue.host_labels();
        self.host
            .update_issue(&self.repo_full_name, number, &issue.title, &issue.description, &labels, "closed")
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(())
    }

    // -- backlog push ----------------------------------------------------

    pub async fn on_backlog_push(
        &self,
        commit: &str,
        files: &[String],
    ) -> Result<Option<ImportResult>> {
        if !files.iter().any(|f| f == BACKLOG_PATH) {
            return Ok(None);
        }
        let Some(content) = self
            .host
            .get_file(&self.repo_full_name, BACKLOG_PATH)
            .await
            .map_err(|e| Error::Http(e.to_string()))?
        else {
            return Ok(None);
        };
        tracing::debug!(commit, "processing backlog push");
        Ok(Some(self.import_from_backlog(&content.content).await?))
    }

    /// One JSON object per line; parses into Issues and reconciles against
    /// the internal store.
    pub async fn import_from_backlog(&self, jsonl: &str) -> Result<ImportResult> {
        let parsed: Vec<Issue> = jsonl
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str::<Issue>)
            .collect::<std::result::Result<_, _>>()?;

        let ready_before: HashSet<String> =
            self.db.list_ready().await?.into_iter().map(|i| i.id).collect();

        let mut remaining: HashMap<String, Issue> = HashMap::new();
        for issue in self.db.list_issues().await? {
            remaining.insert(issue.id.clone(), issue);
        }

        let mut result = ImportResult::default();
        let now = Utc::now();

        for mut issue in parsed {
            let is_update = remaining.remove(&issue.id).is_some();
            issue.last_sync_at = Some(now);
            self.db.upsert_issue(&issue).await?;
            if is_update {
                result.updated.push(issue.id);
            } else {
                result.created.push(issue.id);
            }
        }

        // Remaining ids are deletion candidates, protected if synced
        // within the last 60s.
        for (id, candidate) in remaining {
            let protect = candidate
                .last_sync_at
                .map(|t| now - t < ChronoDuration::seconds(PROTECTION_WINDOW_SECS))
                .unwrap_or(false);
            if protect {
                tracing::info!(issue_id = %id, "skipping deletion: inside protection window");
                continue;
            }
            self.db.delete_issue(&id).await?;
            if let Some(number) = candidate.host_number {
                if let Err(err) = self
                    .host
                    .update_issue(&self.repo_full_name, number, &candidate.title, &candidate.description, &[], "closed")
                    .await
                {
                    tracing::warn!(issue_id = %id, error = %err, "failed to close host issue for deleted backlog entry");
                }
            }
            result.deleted.push(id);
        }

        let ready_after: HashSet<String> =
            self.db.list_ready().await?.into_iter().map(|i| i.id).collect();
        for id in ready_after.difference(&ready_before) {
            let instance_id = format!("develop-{id}");
            if self.workflows.try_start(&instance_id) {
                tracing::info!(instance_id, "started development workflow");
            } else {
                tracing::debug!(instance_id, "workflow already running or paused, skipped");
            }
        }

        Ok(result)
    }

    /// Deterministic JSON-lines export, ordered by `id ASC`.
    pub async fn export_backlog(&self) -> Result<String> {
        let issues = self.db.list_issues().await?;
        let mut lines = Vec::with_capacity(issues.len());
        for issue in issues {
            lines.push(serde_json::to_string(&issue)?);
        }
        Ok(lines.join("\n"))
    }

    async fn commit_backlog(&self) -> Result<()> {
        let content = self.export_backlog().await?;
        self.commit_file(BACKLOG_PATH, &content, "sync: update backlog").await
    }

    /// Conditional PUT with SHA-conflict retry: fetch current SHA, PUT;
    /// on 409 back off `500ms * 2^attempt` and re-fetch.
    pub async fn commit_file(&self, path: &str, content: &str, message: &str) -> Result<()> {
        for attempt in 0..MAX_COMMIT_ATTEMPTS {
            let sha = self
                .host
                .get_file(&self.repo_full_name, path)
                .await
                .map_err(|e| Error::Http(e.to_string()))?
                .map(|f| f.sha);

            match self
                .host
                .put_file(&self.repo_full_name, path, content, message, sha.as_deref())
                .await
                .map_err(|e| Error::Http(e.to_string()))?
            {
                PutFileOutcome::Committed { .. } => return Ok(()),
                PutFileOutcome::Conflict => {
                    tracing::warn!(path, attempt, "sha conflict committing backlog, retrying");
                    tokio::time::sleep(commit_retry_delay(attempt)).await;
                }
            }
        }
        // Final failure: local state remains authoritative, next push
        // reconciles (spec §7).
        tracing::warn!(path, "exhausted commit retries, local state remains authoritative");
        Ok(())
    }
}
