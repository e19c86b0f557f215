//! Trait boundaries to the out-of-scope external collaborators named in
//! spec §1: the host API, the sandbox RPC, and the agent roster. Concrete
//! implementations live in `devorch-github` and `devorch-sandbox`; tests in
//! this crate use in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostIssuePayload {
    pub number: i64,
    pub id: i64,
    pub title: String,
    pub body: String,
    pub state: String,
    pub labels: Vec<String>,
    pub assignee: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub closed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
    pub sha: String,
}

/// The version-control host (GitHub), reached through a minted
/// installation token. `repo_full_name` is `"owner/repo"`.
#[async_trait]
pub trait HostApi: Send + Sync {
    async fn create_issue(
        &self,
        repo_full_name: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> anyhow::Result<HostIssuePayload>;

    async fn update_issue(
        &self,
        repo_full_name: &str,
        number: i64,
        title: &str,
        body: &str,
        labels: &[String],
        state: &str,
    ) -> anyhow::Result<()>;

    async fn get_file(&self, repo_full_name: &str, path: &str) -> anyhow::Result<Option<FileContent>>;

    /// Conditional PUT; caller handles 409 retry (see `RepoController`).
    async fn put_file(
        &self,
        repo_full_name: &str,
        path: &str,
        content: &str,
        message: &str,
        sha: Option<&str>,
    ) -> anyhow::Result<PutFileOutcome>;

    async fn create_pr(
        &self,
        repo_full_name: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> anyhow::Result<i64>;

    async fn merge_pr(&self, repo_full_name: &str, number: i64, method: &str) -> anyhow::Result<()>;

    async fn files_changed(&self, repo_full_name: &str, number: i64) -> anyhow::Result<Vec<String>>;
}

pub enum PutFileOutcome {
    Committed { sha: String },
    Conflict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxArtifact {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "ref")]
    pub artifact_ref: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEvent {
    Step { index: u32, detail: serde_json::Value },
    Artifact { artifact: SandboxArtifact },
    Completed { artifacts: Vec<SandboxArtifact> },
    Timeout,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxTaskRequest {
    pub session_id: String,
    pub instructions: String,
    pub stream: bool,
    pub timeout_secs: u64,
    pub max_steps: u32,
}

/// The execution sandbox, reached as an RPC: submit a task, receive a
/// stream of events via the returned channel.
#[async_trait]
pub trait SandboxRpc: Send + Sync {
    async fn submit_task(
        &self,
        request: SandboxTaskRequest,
    ) -> anyhow::Result<tokio::sync::mpsc::Receiver<SandboxEvent>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub tier: String,
    pub framework: String,
    pub tool_patterns: Vec<String>,
}

/// Static catalog of agents, consumed by ID.
#[async_trait]
pub trait AgentRoster: Send + Sync {
    async fn resolve(&self, agent_id: &str) -> anyhow::Result<Option<AgentDescriptor>>;
}
