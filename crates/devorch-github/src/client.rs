//! Thin reqwest-based GitHub REST client implementing `devorch_core::ports::HostApi`.

use crate::auth::InstallationAuth;
use async_trait::async_trait;
use base64::Engine;
use devorch_core::ports::{FileContent, HostApi, HostIssuePayload, PutFileOutcome};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub struct GitHubClient {
    http: reqwest::Client,
    auth: Arc<InstallationAuth>,
    api_base: String,
}

impl GitHubClient {
    pub fn new(auth: Arc<InstallationAuth>) -> Self {
        Self::with_api_base(auth, "https://api.github.com".to_string())
    }

    pub fn with_api_base(auth: Arc<InstallationAuth>, api_base: String) -> Self {
        Self { http: reqwest::Client::new(), auth, api_base }
    }

    async fn bearer(&self) -> anyhow::Result<String> {
        Ok(self.auth.token(&self.http).await?)
    }
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: i64,
    id: i64,
    title: String,
    body: Option<String>,
    state: String,
    assignee: Option<GhUser>,
    labels: Vec<GhLabel>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    closed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhContent {
    content: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhPr {
    number: i64,
}

#[derive(Debug, Deserialize)]
struct GhPrFile {
    filename: String,
}

impl From<GhIssue> for HostIssuePayload {
    fn from(g: GhIssue) -> Self {
        HostIssuePayload {
            number: g.number,
            id: g.id,
            title: g.title,
            body: g.body.unwrap_or_default(),
            state: g.state,
            labels: g.labels.into_iter().map(|l| l.name).collect(),
            assignee: g.assignee.map(|a| a.login),
            created_at: g.created_at,
            updated_at: g.updated_at,
            closed_at: g.closed_at,
        }
    }
}

#[async_trait]
impl HostApi for GitHubClient {
    async fn create_issue(
        &self,
        repo_full_name: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> anyhow::Result<HostIssuePayload> {
        let token = self.bearer().await?;
        let url = format!("{}/repos/{repo_full_name}/issues", self.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header("User-Agent", "devorch")
            .json(&json!({ "title": title, "body": body, "labels": labels }))
            .send()
            .await?
            .error_for_status()?;
        let issue: GhIssue = response.json().await?;
        Ok(issue.into())
    }

    async fn update_issue(
        &self,
        repo_full_name: &str,
        number: i64,
        title: &str,
        body: &str,
        labels: &[String],
        state: &str,
    ) -> anyhow::Result<()> {
        let token = self.bearer().await?;
        let url = format!("{}/repos/{repo_full_name}/issues/{number}", self.api_base);
        self.http
            .patch(&url)
            .bearer_auth(token)
            .header("User-Agent", "devorch")
            .json(&json!({ "title": title, "body": body, "labels": labels, "state": state }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_file(&self, repo_full_name: &str, path: &str) -> anyhow::Result<Option<FileContent>> {
        let token = self.bearer().await?;
        let url = format!("{}/repos/{repo_full_name}/contents/{path}", self.api_base);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header("User-Agent", "devorch")
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let content: GhContent = response.error_for_status()?.json().await?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(content.content.replace('\n', ""))
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            .unwrap_or_default();
        Ok(Some(FileContent { content: decoded, sha: content.sha }))
    }

    async fn put_file(
        &self,
        repo_full_name: &str,
        path: &str,
        content: &str,
        message: &str,
        sha: Option<&str>,
    ) -> anyhow::Result<PutFileOutcome> {
        let token = self.bearer().await?;
        let url = format!("{}/repos/{repo_full_name}/contents/{path}", self.api_base);
        let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
        let mut body = json!({ "message": message, "content": encoded });
        if let Some(sha) = sha {
            body["sha"] = json!(sha);
        }
        let response = self
            .http
            .put(&url)
            .bearer_auth(token)
            .header("User-Agent", "devorch")
            .json(&body)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(PutFileOutcome::Conflict);
        }
        let parsed: serde_json::Value = response.error_for_status()?.json().await?;
        let sha = parsed["content"]["sha"].as_str().unwrap_or_default().to_string();
        Ok(PutFileOutcome::Committed { sha })
    }

    async fn create_pr(
        &self,
        repo_full_name: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> anyhow::Result<i64> {
        let token = self.bearer().await?;
        let url = format!("{}/repos/{repo_full_name}/pulls", self.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header("User-Agent", "devorch")
            .json(&json!({ "title": title, "body": body, "head": head, "base": base }))
            .send()
            .await?
            .error_for_status()?;
        let pr: GhPr = response.json().await?;
        Ok(pr.number)
    }

    async fn merge_pr(&self, repo_full_name: &str, number: i64, method: &str) -> anyhow::Result<()> {
        let token = self.bearer().await?;
        let url = format!("{}/repos/{repo_full_name}/pulls/{number}/merge", self.api_base);
        self.http
            .put(&url)
            .bearer_auth(token)
            .header("User-Agent", "devorch")
            .json(&json!({ "merge_method": method }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn files_changed(&self, repo_full_name: &str, number: i64) -> anyhow::Result<Vec<String>> {
        let token = self.bearer().await?;
        let url = format!("{}/repos/{repo_full_name}/pulls/{number}/files", self.api_base);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header("User-Agent", "devorch")
            .send()
            .await?
            .error_for_status()?;
        let files: Vec<GhPrFile> = response.json().await?;
        Ok(files.into_iter().map(|f| f.filename).collect())
    }
}
