//! Execution sandbox RPC client.
//!
//! Submits a task over HTTP and streams back newline-delimited JSON
//! events on a channel, matching `stream=true` sessions (spec §4.4):
//! one `SandboxEvent` per line until the connection closes or a
//! `Completed`/`Timeout`/`Error` terminal event arrives.
//!
//! Uses the secrecy crate to protect the sandbox credential in memory.

use async_trait::async_trait;
use devorch_core::ports::{SandboxEvent, SandboxRpc, SandboxTaskRequest};
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct SandboxClient {
    credential: SecretString,
    base_url: String,
    client: reqwest::Client,
}

impl SandboxClient {
    pub fn new(credential: impl Into<String>) -> Self {
        Self::with_config(credential, SandboxClientConfig::default())
    }

    pub fn with_config(credential: impl Into<String>, config: SandboxClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .expect("failed to build sandbox HTTP client");

        Self {
            credential: SecretString::new(credential.into()),
            base_url: config.base_url,
            client,
        }
    }
}

#[async_trait]
impl SandboxRpc for SandboxClient {
    async fn submit_task(
        &self,
        request: SandboxTaskRequest,
    ) -> anyhow::Result<mpsc::Receiver<SandboxEvent>> {
        let url = format!("{}/sessions/{}/tasks", self.base_url, request.session_id);
        let response = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {}", self.credential.expose_secret()))
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("sandbox task submission failed ({status}): {body}");
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(err) => {
                        tracing::warn!(error = %err, "sandbox stream read error");
                        let _ = tx.send(SandboxEvent::Error { message: err.to_string() }).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<SandboxEvent>(&line) {
                        Ok(event) => {
                            let terminal = matches!(
                                event,
                                SandboxEvent::Completed { .. } | SandboxEvent::Timeout | SandboxEvent::Error { .. }
                            );
                            if tx.send(event).await.is_err() {
                                return;
                            }
                            if terminal {
                                return;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, line, "malformed sandbox event, skipping");
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

pub struct SandboxClientConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SandboxClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8787".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            connect_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_sane() {
        let config = SandboxClientConfig::default();
        assert_eq!(config.timeout_secs, 120);
        assert!(config.base_url.starts_with("http"));
    }

    #[test]
    fn credential_is_not_exposed_in_debug_output() {
        let client = SandboxClient::new("super-secret-token");
        // SandboxClient intentionally has no Debug impl; this test documents
        // the invariant rather than exercising one.
        let _ = client;
    }
}
