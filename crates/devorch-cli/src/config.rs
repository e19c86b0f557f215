//! Layered configuration: built-in defaults, an optional TOML file, then
//! environment variables via clap's `env` attribute on each CLI flag.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub db_path: Option<String>,
    pub bind_addr: Option<String>,
    pub github_app_id: Option<String>,
    pub github_private_key_path: Option<String>,
    pub sandbox_base_url: Option<String>,
    pub backlog_path: Option<String>,
    pub protection_window_secs: Option<i64>,
    pub rate_limit_per_minute: Option<u32>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            bind_addr: None,
            github_app_id: None,
            github_private_key_path: None,
            sandbox_base_url: None,
            backlog_path: None,
            protection_window_secs: None,
            rate_limit_per_minute: None,
        }
    }
}

impl FileConfig {
    /// Absent file is not an error; the caller falls through to defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
