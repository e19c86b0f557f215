//! Persistence kernel, state-machine kernel, and the three stateful
//! controllers (repo, issue, pull request) that sit on top of them.
//! HTTP and host/sandbox transport concerns are deliberately absent from
//! this crate; see the `ports` module for the boundary traits that
//! `devorch-github` and `devorch-sandbox` implement.

pub mod audit_log;
pub mod backoff;
pub mod credentials;
pub mod database;
pub mod error;
pub mod glob_match;
pub mod issue;
pub mod issue_controller;
pub mod ports;
pub mod pr_controller;
pub mod rate_limiter;
pub mod repo_controller;
pub mod session_store;
pub mod state_machine;
pub mod stateful_entity;
pub mod tool_availability;

pub use database::{Database, DatabaseConfig};
pub use error::{Error, Result};
pub use issue::{Dependency, Issue};
pub use issue_controller::IssueController;
pub use pr_controller::PrController;
pub use repo_controller::RepoController;
