//! GitHub App integration: installation token minting, issue/PR/label
//! operations, and conditional file commits against the REST and GraphQL
//! APIs.

pub mod auth;
pub mod client;

pub use auth::{AppCredentials, InstallationAuth};
pub use client::GitHubClient;
