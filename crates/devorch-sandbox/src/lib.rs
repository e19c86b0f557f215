//! Sandbox execution RPC client: dispatches prepared tasks to an execution
//! sandbox and streams back step events.

pub mod client;

pub use client::{SandboxClient, SandboxClientConfig};
