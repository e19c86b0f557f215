pub mod issue_api;
pub mod pr_api;
pub mod state;
pub mod webhook;

pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook/github", post(webhook::github_webhook))
        .route("/webhook/beads", post(webhook::beads_webhook))
        .route("/issues/:id/assign-agent", post(issue_api::assign_agent))
        .route("/issues/:id/state", get(issue_api::get_state))
        .route("/issues/:id/cancel", post(issue_api::cancel))
        .route("/issues/:id/logs", get(issue_api::logs))
        .route("/issues/:id/transitions", get(issue_api::transitions))
        .route("/issues/:id/events/:session_id", get(issue_api::events_for_session))
        .route("/issues/:id/ws", get(issue_api::ws_upgrade))
        .route("/prs/:n/event", post(pr_api::post_event))
        .route("/prs/:n/status", get(pr_api::get_status))
        .route("/prs/:n/session", post(pr_api::post_session))
        .route("/prs/:n/approve", post(pr_api::approve))
        .route("/prs/:n/rollback", post(pr_api::rollback))
        .route("/prs/:n/rollback-info", get(pr_api::rollback_info))
        .with_state(state)
}
