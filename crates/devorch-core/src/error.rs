use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("issue not found: {0}")]
    IssueNotFound(String),

    #[error("pull request not found: {0}")]
    PrNotFound(i64),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid state transition: {from} -> {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("agent already assigned")]
    AgentAlreadyAssigned,

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("missing repo context")]
    MissingRepoContext,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
