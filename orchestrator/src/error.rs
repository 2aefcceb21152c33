use chrono::DateTime;
use chrono::Utc;
use switchyard_protocol::ErrorClass;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorErr>;

#[derive(Error, Debug)]
pub enum OrchestratorErr {
    /// Malformed envelope or task; never dispatched.
    #[error("invalid envelope: {0}")]
    Validation(String),

    #[error("no eligible agent: {0}")]
    AgentUnavailable(String),

    #[error("deadline of {timeout_ms}ms exceeded")]
    Timeout { timeout_ms: u64 },

    #[error("agent `{agent_id}` failed: {message}")]
    Remote {
        agent_id: String,
        message: String,
        retryable: bool,
    },

    #[error("quota exceeded for agent `{agent_id}`")]
    QuotaExceeded {
        agent_id: String,
        reset_at: Option<DateTime<Utc>>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("key `{key}` is locked by another holder")]
    LockConflict { key: String },

    #[error("task `{0}` was cancelled")]
    Cancelled(String),

    #[error("orchestrator is shutting down")]
    Shutdown,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl OrchestratorErr {
    pub fn class(&self) -> ErrorClass {
        match self {
            OrchestratorErr::Validation(_)
            | OrchestratorErr::Config(_)
            | OrchestratorErr::Io(_)
            | OrchestratorErr::Json(_)
            | OrchestratorErr::Toml(_) => ErrorClass::Validation,
            OrchestratorErr::AgentUnavailable(_) => ErrorClass::AgentUnavailable,
            OrchestratorErr::Timeout { .. } => ErrorClass::Timeout,
            OrchestratorErr::Remote { .. } => ErrorClass::RemoteError,
            OrchestratorErr::QuotaExceeded { .. } => ErrorClass::QuotaExceeded,
            OrchestratorErr::Protocol(_) => ErrorClass::Protocol,
            OrchestratorErr::LockConflict { .. } => ErrorClass::LockConflict,
            OrchestratorErr::Cancelled(_) | OrchestratorErr::Shutdown => ErrorClass::Cancelled,
        }
    }

    /// Whether the router should move on to the next agent.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorErr::Remote { retryable, .. } => *retryable,
            other => other.class().is_retryable(),
        }
    }
}
