//! Crate-wide error taxonomy.
//!
//! Producer-facing variants map 1:1 onto HTTP statuses at the server
//! boundary; everything else is recorded and downgraded to a safe default
//! inside the pipeline rather than surfaced as a 5xx.

use thiserror::Error;

pub type PceResult<T> = Result<T, PceError>;

#[derive(Debug, Error)]
pub enum PceError {
    /// Envelope is malformed or names an unregistered event type.
    #[error("invalid_schema: {0}")]
    InvalidSchema(String),

    /// Domain payload violates its registered schema.
    #[error("invalid_payload: {0}")]
    InvalidPayload(String),

    /// A domain plugin failed; the pipeline downgrades to the core default.
    #[error("plugin_error: {0}")]
    Plugin(String),

    /// LLM provider failure (auth, timeout, rate limit). Message is already
    /// sanitized: no secrets, bounded length.
    #[error("llm_provider_error: {0}")]
    Llm(String),

    #[error("insufficient_budget_for_purchase (required={required:.2}, available={available:.2})")]
    InsufficientBudget { required: f64, available: f64 },

    #[error("approval_not_found: {0}")]
    ApprovalNotFound(String),

    #[error("approval_already_terminal: {0}")]
    ApprovalAlreadyTerminal(String),

    /// Compare-and-swap on the state snapshot lost; the writer retries once
    /// before this reaches a caller.
    #[error("state_conflict")]
    StateConflict,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for PceError {
    fn from(err: rusqlite::Error) -> Self {
        PceError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PceError {
    fn from(err: serde_json::Error) -> Self {
        PceError::Storage(format!("json: {}", err))
    }
}

impl PceError {
    /// Stable machine tag used in transcripts and HTTP error bodies.
    pub fn tag(&self) -> &'static str {
        match self {
            PceError::InvalidSchema(_) => "invalid_schema",
            PceError::InvalidPayload(_) => "invalid_payload",
            PceError::Plugin(_) => "plugin_error",
            PceError::Llm(_) => "llm_provider_error",
            PceError::InsufficientBudget { .. } => "insufficient_budget_for_purchase",
            PceError::ApprovalNotFound(_) => "approval_not_found",
            PceError::ApprovalAlreadyTerminal(_) => "approval_already_terminal",
            PceError::StateConflict => "state_conflict",
            PceError::Storage(_) => "storage_error",
            PceError::Config(_) => "config_error",
        }
    }
}
