//! Error types for the agent runtime

use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {

    // =============================
    // Tool Errors
    // =============================

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Invalid tool definition: {0}")]
    InvalidToolDefinition(String),

    #[error("Template error: {0}")]
    TemplateError(String),

    // =============================
    // Loop Errors
    // =============================

    #[error("Model service unavailable: {0}")]
    ModelUnavailable(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Max turns exceeded: {0}")]
    MaxTurnsExceeded(u32),

    #[error("Token budget exceeded: used {used} of {budget}")]
    TokenBudgetExceeded { used: u64, budget: u64 },

    #[error("Invalid loop state: {0}")]
    InvalidState(String),

    #[error("Sub-agent error: {0}")]
    SubAgentError(String),

    // =============================
    // Confirmation / Session Errors
    // =============================

    #[error("Confirmation not found: {0}")]
    ConfirmationNotFound(String),

    #[error("Confirmation already resolved: {0}")]
    ConfirmationAlreadyResolved(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    // =============================
    // Infrastructure
    // =============================

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the conversation can continue after this error is surfaced.
    ///
    /// Budget overruns and fatal model errors end the current cycle; the
    /// conversation stays resumable either way, so this only decides how the
    /// client should present the notice.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AgentError::MaxTurnsExceeded(_)
                | AgentError::TokenBudgetExceeded { .. }
                | AgentError::LlmError(_)
                | AgentError::DatabaseError(_)
        )
    }
}
