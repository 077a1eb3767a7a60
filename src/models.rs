//! Core data models for the agent runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

//
// ================= Turns =================
//

/// One entry of a conversation, in the order it happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    User { text: String },
    Assistant { text: String },
    ToolInvocation(ToolInvocation),
    ToolResult(ToolResult),
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Turn::User { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Turn::Assistant { text: text.into() }
    }

    /// Approximate token count (4 chars per token)
    pub fn token_estimate(&self) -> usize {
        let len = match self {
            Turn::User { text } | Turn::Assistant { text } => text.len(),
            Turn::ToolInvocation(inv) => inv.tool_name.len() + inv.arguments.to_string().len(),
            Turn::ToolResult(result) => result.outcome.to_content().len(),
        };
        (len + 3) / 4
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

impl ToolInvocation {
    pub fn new(tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: format!("call_{}", Uuid::new_v4().simple()),
            tool_name: tool_name.into(),
            arguments,
        }
    }

    pub fn with_id(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub invocation_id: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn success(invocation_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: ToolOutcome::Success(payload),
        }
    }

    pub fn error(invocation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: ToolOutcome::Error(message.into()),
        }
    }

    pub fn cancelled(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: ToolOutcome::Cancelled,
        }
    }
}

/// What the model gets back for one invocation.
///
/// `Cancelled` is a user decision, not a failure of the executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success(serde_json::Value),
    Error(String),
    Cancelled,
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        !matches!(self, ToolOutcome::Success(_))
    }

    /// Text form handed to the model service
    pub fn to_content(&self) -> String {
        match self {
            ToolOutcome::Success(value) => match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ToolOutcome::Error(message) => format!("Error: {}", message),
            ToolOutcome::Cancelled => "Cancelled by user".to_string(),
        }
    }
}

//
// ================= Conversation State =================
//

/// Append-only turn log owned by a single agent loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self { turns: Vec::new() }
    }

    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn token_estimate(&self) -> usize {
        self.turns.iter().map(Turn::token_estimate).sum()
    }

    /// Text of the most recent assistant turn, if any
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.turns.iter().rev().find_map(|turn| match turn {
            Turn::Assistant { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Append error results for invocations that never got one.
    ///
    /// Happens when a conversation was persisted while a confirmation was
    /// pending and later resumed. Returns the number of results appended.
    pub fn close_dangling_invocations(&mut self) -> usize {
        let answered: HashSet<&str> = self
            .turns
            .iter()
            .filter_map(|turn| match turn {
                Turn::ToolResult(result) => Some(result.invocation_id.as_str()),
                _ => None,
            })
            .collect();

        let dangling: Vec<String> = self
            .turns
            .iter()
            .filter_map(|turn| match turn {
                Turn::ToolInvocation(inv) if !answered.contains(inv.id.as_str()) => {
                    Some(inv.id.clone())
                }
                _ => None,
            })
            .collect();

        let count = dangling.len();
        for id in dangling {
            self.turns.push(Turn::ToolResult(ToolResult::error(
                id,
                "interrupted before completion",
            )));
        }
        count
    }
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    pub invocation_id: String,
    /// User the conversation belongs to
    #[serde(default)]
    pub user_id: String,
    pub parameters: serde_json::Value,
}

/// Body sent to a tool backend for one invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteRequest {
    pub user_id: String,
    pub tool: String,
    pub input: serde_json::Value,
    pub request_id: String,
}

impl From<&ToolInput> for ExecuteRequest {
    fn from(input: &ToolInput) -> Self {
        Self {
            user_id: input.user_id.clone(),
            tool: input.tool_name.clone(),
            input: input.parameters.clone(),
            request_id: input.invocation_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: serde_json::Value,
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn into_outcome(self) -> ToolOutcome {
        if self.success {
            ToolOutcome::Success(self.data)
        } else {
            ToolOutcome::Error(
                self.error
                    .unwrap_or_else(|| "tool reported failure".to_string()),
            )
        }
    }
}

//
// ================= Confirmation =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingConfirmation {
    pub action_id: String,
    pub invocation_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

//
// ================= Usage =================
//

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

//
// ================= Conversations =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMeta {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredConversation {
    pub meta: ConversationMeta,
    pub turns: Vec<Turn>,
}

/// Title shown in conversation lists: first user message, shortened.
pub fn derive_title(turns: &[Turn]) -> String {
    turns
        .iter()
        .find_map(|turn| match turn {
            Turn::User { text } => Some(truncate(text, 50)),
            _ => None,
        })
        .unwrap_or_default()
}

/// Truncate on a char boundary, appending "..." when shortened.
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

impl fmt::Display for ToolOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolOutcome::Success(_) => "success",
            ToolOutcome::Error(_) => "error",
            ToolOutcome::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}
