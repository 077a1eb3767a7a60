//! Confirmation gate
//!
//! Holds confirmation-gated invocations until the user approves or rejects
//! them. Action ids are single-use; state lives and dies with one loop.

use crate::error::AgentError;
use crate::models::{PendingConfirmation, ToolInvocation};
use crate::tools::template;
use crate::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub pending: PendingConfirmation,
    pub approved: bool,
}

#[derive(Debug, Default)]
pub struct ConfirmationGate {
    pending: HashMap<String, PendingConfirmation>,
    resolved: HashSet<String>,
}

/// Summary shown to the user.
///
/// A template that cannot be rendered still produces a summary, with the
/// formatting problem spelled out instead of leaving blanks.
pub fn render_summary(invocation: &ToolInvocation, summary_template: Option<&str>) -> String {
    match summary_template {
        Some(tmpl) => match template::render(tmpl, &invocation.arguments) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(tool = %invocation.tool_name, error = %e, "Summary template failed to render");
                format!(
                    "{} {} (summary unavailable: {})",
                    invocation.tool_name, invocation.arguments, e
                )
            }
        },
        None => format!("{} {}", invocation.tool_name, invocation.arguments),
    }
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a confirmation for an invocation and return it
    pub fn open(
        &mut self,
        invocation: &ToolInvocation,
        summary_template: Option<&str>,
    ) -> PendingConfirmation {
        let pending = PendingConfirmation {
            action_id: Uuid::new_v4().to_string(),
            invocation_id: invocation.id.clone(),
            tool_name: invocation.tool_name.clone(),
            arguments: invocation.arguments.clone(),
            summary: render_summary(invocation, summary_template),
            created_at: Utc::now(),
        };

        debug!(
            action_id = %pending.action_id,
            tool = %pending.tool_name,
            "Confirmation opened"
        );

        self.pending
            .insert(pending.action_id.clone(), pending.clone());
        pending
    }

    /// Resolve an action exactly once
    pub fn resolve(&mut self, action_id: &str, approved: bool) -> Result<Resolution> {
        if self.resolved.contains(action_id) {
            return Err(AgentError::ConfirmationAlreadyResolved(action_id.to_string()));
        }

        let pending = self
            .pending
            .remove(action_id)
            .ok_or_else(|| AgentError::ConfirmationNotFound(action_id.to_string()))?;

        self.resolved.insert(action_id.to_string());

        debug!(action_id, approved, "Confirmation resolved");
        Ok(Resolution { pending, approved })
    }

    /// The pending confirmation, if any
    pub fn current(&self) -> Option<&PendingConfirmation> {
        self.pending.values().next()
    }

    /// Drop every pending confirmation without resolving it
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn send_money() -> ToolInvocation {
        ToolInvocation::with_id(
            "call_1",
            "send_money",
            json!({"amount": "50.00", "token": "usdc", "recipient": "alice"}),
        )
    }

    #[test]
    fn test_open_renders_summary() {
        let mut gate = ConfirmationGate::new();
        let pending = gate.open(&send_money(), Some("Send {amount} {token} to @{recipient}"));

        assert_eq!(pending.summary, "Send 50.00 usdc to @alice");
        assert_eq!(pending.invocation_id, "call_1");
        assert_eq!(gate.current(), Some(&pending));
    }

    #[test]
    fn test_resolve_is_single_use() {
        let mut gate = ConfirmationGate::new();
        let pending = gate.open(&send_money(), None);

        let resolution = gate.resolve(&pending.action_id, true).unwrap();
        assert!(resolution.approved);
        assert!(gate.current().is_none());

        assert!(matches!(
            gate.resolve(&pending.action_id, false),
            Err(AgentError::ConfirmationAlreadyResolved(_))
        ));
        assert!(matches!(
            gate.resolve("nope", true),
            Err(AgentError::ConfirmationNotFound(_))
        ));
    }

    #[test]
    fn test_missing_placeholder_is_visible() {
        let mut gate = ConfirmationGate::new();
        let invocation =
            ToolInvocation::with_id("c", "send_money", json!({"amount": "5", "recipient": "bob"}));
        let pending = gate.open(&invocation, Some("Send {amount} {token} to @{recipient}"));

        assert!(pending.summary.contains("summary unavailable"));
        assert!(pending.summary.contains("token"));
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut gate = ConfirmationGate::new();
        let pending = gate.open(&send_money(), None);
        assert_eq!(gate.clear(), 1);
        assert!(matches!(
            gate.resolve(&pending.action_id, true),
            Err(AgentError::ConfirmationNotFound(_))
        ));
    }
}
