//! Agent execution loop
//!
//! USER MESSAGE → MODEL → DISPATCH TOOLS → (CONFIRM?) → MODEL → ... → TEXT
//!
//! [`Engine`] holds what every conversation shares (model, registry,
//! limits). [`AgentLoop`] is the per-conversation state machine; its methods
//! take `&mut self`, so one conversation never has two transitions in flight.

use crate::config::DEFAULT_USER_ID;
use crate::error::AgentError;
use crate::llm::{ModelError, ModelRequest, ModelResponse, ModelService, StreamSink};
use crate::models::{
    ConversationState, PendingConfirmation, TokenUsage, ToolInput, ToolInvocation, ToolOutcome,
    ToolResult, Turn,
};
use crate::tools::{Tool, ToolDescriptor, ToolRegistry};
use crate::Result;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub mod confirmation;

pub use confirmation::{ConfirmationGate, Resolution};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a careful financial assistant. \
Use the available tools to look up balances, transactions and market data before answering. \
Never guess amounts or recipients; ask the user when something is ambiguous. \
Actions that move money are confirmed by the user before they run.";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub system_prompt: String,
    /// Model calls allowed per user message
    pub max_turns: u32,
    /// Output token limit per model response
    pub max_tokens: u32,
    /// Optional cap on tokens consumed per user message
    pub token_budget: Option<u64>,
    pub model_timeout: Duration,
    pub retry: RetryPolicy,
    /// Gated tools that run without asking (sub-agent whitelists)
    pub pre_approved: HashSet<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_turns: 10,
            max_tokens: 4096,
            token_budget: None,
            model_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            pre_approved: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Idle,
    AwaitingModel,
    Dispatching,
    AwaitingConfirmation,
    Failed,
}

/// How a loop run ended
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutput {
    /// The model answered with text only
    Complete { text: String, usage: TokenUsage },
    /// A gated invocation is waiting on the user
    ConfirmationNeeded {
        pending: PendingConfirmation,
        /// Assistant text produced since the last boundary
        text: String,
    },
}

/// Shared, immutable runtime for agent loops
pub struct Engine {
    model: Arc<dyn ModelService>,
    registry: Arc<ToolRegistry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        model: Arc<dyn ModelService>,
        registry: Arc<ToolRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            model,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn model(&self) -> &Arc<dyn ModelService> {
        &self.model
    }

    /// Fresh loop with an empty conversation
    pub fn start(self: &Arc<Self>) -> AgentLoop {
        AgentLoop::new(Arc::clone(self), ConversationState::new())
    }

    /// Loop over a previously persisted conversation
    pub fn resume(self: &Arc<Self>, mut state: ConversationState) -> AgentLoop {
        let closed = state.close_dangling_invocations();
        if closed > 0 {
            debug!(closed, "Closed dangling invocations on resume");
        }
        AgentLoop::new(Arc::clone(self), state)
    }

    /// One model round-trip with timeout and bounded retry.
    ///
    /// An attempt that already streamed text is not retried, so streamed
    /// fragments always concatenate to the text the loop reports.
    async fn call_model(
        &self,
        state: &ConversationState,
        sink: &StreamSink,
    ) -> Result<ModelResponse> {
        let request = ModelRequest {
            system_prompt: self.config.system_prompt.clone(),
            turns: state.turns().to_vec(),
            tools: self.registry.descriptors(),
            max_tokens: self.config.max_tokens,
        };

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let emitted_before = sink.emitted();

            let result = match tokio::time::timeout(
                self.config.model_timeout,
                self.model.respond(&request, sink),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ModelError::Transient(format!(
                    "model call timed out after {:?}",
                    self.config.model_timeout
                ))),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(ModelError::Fatal(message)) => return Err(AgentError::LlmError(message)),
                Err(ModelError::Transient(message)) => {
                    if sink.emitted() != emitted_before {
                        return Err(AgentError::ModelUnavailable(format!(
                            "{} (after partial output)",
                            message
                        )));
                    }
                    if attempt >= max_attempts {
                        return Err(AgentError::ModelUnavailable(format!(
                            "{} (gave up after {} attempts)",
                            message, attempt
                        )));
                    }

                    let delay = self.config.retry.backoff(attempt);
                    warn!(attempt, ?delay, error = %message, "Model call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Run one tool on its own task on behalf of `user_id`.
///
/// Once dispatched, the call finishes even if the caller goes away; a panic
/// in the executor becomes an error result.
pub async fn execute_tool(
    tool: Arc<dyn Tool>,
    invocation: &ToolInvocation,
    user_id: &str,
) -> ToolOutcome {
    let input = ToolInput {
        tool_name: invocation.tool_name.clone(),
        invocation_id: invocation.id.clone(),
        user_id: user_id.to_string(),
        parameters: invocation.arguments.clone(),
    };

    let start = Instant::now();
    let handle = tokio::spawn(async move { tool.execute(&input).await });

    let outcome = match handle.await {
        Ok(Ok(output)) => output.into_outcome(),
        Ok(Err(e)) => ToolOutcome::Error(e.to_string()),
        Err(e) => ToolOutcome::Error(format!("tool execution aborted: {}", e)),
    };

    let elapsed_ms = start.elapsed().as_millis() as u64;
    if outcome.is_error() {
        warn!(
            tool = %invocation.tool_name,
            invocation_id = %invocation.id,
            elapsed_ms,
            "Tool execution failed"
        );
    } else {
        debug!(
            tool = %invocation.tool_name,
            invocation_id = %invocation.id,
            elapsed_ms,
            "Tool executed"
        );
    }

    outcome
}

struct SuspendedBatch {
    gated: ToolInvocation,
    remaining: VecDeque<ToolInvocation>,
}

enum Prepared {
    Immediate(ToolOutcome),
    Run(Arc<dyn Tool>),
    Gated(ToolDescriptor),
}

enum Slot {
    Ready(String, ToolOutcome),
    Run(ToolInvocation, Arc<dyn Tool>),
}

enum Dispatch {
    Done,
    Suspended(PendingConfirmation),
}

/// Per-conversation state machine
pub struct AgentLoop {
    engine: Arc<Engine>,
    user_id: String,
    state: ConversationState,
    status: LoopStatus,
    gate: ConfirmationGate,
    suspended: Option<SuspendedBatch>,
    seen_invocations: HashSet<String>,
    cycle_turns: u32,
    cycle_usage: TokenUsage,
    cycle_text: String,
}

impl AgentLoop {
    pub fn new(engine: Arc<Engine>, state: ConversationState) -> Self {
        let seen_invocations = state
            .turns()
            .iter()
            .filter_map(|turn| match turn {
                Turn::ToolInvocation(inv) => Some(inv.id.clone()),
                _ => None,
            })
            .collect();

        Self {
            engine,
            user_id: DEFAULT_USER_ID.to_string(),
            state,
            status: LoopStatus::Idle,
            gate: ConfirmationGate::new(),
            suspended: None,
            seen_invocations,
            cycle_turns: 0,
            cycle_usage: TokenUsage::default(),
            cycle_text: String::new(),
        }
    }

    /// Run tools on behalf of `user_id`
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn status(&self) -> LoopStatus {
        self.status
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn into_state(self) -> ConversationState {
        self.state
    }

    pub fn pending(&self) -> Option<&PendingConfirmation> {
        self.gate.current()
    }

    /// Tokens spent by the current (or last) cycle, failed ones included
    pub fn usage(&self) -> TokenUsage {
        self.cycle_usage
    }

    /// Start a new cycle with a user message
    pub async fn send_message(&mut self, text: &str, sink: &StreamSink) -> Result<LoopOutput> {
        match self.status {
            LoopStatus::Idle | LoopStatus::Failed => {}
            other => {
                return Err(AgentError::InvalidState(format!(
                    "cannot accept a message while {:?}",
                    other
                )))
            }
        }

        if text.trim().is_empty() {
            return Err(AgentError::ProtocolError("message is empty".to_string()));
        }

        let closed = self.state.close_dangling_invocations();
        if closed > 0 {
            debug!(closed, "Closed invocations left open by a dropped confirmation");
        }

        self.state.push(Turn::user(text));
        self.cycle_turns = 0;
        self.cycle_usage = TokenUsage::default();
        self.cycle_text.clear();

        self.run(sink).await
    }

    /// Approve or reject the pending confirmation and continue the cycle
    pub async fn resolve(
        &mut self,
        action_id: &str,
        approved: bool,
        sink: &StreamSink,
    ) -> Result<LoopOutput> {
        let resolution = self.gate.resolve(action_id, approved)?;
        let batch = self.suspended.take().ok_or_else(|| {
            AgentError::InvalidState("confirmation resolved with no suspended batch".to_string())
        })?;

        info!(
            action_id,
            tool = %resolution.pending.tool_name,
            approved,
            "Confirmation resolved"
        );

        self.status = LoopStatus::Dispatching;

        let outcome = if approved {
            match self.engine.registry.lookup(&batch.gated.tool_name) {
                Some(tool) => execute_tool(tool, &batch.gated, &self.user_id).await,
                None => ToolOutcome::Error(
                    AgentError::ToolNotFound(batch.gated.tool_name.clone()).to_string(),
                ),
            }
        } else {
            ToolOutcome::Cancelled
        };

        self.state.push(Turn::ToolResult(ToolResult {
            invocation_id: batch.gated.id.clone(),
            outcome,
        }));

        if let Dispatch::Suspended(pending) = self.dispatch(batch.remaining).await {
            return Ok(LoopOutput::ConfirmationNeeded {
                pending,
                text: std::mem::take(&mut self.cycle_text),
            });
        }

        self.run(sink).await
    }

    /// Drop the pending confirmation without recording a result.
    ///
    /// Only for tearing a session down; invocations left open are closed
    /// with error results if the loop is used again.
    pub(crate) fn cancel_pending(&mut self) -> Option<PendingConfirmation> {
        let pending = self.gate.current().cloned();
        self.gate.clear();
        self.suspended = None;
        if self.status == LoopStatus::AwaitingConfirmation {
            self.status = LoopStatus::Idle;
        }
        if let Some(p) = &pending {
            debug!(action_id = %p.action_id, "Pending confirmation discarded");
        }
        pending
    }

    async fn run(&mut self, sink: &StreamSink) -> Result<LoopOutput> {
        let result = self.run_cycle(sink).await;
        if let Err(e) = &result {
            warn!(error = %e, turns = self.cycle_turns, "Agent loop failed");
            self.status = LoopStatus::Failed;
        }
        result
    }

    async fn run_cycle(&mut self, sink: &StreamSink) -> Result<LoopOutput> {
        loop {
            self.check_budgets()?;

            self.status = LoopStatus::AwaitingModel;
            let response = self.engine.call_model(&self.state, sink).await?;

            self.cycle_turns += 1;
            self.cycle_usage.add(response.usage);
            self.cycle_text.push_str(&response.text);

            if !response.text.is_empty() {
                self.state.push(Turn::assistant(response.text.clone()));
            }

            if response.invocations.is_empty() {
                self.status = LoopStatus::Idle;
                debug!(turns = self.cycle_turns, "Cycle complete");
                return Ok(LoopOutput::Complete {
                    text: std::mem::take(&mut self.cycle_text),
                    usage: self.cycle_usage,
                });
            }

            debug!(
                invocations = response.invocations.len(),
                turn = self.cycle_turns,
                "Dispatching tool batch"
            );

            for invocation in &response.invocations {
                self.state.push(Turn::ToolInvocation(invocation.clone()));
            }

            self.status = LoopStatus::Dispatching;
            if let Dispatch::Suspended(pending) = self.dispatch(response.invocations.into()).await {
                return Ok(LoopOutput::ConfirmationNeeded {
                    pending,
                    text: std::mem::take(&mut self.cycle_text),
                });
            }
        }
    }

    fn check_budgets(&self) -> Result<()> {
        let config = &self.engine.config;

        if self.cycle_turns >= config.max_turns {
            return Err(AgentError::MaxTurnsExceeded(config.max_turns));
        }

        if let Some(budget) = config.token_budget {
            let used = self.cycle_usage.total();
            if used > budget {
                return Err(AgentError::TokenBudgetExceeded { used, budget });
            }
        }

        Ok(())
    }

    fn prepare(&mut self, invocation: &ToolInvocation) -> Prepared {
        if !self.seen_invocations.insert(invocation.id.clone()) {
            return Prepared::Immediate(ToolOutcome::Error(format!(
                "duplicate invocation id: {}",
                invocation.id
            )));
        }

        let Some(tool) = self.engine.registry.lookup(&invocation.tool_name) else {
            warn!(tool = %invocation.tool_name, "Tool not registered");
            return Prepared::Immediate(ToolOutcome::Error(
                AgentError::ToolNotFound(invocation.tool_name.clone()).to_string(),
            ));
        };

        let descriptor = tool.descriptor();
        if let Err(e) = descriptor.validate_arguments(&invocation.arguments) {
            return Prepared::Immediate(ToolOutcome::Error(e.to_string()));
        }

        if descriptor.requires_confirmation {
            if !self.engine.config.pre_approved.contains(&descriptor.name) {
                return Prepared::Gated(descriptor.clone());
            }
            warn!(
                tool = %descriptor.name,
                invocation_id = %invocation.id,
                "Running gated tool without confirmation (pre-approved)"
            );
        }

        Prepared::Run(tool)
    }

    /// Resolve invocations in order until done or a gated one is reached
    async fn dispatch(&mut self, mut queue: VecDeque<ToolInvocation>) -> Dispatch {
        let mut segment = Vec::new();
        let mut gated = None;

        while let Some(invocation) = queue.pop_front() {
            match self.prepare(&invocation) {
                Prepared::Immediate(outcome) => segment.push(Slot::Ready(invocation.id, outcome)),
                Prepared::Run(tool) => segment.push(Slot::Run(invocation, tool)),
                Prepared::Gated(descriptor) => {
                    gated = Some((invocation, descriptor));
                    break;
                }
            }
        }

        self.flush(segment).await;

        match gated {
            None => Dispatch::Done,
            Some((invocation, descriptor)) => {
                let pending = self
                    .gate
                    .open(&invocation, descriptor.summary_template.as_deref());

                info!(
                    action_id = %pending.action_id,
                    tool = %pending.tool_name,
                    waiting = queue.len(),
                    "Awaiting user confirmation"
                );

                self.suspended = Some(SuspendedBatch {
                    gated: invocation,
                    remaining: queue,
                });
                self.status = LoopStatus::AwaitingConfirmation;
                Dispatch::Suspended(pending)
            }
        }
    }

    /// Run a segment concurrently and append results in invocation order
    async fn flush(&mut self, segment: Vec<Slot>) {
        if segment.is_empty() {
            return;
        }

        let user_id = self.user_id.as_str();
        let results = join_all(segment.into_iter().map(|slot| async move {
            match slot {
                Slot::Ready(id, outcome) => (id, outcome),
                Slot::Run(invocation, tool) => {
                    let outcome = execute_tool(tool, &invocation, user_id).await;
                    (invocation.id, outcome)
                }
            }
        }))
        .await;

        for (invocation_id, outcome) in results {
            self.state.push(Turn::ToolResult(ToolResult {
                invocation_id,
                outcome,
            }));
        }
    }
}
