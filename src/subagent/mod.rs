//! Sub-agents and delegation
//!
//! A sub-agent is a nested [`AgentLoop`](crate::agent::AgentLoop) with its own prompt, a restricted
//! tool view and tighter limits. The parent reaches it through a
//! [`DelegationTool`], so delegation is just another tool call.

use crate::agent::{Engine, EngineConfig, LoopOutput, RetryPolicy};
use crate::error::AgentError;
use crate::llm::{ModelService, StreamSink};
use crate::models::{truncate, ConversationState, TokenUsage, ToolInput, ToolOutput, Turn};
use crate::tools::schema::{object_schema, string_property};
use crate::tools::{Tool, ToolDescriptor, ToolRegistry};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod presets;

/// Upper bound on the text returned when a sub-agent runs out of turns
pub const INCOMPLETE_RESULT_MAX_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAgentConfig {
    pub name: String,
    pub system_prompt: String,
    pub allowed_tools: BTreeSet<String>,
    /// Gated tools this sub-agent may run without asking the user
    pub confirmation_whitelist: BTreeSet<String>,
    pub max_turns: u32,
    pub max_tokens: u32,
}

impl SubAgentConfig {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            allowed_tools: BTreeSet::new(),
            confirmation_whitelist: BTreeSet::new(),
            max_turns: 5,
            max_tokens: 1024,
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_confirmation_whitelist<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.confirmation_whitelist = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limits(mut self, max_turns: u32, max_tokens: u32) -> Self {
        self.max_turns = max_turns;
        self.max_tokens = max_tokens;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AgentError::ConfigError("sub-agent name is empty".into()));
        }
        if self.max_turns == 0 {
            return Err(AgentError::ConfigError(format!(
                "sub-agent {}: max_turns must be positive",
                self.name
            )));
        }
        if self.max_tokens == 0 {
            return Err(AgentError::ConfigError(format!(
                "sub-agent {}: max_tokens must be positive",
                self.name
            )));
        }
        if let Some(stray) = self
            .confirmation_whitelist
            .iter()
            .find(|tool| !self.allowed_tools.contains(*tool))
        {
            return Err(AgentError::ConfigError(format!(
                "sub-agent {}: whitelisted tool {} is not an allowed tool",
                self.name, stray
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubAgentReport {
    pub agent: String,
    pub status: SubAgentStatus,
    pub text: String,
    pub usage: TokenUsage,
}

/// Bounded, capability-restricted agent
pub struct SubAgent {
    config: SubAgentConfig,
    model: Arc<dyn ModelService>,
    registry: Weak<ToolRegistry>,
    model_timeout: Duration,
    retry: RetryPolicy,
}

impl SubAgent {
    /// Build a sub-agent sharing the parent's model and registry
    pub fn new(parent: &Engine, config: SubAgentConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            model: Arc::clone(parent.model()),
            registry: Arc::downgrade(parent.registry()),
            model_timeout: parent.config().model_timeout,
            retry: parent.config().retry.clone(),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SubAgentConfig {
        &self.config
    }

    /// Tools this sub-agent can see: allowed, not a delegation tool, and
    /// either ungated or whitelisted. Sub-agents never nest.
    fn tool_view(&self, registry: &ToolRegistry) -> ToolRegistry {
        let config = &self.config;
        registry.filtered_view(|descriptor| {
            config.allowed_tools.contains(&descriptor.name)
                && !descriptor.delegates
                && (!descriptor.requires_confirmation
                    || config.confirmation_whitelist.contains(&descriptor.name))
        })
    }

    /// Run `task` for `user_id` in a fresh conversation until the sub-agent
    /// answers or runs out of turns
    pub async fn run(&self, task: &str, user_id: &str) -> Result<SubAgentReport> {
        let registry = self.registry.upgrade().ok_or_else(|| {
            AgentError::SubAgentError(format!("{}: tool registry is gone", self.config.name))
        })?;

        let view = self.tool_view(&registry);
        drop(registry);

        debug!(
            agent = %self.config.name,
            tools = ?view.list(),
            "Starting sub-agent"
        );

        let engine = Arc::new(Engine::new(
            Arc::clone(&self.model),
            Arc::new(view),
            EngineConfig {
                system_prompt: self.config.system_prompt.clone(),
                max_turns: self.config.max_turns,
                max_tokens: self.config.max_tokens,
                token_budget: None,
                model_timeout: self.model_timeout,
                retry: self.retry.clone(),
                pre_approved: self.config.confirmation_whitelist.iter().cloned().collect(),
            },
        ));

        let mut agent = engine.start().with_user(user_id);

        match agent.send_message(task, &StreamSink::discard()).await {
            Ok(LoopOutput::Complete { text, usage }) => {
                info!(agent = %self.config.name, "Sub-agent finished");
                Ok(SubAgentReport {
                    agent: self.config.name.clone(),
                    status: SubAgentStatus::Complete,
                    text,
                    usage,
                })
            }
            Ok(LoopOutput::ConfirmationNeeded { pending, .. }) => {
                Err(AgentError::SubAgentError(format!(
                    "{}: {} needs confirmation, which sub-agents cannot request",
                    self.config.name, pending.tool_name
                )))
            }
            Err(AgentError::MaxTurnsExceeded(turns)) => {
                warn!(agent = %self.config.name, turns, "Sub-agent ran out of turns");
                Ok(SubAgentReport {
                    agent: self.config.name.clone(),
                    status: SubAgentStatus::Incomplete,
                    text: incomplete_summary(agent.state(), turns),
                    usage: agent.usage(),
                })
            }
            Err(e) => Err(AgentError::SubAgentError(format!(
                "{}: {}",
                self.config.name, e
            ))),
        }
    }
}

/// Partial findings for a sub-agent that hit its turn limit
fn incomplete_summary(state: &ConversationState, turns: u32) -> String {
    let findings: Vec<&str> = state
        .turns()
        .iter()
        .filter_map(|turn| match turn {
            Turn::Assistant { text } if !text.trim().is_empty() => Some(text.trim()),
            _ => None,
        })
        .collect();

    let body = if findings.is_empty() {
        format!("Analysis incomplete after {} turns; no findings yet.", turns)
    } else {
        format!(
            "Analysis incomplete after {} turns. Partial findings: {}",
            turns,
            findings.join(" ")
        )
    };

    truncate(&body, INCOMPLETE_RESULT_MAX_CHARS)
}

type TaskFormatter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Exposes a [`SubAgent`] to a parent loop as a tool taking `{query}`
pub struct DelegationTool {
    descriptor: ToolDescriptor,
    sub_agent: SubAgent,
    format_task: TaskFormatter,
}

impl DelegationTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        query_description: &str,
        sub_agent: SubAgent,
    ) -> Self {
        let descriptor = ToolDescriptor::new(
            name,
            description,
            object_schema(vec![("query", string_property(query_description))], &["query"]),
        )
        .delegating();

        Self {
            descriptor,
            sub_agent,
            format_task: Arc::new(|query| query.to_string()),
        }
    }

    pub fn with_task_formatter<F>(mut self, formatter: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.format_task = Arc::new(formatter);
        self
    }

    pub fn sub_agent(&self) -> &SubAgent {
        &self.sub_agent
    }
}

#[async_trait::async_trait]
impl Tool for DelegationTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let query = input
            .parameters
            .get("query")
            .and_then(|q| q.as_str())
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| {
                AgentError::InvalidToolInput(format!("{}: query is required", self.descriptor.name))
            })?;

        let task = (self.format_task)(query);
        info!(
            tool = %self.descriptor.name,
            agent = %self.sub_agent.name(),
            "Delegating to sub-agent"
        );

        let report = self
            .sub_agent
            .run(&task, &input.user_id)
            .await?;

        Ok(ToolOutput::ok(json!({
            "agent": report.agent,
            "status": report.status,
            "response": report.text,
            "usage": report.usage,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{EngineConfig, LoopStatus};
    use crate::llm::scripted::{ScriptStep, ScriptedModel};
    use crate::llm::ModelResponse;
    use crate::models::{ToolInvocation, ToolOutcome};
    use crate::tools::FunctionTool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_tool(name: &str, calls: &Arc<AtomicUsize>) -> Arc<dyn Tool> {
        let calls = Arc::clone(calls);
        Arc::new(FunctionTool::new(
            ToolDescriptor::new(name, name, object_schema(vec![], &[])),
            move |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(ToolOutput::ok(json!({"close": [101.5, 102.0]})))
                }
            },
        ))
    }

    fn parent(model: Arc<ScriptedModel>, registry: Arc<ToolRegistry>) -> Arc<Engine> {
        Arc::new(Engine::new(model, registry, EngineConfig::default()))
    }

    #[test]
    fn test_config_validation() {
        assert!(SubAgentConfig::new("a", "p").validate().is_ok());
        assert!(SubAgentConfig::new("a", "p").with_limits(0, 10).validate().is_err());
        assert!(SubAgentConfig::new("a", "p").with_limits(3, 0).validate().is_err());
        assert!(SubAgentConfig::new("", "p").validate().is_err());
        assert!(SubAgentConfig::new("a", "p")
            .with_confirmation_whitelist(["send_money"])
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_view_hides_gated_and_self() {
        let registry = Arc::new(ToolRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(counting_tool("get_candles", &calls)).unwrap();
        registry
            .register(Arc::new(FunctionTool::new(
                ToolDescriptor::new("send_money", "", object_schema(vec![], &[])).gated(),
                |_| async { Ok(ToolOutput::ok(json!({}))) },
            )))
            .unwrap();

        let model = Arc::new(ScriptedModel::from_responses(vec![]));
        let engine = parent(model, Arc::clone(&registry));
        let sub = SubAgent::new(
            &engine,
            SubAgentConfig::new("analyst", "p").with_tools(["get_candles", "send_money", "analyze"]),
        )
        .unwrap();

        let nested = SubAgent::new(&engine, sub.config().clone()).unwrap();
        registry
            .register(Arc::new(DelegationTool::new("analyze", "", "q", nested)))
            .unwrap();

        let view = sub.tool_view(&registry);
        assert_eq!(view.list(), vec!["get_candles"]);
        assert!(registry.lookup("analyze").unwrap().descriptor().delegates);
    }

    #[tokio::test]
    async fn test_analyze_market_max_turns_is_bounded() {
        let registry = Arc::new(ToolRegistry::new());
        let candle_calls = Arc::new(AtomicUsize::new(0));
        registry
            .register(counting_tool("get_candles", &candle_calls))
            .unwrap();

        let long_thought = "RSI trending lower on the hourly chart. ".repeat(60);
        let mut steps = vec![ScriptStep::Respond(ModelResponse::tool_calls(vec![
            ToolInvocation::with_id("d1", "analyze_market", json!({"query": "BTCUSDT"})),
        ]))];
        for i in 0..5 {
            steps.push(ScriptStep::Respond(
                ModelResponse::tool_calls(vec![ToolInvocation::with_id(
                    format!("c{}", i),
                    "get_candles",
                    json!({}),
                )])
                .with_text(long_thought.clone())
                .with_usage(100, 20),
            ));
        }
        steps.push(ScriptStep::Respond(ModelResponse::text(
            "The analysis was cut short; here is what we know.",
        )));

        let model = Arc::new(ScriptedModel::new(steps));
        let engine = parent(Arc::clone(&model), Arc::clone(&registry));

        let analyst = SubAgent::new(
            &engine,
            SubAgentConfig::new("market_analyst", "analyze")
                .with_tools(["get_candles"])
                .with_limits(5, 512),
        )
        .unwrap();
        registry
            .register(Arc::new(
                DelegationTool::new("analyze_market", "Market analysis", "Symbol", analyst)
                    .with_task_formatter(|q| format!("Analyze: {}", q)),
            ))
            .unwrap();

        let mut agent = engine.start();
        let output = agent
            .send_message("how is BTC?", &StreamSink::discard())
            .await
            .unwrap();

        assert!(matches!(output, LoopOutput::Complete { .. }));
        assert_eq!(agent.status(), LoopStatus::Idle);
        assert_eq!(candle_calls.load(Ordering::SeqCst), 5);
        assert_eq!(model.call_count(), 7);

        // the sub-agent saw the formatted task and only its own tools
        let sub_request = &model.requests()[1];
        assert_eq!(sub_request.turns[0], Turn::user("Analyze: BTCUSDT"));
        assert_eq!(sub_request.system_prompt, "analyze");
        assert_eq!(sub_request.tools.len(), 1);
        assert_eq!(sub_request.max_tokens, 512);

        let delegated = agent
            .state()
            .turns()
            .iter()
            .find_map(|turn| match turn {
                Turn::ToolResult(r) if r.invocation_id == "d1" => Some(r.outcome.clone()),
                _ => None,
            })
            .unwrap();
        match delegated {
            ToolOutcome::Success(payload) => {
                assert_eq!(payload["status"], "incomplete");
                assert_eq!(payload["usage"]["inputTokens"], 500);
                assert_eq!(payload["usage"]["outputTokens"], 100);
                let response = payload["response"].as_str().unwrap();
                assert!(response.starts_with("Analysis incomplete after 5 turns"));
                assert!(response.chars().count() <= INCOMPLETE_RESULT_MAX_CHARS);
            }
            other => panic!("expected success payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_whitelisted_gated_tool_runs_without_confirmation() {
        let registry = Arc::new(ToolRegistry::new());
        let deposits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&deposits);
        registry
            .register(Arc::new(FunctionTool::new(
                ToolDescriptor::new("deposit_savings", "", object_schema(vec![], &[])).gated(),
                move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(ToolOutput::ok(json!({"ok": true})))
                    }
                },
            )))
            .unwrap();

        let model = Arc::new(ScriptedModel::from_responses(vec![
            ModelResponse::tool_calls(vec![ToolInvocation::with_id(
                "dep",
                "deposit_savings",
                json!({}),
            )]),
            ModelResponse::text("Deposited."),
        ]));
        let engine = parent(model, Arc::clone(&registry));
        let saver = SubAgent::new(
            &engine,
            SubAgentConfig::new("saver", "save")
                .with_tools(["deposit_savings"])
                .with_confirmation_whitelist(["deposit_savings"]),
        )
        .unwrap();

        let report = saver.run("move spare cash", "alice").await.unwrap();

        assert_eq!(report.status, SubAgentStatus::Complete);
        assert_eq!(report.text, "Deposited.");
        assert_eq!(deposits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sub_agent_model_failure_is_tool_error() {
        let registry = Arc::new(ToolRegistry::new());
        let model = Arc::new(ScriptedModel::new(vec![ScriptStep::Fail(
            crate::llm::ModelError::Fatal("bad request".into()),
        )]));
        let engine = parent(model, Arc::clone(&registry));
        let tool = DelegationTool::new(
            "assess_risk",
            "",
            "q",
            SubAgent::new(&engine, SubAgentConfig::new("risk_manager", "p")).unwrap(),
        );

        let input = ToolInput {
            tool_name: "assess_risk".into(),
            invocation_id: "r1".into(),
            user_id: "alice".into(),
            parameters: json!({"query": "can I open a $2 position?"}),
        };
        let err = tool.execute(&input).await.unwrap_err();
        assert!(matches!(err, AgentError::SubAgentError(_)));

        let missing = ToolInput {
            parameters: json!({}),
            ..input
        };
        tokio_test::assert_err!(tool.execute(&missing).await);
    }

    #[tokio::test]
    async fn test_sub_agents_never_see_delegation_tools() {
        let registry = Arc::new(ToolRegistry::new());
        let model = Arc::new(ScriptedModel::repeating(ModelResponse::tool_calls(vec![
            ToolInvocation::with_id("hop", "ask_b", json!({"query": "again"})),
        ])));
        let engine = parent(Arc::clone(&model), Arc::clone(&registry));

        // a and b list each other; neither can reach the other
        let a = SubAgent::new(
            &engine,
            SubAgentConfig::new("a", "p").with_tools(["ask_b"]).with_limits(2, 64),
        )
        .unwrap();
        let b = SubAgent::new(
            &engine,
            SubAgentConfig::new("b", "p").with_tools(["ask_a"]).with_limits(2, 64),
        )
        .unwrap();
        registry
            .register(Arc::new(DelegationTool::new("ask_a", "", "q", a)))
            .unwrap();
        registry
            .register(Arc::new(DelegationTool::new("ask_b", "", "q", b)))
            .unwrap();

        let tool = registry.lookup("ask_a").unwrap();
        let input = ToolInput {
            tool_name: "ask_a".into(),
            invocation_id: "top".into(),
            user_id: "alice".into(),
            parameters: json!({"query": "start"}),
        };
        let output = tool.execute(&input).await.unwrap();

        assert_eq!(output.data["status"], "incomplete");
        assert_eq!(model.call_count(), 2);
        assert!(model.requests().iter().all(|r| r.tools.is_empty()));
    }

    #[tokio::test]
    async fn test_sub_agent_tools_run_for_the_parent_user() {
        let registry = Arc::new(ToolRegistry::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let captured = Arc::clone(&seen);
        registry
            .register(Arc::new(FunctionTool::new(
                ToolDescriptor::new("get_portfolio", "", object_schema(vec![], &[])),
                move |input: ToolInput| {
                    captured.lock().unwrap().push(input.user_id);
                    async { Ok(ToolOutput::ok(json!({"positions": []}))) }
                },
            )))
            .unwrap();

        let model = Arc::new(ScriptedModel::from_responses(vec![
            ModelResponse::tool_calls(vec![ToolInvocation::with_id(
                "d",
                "plan",
                json!({"query": "rebalance"}),
            )]),
            ModelResponse::tool_calls(vec![ToolInvocation::with_id(
                "p",
                "get_portfolio",
                json!({}),
            )]),
            ModelResponse::text("Hold."),
            ModelResponse::text("The strategist suggests holding."),
        ]));
        let engine = parent(model, Arc::clone(&registry));
        let planner = SubAgent::new(
            &engine,
            SubAgentConfig::new("strategist", "p").with_tools(["get_portfolio"]),
        )
        .unwrap();
        registry
            .register(Arc::new(DelegationTool::new("plan", "", "q", planner)))
            .unwrap();

        let mut agent = engine.start().with_user("alice");
        agent
            .send_message("what should I do?", &StreamSink::discard())
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_registry_is_reported() {
        let registry = Arc::new(ToolRegistry::new());
        let model = Arc::new(ScriptedModel::from_responses(vec![]));
        let engine = parent(model, registry);
        let sub = SubAgent::new(&engine, SubAgentConfig::new("orphan", "p")).unwrap();
        drop(engine);

        let err = sub.run("anything", "alice").await.unwrap_err();
        assert!(matches!(err, AgentError::SubAgentError(_)));
    }
}
