//! Pre-configured specialists
//!
//! Market tools (`get_market_price`, `get_candles`, ...) are served by the
//! same HTTP gateway as the wallet tools; a sub-agent only sees the ones it
//! lists.

use super::{DelegationTool, SubAgent, SubAgentConfig};
use crate::agent::{Engine, EngineConfig};
use crate::tools::Tool;
use crate::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub const STRATEGIST_SYSTEM_PROMPT: &str = "You are a market strategist specialist.

Your role is to analyze market conditions and develop investment strategies:
- market trend analysis and momentum indicators
- risk assessment and position sizing recommendations
- entry and exit timing based on technical signals
- portfolio allocation suggestions

Method: gather data with the available tools, analyze patterns and risk factors, \
evaluate candidate strategies against the user's risk tolerance, refine, then present \
clear recommendations.

Be data-driven with specific numbers. Always weigh downside risk against upside. \
State a confidence level for each recommendation. Never execute trades; only analyze \
and recommend.";

pub const MARKET_ANALYST_SYSTEM_PROMPT: &str = "You are a market analyst specializing in technical analysis.

Check the current price and recent trend, RSI for overbought or oversold conditions, \
MACD for momentum and Bollinger Bands for volatility.

Always report: current price and trend direction, RSI reading, MACD momentum, an overall \
signal (STRONG BUY, BUY, HOLD, SELL, STRONG SELL) and a confidence level (HIGH, MEDIUM, LOW).

Be objective. Never trade. Explain your reasoning and warn about high volatility.";

pub const RISK_MANAGER_SYSTEM_PROMPT: &str = "You are a risk manager protecting the user's portfolio.

Check portfolio value against its floor, available trading capacity and current exposure. \
Never size a position beyond the risk profile's limit and keep a buffer above the stop-loss floor.

Report: portfolio status, risk level (LOW, MEDIUM, HIGH, CRITICAL), the amount available for \
trading, the recommended maximum position size and any warnings. Quantify risk in dollar terms \
and err on the side of capital preservation.";

pub const STRATEGY_EVALUATOR_SYSTEM_PROMPT: &str = "You are a trading strategy evaluator.

Evaluate signals against the user's risk profile using an RSI reversal strategy with trend \
confirmation. Long entries need RSI below 35 with price above the 20-period SMA, or RSI below 25. \
Short entries need RSI above 65 with price below the 20-period SMA, or RSI above 75.

Answer with: signal (BUY, SELL or WAIT), entry price, stop-loss, take-profit, position size as a \
percentage of available funds, confidence and reasoning. Only recommend a trade when several \
indicators agree; WAIT is often the right answer.";

pub const ORCHESTRATOR_SYSTEM_PROMPT: &str = "You are a financial orchestrator agent.

You coordinate complex requests by delegating to specialists and combining their answers.

Specialists:
- plan_strategy: market strategist for investment strategy and allocation
- analyze_market: technical analyst for price action and trade signals
- assess_risk: risk manager for position sizing and portfolio health
- evaluate_strategy: strategy evaluator for concrete entry and exit levels

Break the request into subtasks, delegate each to the right specialist, wait for their \
answers, then give one coherent recommendation. If a specialist fails or returns an \
incomplete analysis, say so and work with what you have.";

const STRATEGIST_TOOLS: [&str; 3] = ["get_market_data", "get_portfolio", "get_indicators"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RiskProfile {
    Conservative,
    #[default]
    Moderate,
    Aggressive,
}

impl RiskProfile {
    /// Unknown profiles fall back to moderate
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "conservative" => RiskProfile::Conservative,
            "aggressive" => RiskProfile::Aggressive,
            _ => RiskProfile::Moderate,
        }
    }

    fn prompt(&self) -> &'static str {
        match self {
            RiskProfile::Conservative => {
                "\n\nRISK PROFILE: CONSERVATIVE\n\
                 - Capital preservation comes first\n\
                 - Stable, low-volatility positions only\n\
                 - At most 5% of the portfolio per trade\n\
                 - No momentum plays or speculative assets"
            }
            RiskProfile::Moderate => {
                "\n\nRISK PROFILE: MODERATE\n\
                 - Balance risk and reward\n\
                 - 5-10% of the portfolio per trade\n\
                 - Hedge concentrated positions\n\
                 - No excessive leverage"
            }
            RiskProfile::Aggressive => {
                "\n\nRISK PROFILE: AGGRESSIVE\n\
                 - Higher risk tolerance is acceptable\n\
                 - Momentum and trend-following welcome\n\
                 - Up to 20% of the portfolio per trade\n\
                 - Look for asymmetric risk/reward"
            }
        }
    }
}

impl fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskProfile::Conservative => "conservative",
            RiskProfile::Moderate => "moderate",
            RiskProfile::Aggressive => "aggressive",
        };
        write!(f, "{}", s)
    }
}

pub fn strategist(engine: &Engine) -> Result<SubAgent> {
    SubAgent::new(
        engine,
        SubAgentConfig::new("strategist", STRATEGIST_SYSTEM_PROMPT)
            .with_tools(STRATEGIST_TOOLS)
            .with_limits(8, 2048),
    )
}

pub fn strategist_with_risk_profile(engine: &Engine, profile: RiskProfile) -> Result<SubAgent> {
    SubAgent::new(
        engine,
        SubAgentConfig::new(
            format!("strategist-{}", profile),
            format!("{}{}", STRATEGIST_SYSTEM_PROMPT, profile.prompt()),
        )
        .with_tools(STRATEGIST_TOOLS)
        .with_limits(8, 2048),
    )
}

pub fn market_analyst(engine: &Engine) -> Result<SubAgent> {
    SubAgent::new(
        engine,
        SubAgentConfig::new("market_analyst", MARKET_ANALYST_SYSTEM_PROMPT)
            .with_tools(["get_market_price", "get_candles", "calc_indicators"])
            .with_limits(5, 1024),
    )
}

pub fn risk_manager(engine: &Engine) -> Result<SubAgent> {
    SubAgent::new(
        engine,
        SubAgentConfig::new("risk_manager", RISK_MANAGER_SYSTEM_PROMPT)
            .with_tools(["get_trading_status", "get_balance"])
            .with_limits(3, 768),
    )
}

pub fn strategy_evaluator(engine: &Engine) -> Result<SubAgent> {
    SubAgent::new(
        engine,
        SubAgentConfig::new("strategy_evaluator", STRATEGY_EVALUATOR_SYSTEM_PROMPT)
            .with_tools(["calc_indicators", "get_trading_status"])
            .with_limits(4, 1024),
    )
}

pub fn plan_strategy_tool(engine: &Engine) -> Result<DelegationTool> {
    Ok(DelegationTool::new(
        "plan_strategy",
        "Delegate investment strategy to the strategist. Use for allocation, trend outlook and position sizing advice.",
        "The strategy request (e.g. 'Should I increase my BTC position?')",
        strategist(engine)?,
    )
    .with_task_formatter(|query| {
        format!("Analyze the market and provide strategy recommendations for: {}", query)
    }))
}

pub fn analyze_market_tool(engine: &Engine) -> Result<DelegationTool> {
    Ok(DelegationTool::new(
        "analyze_market",
        "Delegate market analysis to the analyst. Use for technical analysis, trend identification and trade signals.",
        "The market or symbol to analyze (e.g. 'BTCUSDT', 'is ETH oversold?')",
        market_analyst(engine)?,
    )
    .with_task_formatter(|query| {
        format!("Perform technical analysis and provide trading signals for: {}", query)
    }))
}

pub fn assess_risk_tool(engine: &Engine) -> Result<DelegationTool> {
    Ok(DelegationTool::new(
        "assess_risk",
        "Delegate risk assessment to the risk manager. Use before trades to check position sizing and portfolio health.",
        "The risk question (e.g. 'Can I open a $200 position?')",
        risk_manager(engine)?,
    )
    .with_task_formatter(|query| format!("Assess risk and provide guidance on: {}", query)))
}

pub fn evaluate_strategy_tool(engine: &Engine) -> Result<DelegationTool> {
    Ok(DelegationTool::new(
        "evaluate_strategy",
        "Delegate trade evaluation to the strategy specialist. Use to get concrete entry and exit levels.",
        "The trade to evaluate (e.g. 'Should I buy BTCUSDT now?')",
        strategy_evaluator(engine)?,
    )
    .with_task_formatter(|query| {
        format!(
            "Evaluate this trading opportunity and provide specific recommendations: {}",
            query
        )
    }))
}

/// Coordinating agent configuration: a prompt plus the workers it delegates to
pub struct Orchestrator {
    workers: BTreeMap<String, Arc<DelegationTool>>,
    system_prompt: String,
}

impl Orchestrator {
    /// Orchestrator with the four default specialists
    pub fn new(engine: &Engine) -> Result<Self> {
        let mut orchestrator = Self::empty();
        orchestrator.add_worker(plan_strategy_tool(engine)?);
        orchestrator.add_worker(analyze_market_tool(engine)?);
        orchestrator.add_worker(assess_risk_tool(engine)?);
        orchestrator.add_worker(evaluate_strategy_tool(engine)?);
        Ok(orchestrator)
    }

    pub fn empty() -> Self {
        Self {
            workers: BTreeMap::new(),
            system_prompt: ORCHESTRATOR_SYSTEM_PROMPT.to_string(),
        }
    }

    /// Parent engine config that tells the model about its specialists
    pub fn engine_config(&self, base: &EngineConfig) -> EngineConfig {
        EngineConfig {
            system_prompt: format!("{}\n\n{}", base.system_prompt, self.system_prompt),
            ..base.clone()
        }
    }

    pub fn add_worker(&mut self, tool: DelegationTool) {
        self.workers
            .insert(tool.descriptor().name.clone(), Arc::new(tool));
    }

    /// Delegation tools, ready to register with the parent registry
    pub fn worker_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.workers
            .values()
            .map(|tool| Arc::clone(tool) as Arc<dyn Tool>)
            .collect()
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }
}
