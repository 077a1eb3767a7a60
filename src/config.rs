//! Runtime configuration loaded from the environment
//!
//! Binaries call `dotenv::dotenv()` first, so a local `.env` file works too.

use crate::agent::{EngineConfig, RetryPolicy};
use crate::error::AgentError;
use crate::tools::HttpToolExecutorConfig;
use crate::Result;
use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_USER_ID: &str = "default-user";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub port: u16,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub engine: EngineConfig,
    /// Wallet gateway; tools are only registered when a base URL is set
    pub tools_api: Option<HttpToolExecutorConfig>,
    pub database_url: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup (the process environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| lookup(key))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = parse_or(get(&["PORT", "API_PORT"]), "PORT", DEFAULT_PORT)?;

        let defaults = EngineConfig::default();
        let retry_defaults = RetryPolicy::default();
        let engine = EngineConfig {
            system_prompt: get(&["AGENT_SYSTEM_PROMPT"]).unwrap_or(defaults.system_prompt),
            max_turns: parse_or(get(&["AGENT_MAX_TURNS"]), "AGENT_MAX_TURNS", defaults.max_turns)?,
            max_tokens: parse_or(
                get(&["AGENT_MAX_TOKENS"]),
                "AGENT_MAX_TOKENS",
                defaults.max_tokens,
            )?,
            token_budget: get(&["AGENT_TOKEN_BUDGET"])
                .map(|raw| parse_value::<u64>(&raw, "AGENT_TOKEN_BUDGET"))
                .transpose()?,
            model_timeout: Duration::from_secs(parse_or(
                get(&["MODEL_TIMEOUT_SECS"]),
                "MODEL_TIMEOUT_SECS",
                defaults.model_timeout.as_secs(),
            )?),
            retry: RetryPolicy {
                max_attempts: parse_or(
                    get(&["MODEL_MAX_ATTEMPTS"]),
                    "MODEL_MAX_ATTEMPTS",
                    retry_defaults.max_attempts,
                )?,
                ..retry_defaults
            },
            pre_approved: HashSet::new(),
        };

        if engine.max_turns == 0 {
            return Err(AgentError::ConfigError(
                "AGENT_MAX_TURNS must be positive".to_string(),
            ));
        }

        let tools_api = get(&["FINANCIAL_API_BASE_URL", "TOOLS_API_BASE_URL"]).map(|base_url| {
            HttpToolExecutorConfig::new(base_url, get(&["FINANCIAL_API_KEY"]).unwrap_or_default())
        });

        Ok(Self {
            port,
            gemini_api_key: get(&["GEMINI_API_KEY"])
                .filter(|key| key != "your_gemini_api_key_here"),
            gemini_model: get(&["GEMINI_MODEL"]).unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            engine,
            tools_api,
            database_url: get(&["POSTGRES_URL", "DATABASE_URL"]),
        })
    }
}

fn parse_value<T: FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| AgentError::ConfigError(format!("{} has an invalid value: {}", key, raw)))
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T> {
    match raw {
        Some(raw) => parse_value(&raw, key),
        None => Ok(default),
    }
}
