//! HTTP-backed tool executor
//!
//! Calls the wallet/savings gateway. One long-lived `reqwest::Client` is
//! shared by every tool bound to the executor.

use crate::error::AgentError;
use crate::models::{ExecuteRequest, ToolOutput};
use crate::tools::ToolExecutor;
use crate::Result;
use reqwest::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpToolExecutorConfig {
    /// Gateway URL, e.g. `https://api.example.com`
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl HttpToolExecutorConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpToolExecutor {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpToolExecutor {
    pub fn new(config: HttpToolExecutorConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    /// Gateway path for a tool; unknown tools use the generic route
    pub fn endpoint_for_tool(tool: &str) -> String {
        let path = match tool {
            "get_balance" => "/api/v1/agent/wallet/balance",
            "get_savings_balance" => "/api/v1/agent/savings/balance",
            "get_vault_rates" => "/api/v1/agent/savings/vaults",
            "get_transactions" => "/api/v1/agent/transactions",
            "get_profile" => "/api/v1/agent/profile",
            "search_users" => "/api/v1/agent/users/search",
            "send_money" => "/api/v1/agent/payments/send",
            "deposit_savings" => "/api/v1/agent/savings/deposit",
            "withdraw_savings" => "/api/v1/agent/savings/withdraw",
            other => return format!("/api/v1/agent/tools/{}", other),
        };
        path.to_string()
    }

    /// Stable key so the gateway can drop replays of the same invocation
    pub fn idempotency_key(invocation_id: &str) -> String {
        hex::encode(Sha256::digest(invocation_id.as_bytes()))
    }

    async fn post_json(&self, path: &str, request: &ExecuteRequest) -> Result<ToolOutput> {
        let url = format!("{}{}", self.base_url, path);

        debug!(
            %url,
            user_id = %request.user_id,
            request_id = %request.request_id,
            "Calling tool gateway"
        );

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-API-Key", &self.api_key)
            .header("Idempotency-Key", Self::idempotency_key(&request.request_id))
            .json(request)
            .send()
            .await
            .map_err(|e| {
                AgentError::ToolError(format!("Tool gateway request failed for {}: {}", path, e))
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            AgentError::ToolError(format!("Failed to read gateway response: {}", e))
        })?;

        if !status.is_success() {
            warn!(%status, path, "Tool gateway returned an error status");
            return Ok(ToolOutput::failed(format!("HTTP {}: {}", status.as_u16(), text)));
        }

        Ok(parse_gateway_body(&text))
    }
}

/// Accept both the `{success, data, error}` envelope and raw JSON bodies.
fn parse_gateway_body(text: &str) -> ToolOutput {
    if let Ok(output) = serde_json::from_str::<ToolOutput>(text) {
        return output;
    }

    match serde_json::from_str::<Value>(text) {
        Ok(value) => ToolOutput::ok(value),
        Err(_) => ToolOutput::ok(Value::String(text.to_string())),
    }
}

#[async_trait::async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(&self, request: &ExecuteRequest) -> Result<ToolOutput> {
        let endpoint = Self::endpoint_for_tool(&request.tool);
        self.post_json(&endpoint, request).await
    }
}
