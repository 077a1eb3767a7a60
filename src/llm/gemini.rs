//! Gemini API adapter
//!
//! Maps conversation turns onto Gemini `contents` with function calling.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::AgentError;
use crate::llm::{ModelError, ModelRequest, ModelResponse, ModelService, StreamSink};
use crate::models::{TokenUsage, ToolInvocation, Turn};
use crate::tools::ToolDescriptor;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiModel {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
}

impl GeminiModel {
    pub fn new(api_key: String, model: String, timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()
            .map_err(AgentError::from)?;

        Ok(Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model,
            temperature: 0.3,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        )
    }

    fn build_request(&self, request: &ModelRequest) -> GeminiRequest {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(vec![ToolSet {
                function_declarations: request.tools.iter().map(declaration).collect(),
            }])
        };

        GeminiRequest {
            contents: build_contents(&request.turns),
            system_instruction: (!request.system_prompt.is_empty()).then(|| SystemInstruction {
                parts: vec![Part::text(request.system_prompt.clone())],
            }),
            tools,
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: request.max_tokens,
            },
        }
    }
}

fn classify_status(status: StatusCode, body: String) -> ModelError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ModelError::Transient(format!("Gemini API {}: {}", status.as_u16(), body))
    } else {
        ModelError::Fatal(format!("Gemini API {}: {}", status.as_u16(), body))
    }
}

fn classify_transport(err: reqwest::Error) -> ModelError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ModelError::Transient(format!("Gemini API request failed: {}", err))
    } else {
        ModelError::Fatal(format!("Gemini API request failed: {}", err))
    }
}

#[async_trait::async_trait]
impl ModelService for GeminiModel {
    async fn respond(
        &self,
        request: &ModelRequest,
        sink: &StreamSink,
    ) -> Result<ModelResponse, ModelError> {
        if self.api_key.is_empty() {
            return Err(ModelError::Fatal("GEMINI_API_KEY not configured".to_string()));
        }

        let body = self.build_request(request);

        debug!(
            model = %self.model,
            turns = request.turns.len(),
            tools = request.tools.len(),
            "Calling Gemini API"
        );

        let response = self
            .client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                classify_transport(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(classify_status(status, error_text));
        }

        let parsed: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            ModelError::Fatal(format!("Gemini parse error: {}", e))
        })?;

        let result = parse_response(parsed)?;
        sink.emit(&result.text);

        info!(
            invocations = result.invocations.len(),
            output_tokens = result.usage.output_tokens,
            "Gemini response received"
        );

        Ok(result)
    }
}

/// Group turns into role-alternating Gemini contents
fn build_contents(turns: &[Turn]) -> Vec<Content> {
    let mut tool_names: HashMap<&str, &str> = HashMap::new();
    let mut contents: Vec<Content> = Vec::new();

    for turn in turns {
        let (role, part) = match turn {
            Turn::User { text } => ("user", Part::text(text.clone())),
            Turn::Assistant { text } => ("model", Part::text(text.clone())),
            Turn::ToolInvocation(inv) => {
                tool_names.insert(inv.id.as_str(), inv.tool_name.as_str());
                (
                    "model",
                    Part {
                        function_call: Some(FunctionCall {
                            id: Some(inv.id.clone()),
                            name: inv.tool_name.clone(),
                            args: inv.arguments.clone(),
                        }),
                        ..Part::default()
                    },
                )
            }
            Turn::ToolResult(result) => {
                let name = tool_names
                    .get(result.invocation_id.as_str())
                    .copied()
                    .unwrap_or("unknown_tool");
                (
                    "user",
                    Part {
                        function_response: Some(FunctionResponse {
                            id: Some(result.invocation_id.clone()),
                            name: name.to_string(),
                            response: json!({
                                "status": result.outcome.to_string(),
                                "content": result.outcome.to_content(),
                            }),
                        }),
                        ..Part::default()
                    },
                )
            }
        };

        match contents.last_mut() {
            Some(last) if last.role == role => last.parts.push(part),
            _ => contents.push(Content {
                role: role.to_string(),
                parts: vec![part],
            }),
        }
    }

    contents
}

fn declaration(descriptor: &ToolDescriptor) -> FunctionDeclaration {
    let has_properties = descriptor
        .input_schema
        .get("properties")
        .and_then(Value::as_object)
        .map_or(false, |props| !props.is_empty());

    FunctionDeclaration {
        name: descriptor.name.clone(),
        description: descriptor.description.clone(),
        parameters: has_properties.then(|| descriptor.input_schema.clone()),
    }
}

fn parse_response(response: GeminiResponse) -> Result<ModelResponse, ModelError> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::Fatal("No response from Gemini API".to_string()))?;

    let mut text = String::new();
    let mut invocations = Vec::new();

    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(call) = part.function_call {
            // parameterless declarations come back without `args`
            let args = match call.args {
                Value::Null => Value::Object(Default::default()),
                args => args,
            };
            let invocation = match call.id {
                Some(id) if !id.is_empty() => ToolInvocation::with_id(id, call.name, args),
                _ => ToolInvocation::new(call.name, args),
            };
            invocations.push(invocation);
        }
    }

    if text.is_empty() && invocations.is_empty() {
        return Err(ModelError::Fatal(format!(
            "Empty response from Gemini (finish reason: {})",
            candidate.finish_reason.unwrap_or_else(|| "unknown".to_string())
        )));
    }

    let usage = response
        .usage_metadata
        .map(|u| TokenUsage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        })
        .unwrap_or_default();

    Ok(ModelResponse {
        text,
        invocations,
        usage,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolSet>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSet {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}
