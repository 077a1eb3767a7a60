//! Tool trait and registry
//!
//! A tool is a descriptor (name, schema, confirmation policy) bound to an
//! executor. The registry is built once at startup and shared by every
//! session as `Arc<ToolRegistry>`.

use crate::error::AgentError;
use crate::models::{ExecuteRequest, ToolInput, ToolOutput};
use crate::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

pub mod http;
pub mod schema;
pub mod template;
pub mod wallet;

pub use http::{HttpToolExecutor, HttpToolExecutorConfig};

/// Immutable tool metadata exposed to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_template: Option<String>,
    /// Runs a nested agent; never offered to sub-agents
    #[serde(default)]
    pub delegates: bool,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            requires_confirmation: false,
            summary_template: None,
            delegates: false,
        }
    }

    /// Gate the tool behind user confirmation with a summary template
    pub fn with_confirmation(mut self, summary_template: impl Into<String>) -> Self {
        self.requires_confirmation = true;
        self.summary_template = Some(summary_template.into());
        self
    }

    /// Gate the tool behind user confirmation without a template
    pub fn gated(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn delegating(mut self) -> Self {
        self.delegates = true;
        self
    }

    /// Check the registration-time invariants
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AgentError::InvalidToolDefinition(
                "tool name must not be empty".to_string(),
            ));
        }

        if let Some(template) = &self.summary_template {
            let undocumented = template::undocumented_placeholders(template, &self.input_schema)
                .map_err(|e| {
                    AgentError::InvalidToolDefinition(format!("{}: {}", self.name, e))
                })?;
            if !undocumented.is_empty() {
                return Err(AgentError::InvalidToolDefinition(format!(
                    "{}: summary template references undocumented arguments {:?}",
                    self.name, undocumented
                )));
            }
        }

        Ok(())
    }

    /// Check invocation arguments against the input schema
    pub fn validate_arguments(&self, arguments: &Value) -> Result<()> {
        if !arguments.is_object() {
            return Err(AgentError::InvalidToolInput(format!(
                "{} expects a JSON object",
                self.name
            )));
        }

        let missing = schema::missing_required(&self.input_schema, arguments);
        if !missing.is_empty() {
            return Err(AgentError::InvalidToolInput(format!(
                "{} is missing required arguments: {}",
                self.name,
                missing.join(", ")
            )));
        }

        Ok(())
    }
}

/// A named capability the model may invoke
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput>;

    fn name(&self) -> &str {
        &self.descriptor().name
    }
}

/// Backend that can run tools by name (e.g. the wallet HTTP gateway)
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, request: &ExecuteRequest) -> Result<ToolOutput>;
}

/// Descriptor bound to a shared executor
pub struct ExecutorTool {
    descriptor: ToolDescriptor,
    executor: Arc<dyn ToolExecutor>,
}

impl ExecutorTool {
    pub fn new(descriptor: ToolDescriptor, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            descriptor,
            executor,
        }
    }
}

#[async_trait::async_trait]
impl Tool for ExecutorTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        self.executor.execute(&ExecuteRequest::from(input)).await
    }
}

type ToolFn = Arc<dyn Fn(ToolInput) -> BoxFuture<'static, Result<ToolOutput>> + Send + Sync>;

/// Tool backed by an async closure
pub struct FunctionTool {
    descriptor: ToolDescriptor,
    func: ToolFn,
}

impl FunctionTool {
    pub fn new<F, Fut>(descriptor: ToolDescriptor, func: F) -> Self
    where
        F: Fn(ToolInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        Self {
            descriptor,
            func: Arc::new(move |input| Box::pin(func(input))),
        }
    }
}

#[async_trait::async_trait]
impl Tool for FunctionTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        (self.func)(input.clone()).await
    }
}

/// Tool registry for looking up and executing tools
///
/// Read-mostly: lookups take a shared lock and never block each other.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn Tool>>> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn Tool>>> {
        self.tools.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a tool, replacing any previous tool with the same name
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<()> {
        tool.descriptor().validate()?;

        let name = tool.name().to_string();
        let replaced = self.write().insert(name.clone(), tool).is_some();

        debug!(tool = %name, replaced, "Tool registered");
        Ok(())
    }

    pub fn register_all(&self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Result<()> {
        for tool in tools {
            self.register(tool)?;
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.read().get(name).cloned()
    }

    /// Registered tool names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptors of all registered tools, sorted by name
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .read()
            .values()
            .map(|tool| tool.descriptor().clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of the tools matching `predicate`
    pub fn filtered_view<F>(&self, predicate: F) -> ToolRegistry
    where
        F: Fn(&ToolDescriptor) -> bool,
    {
        let subset = self
            .read()
            .iter()
            .filter(|(_, tool)| predicate(tool.descriptor()))
            .map(|(name, tool)| (name.clone(), Arc::clone(tool)))
            .collect();

        ToolRegistry {
            tools: RwLock::new(subset),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Predicate matching tools by name
pub fn filter_by_names<I, S>(names: I) -> impl Fn(&ToolDescriptor) -> bool
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let names: HashSet<String> = names.into_iter().map(Into::into).collect();
    move |descriptor| names.contains(&descriptor.name)
}
