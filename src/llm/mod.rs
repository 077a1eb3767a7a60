//! Language-model service boundary
//!
//! The loop only depends on [`ModelService`]. A response carries the full
//! assistant text plus zero or more tool invocations; text may also be
//! streamed through a [`StreamSink`] while the response is produced.

use crate::models::{TokenUsage, ToolInvocation, Turn};
use crate::tools::ToolDescriptor;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub mod gemini;
pub mod scripted;

pub use gemini::GeminiModel;
pub use scripted::ScriptedModel;

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolDescriptor>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub invocations: Vec<ToolInvocation>,
    pub usage: TokenUsage,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn tool_calls(invocations: Vec<ToolInvocation>) -> Self {
        Self {
            invocations,
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage {
            input_tokens,
            output_tokens,
        };
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Worth retrying: timeouts, rate limits, 5xx
    #[error("transient model failure: {0}")]
    Transient(String),

    #[error("model failure: {0}")]
    Fatal(String),
}

#[async_trait::async_trait]
pub trait ModelService: Send + Sync {
    /// Produce the next assistant response.
    ///
    /// Fragments pushed to `sink` must concatenate to `ModelResponse::text`.
    async fn respond(
        &self,
        request: &ModelRequest,
        sink: &StreamSink,
    ) -> std::result::Result<ModelResponse, ModelError>;
}

type ChunkFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Destination for streamed text fragments.
///
/// Cloning shares the fragment counter, so the loop can tell whether an
/// attempt already streamed something.
#[derive(Clone)]
pub struct StreamSink {
    on_chunk: Option<ChunkFn>,
    emitted: Arc<AtomicUsize>,
}

impl StreamSink {
    pub fn new<F>(on_chunk: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            on_chunk: Some(Arc::new(on_chunk)),
            emitted: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sink that drops every fragment (sub-agents, batch callers)
    pub fn discard() -> Self {
        Self {
            on_chunk: None,
            emitted: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn emit(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.emitted.fetch_add(1, Ordering::SeqCst);
        if let Some(on_chunk) = &self.on_chunk {
            on_chunk(chunk);
        }
    }

    /// Number of non-empty fragments emitted so far
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }
}

impl Default for StreamSink {
    fn default() -> Self {
        Self::discard()
    }
}

impl fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("forwarding", &self.on_chunk.is_some())
            .field("emitted", &self.emitted())
            .finish()
    }
}
