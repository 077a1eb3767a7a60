//! Scripted model for development & testing
//!
//! Keeps the loop exercisable without an LLM dependency: responses are
//! played back in order and every request is recorded.

use crate::llm::{ModelError, ModelRequest, ModelResponse, ModelService, StreamSink};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(ModelResponse),
    Fail(ModelError),
    /// Wait before responding (exercises the call timeout)
    Stall(Duration, ModelResponse),
}

pub struct ScriptedModel {
    steps: Mutex<VecDeque<ScriptStep>>,
    fallback: Option<ModelResponse>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Play `responses` in order
    pub fn from_responses(responses: Vec<ModelResponse>) -> Self {
        Self::new(responses.into_iter().map(ScriptStep::Respond).collect())
    }

    /// Answer every call with `response`, giving its invocations fresh ids
    pub fn repeating(response: ModelResponse) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: Some(response),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn next_step(&self, call_index: usize) -> ScriptStep {
        let queued = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match (queued, &self.fallback) {
            (Some(step), _) => step,
            (None, Some(fallback)) => {
                let mut response = fallback.clone();
                for invocation in &mut response.invocations {
                    invocation.id = format!("{}-{}", invocation.id, call_index);
                }
                ScriptStep::Respond(response)
            }
            (None, None) => ScriptStep::Fail(ModelError::Fatal("script exhausted".to_string())),
        }
    }
}

/// Stream text word by word, whitespace kept with the preceding word
fn stream_text(text: &str, sink: &StreamSink) {
    for piece in text.split_inclusive(' ') {
        sink.emit(piece);
    }
}

#[async_trait::async_trait]
impl ModelService for ScriptedModel {
    async fn respond(
        &self,
        request: &ModelRequest,
        sink: &StreamSink,
    ) -> Result<ModelResponse, ModelError> {
        let call_index = {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests.push(request.clone());
            requests.len()
        };

        match self.next_step(call_index) {
            ScriptStep::Respond(response) => {
                stream_text(&response.text, sink);
                Ok(response)
            }
            ScriptStep::Fail(error) => Err(error),
            ScriptStep::Stall(delay, response) => {
                tokio::time::sleep(delay).await;
                stream_text(&response.text, sink);
                Ok(response)
            }
        }
    }
}
