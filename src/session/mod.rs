//! Session protocol
//!
//! One [`Session`] per client connection. Inbound JSON messages drive the
//! conversation's [`AgentLoop`]; everything the client sees goes through one
//! ordered outbound channel, streamed chunks included.

use crate::agent::{AgentLoop, Engine, LoopOutput};
use crate::error::AgentError;
use crate::llm::StreamSink;
use crate::models::{ConversationState, TokenUsage, Turn};
use crate::store::ConversationStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    NewConversation,
    ResumeConversation {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    Message {
        content: String,
    },
    Confirm {
        #[serde(rename = "actionId")]
        action_id: String,
    },
    Cancel {
        #[serde(rename = "actionId")]
        action_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConversationStarted {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    ConversationResumed {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        messages: Vec<TranscriptMessage>,
    },
    TextChunk {
        content: String,
    },
    Text {
        content: String,
    },
    ConfirmRequest {
        #[serde(rename = "actionId")]
        action_id: String,
        tool: String,
        summary: String,
        content: String,
    },
    Complete {
        #[serde(rename = "tokenUsage", default, skip_serializing_if = "Option::is_none")]
        token_usage: Option<TokenUsage>,
    },
    Error {
        content: String,
        recoverable: bool,
    },
}

/// Conversation id from client input; non-UUID ids map to a stable UUID
pub fn conversation_uuid(raw: &str) -> Uuid {
    Uuid::parse_str(raw.trim()).unwrap_or_else(|_| stable_uuid_from_string(raw.trim()))
}

fn stable_uuid_from_string(input: &str) -> Uuid {
    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

/// User-visible transcript of a conversation (tool traffic omitted)
pub fn transcript(turns: &[Turn]) -> Vec<TranscriptMessage> {
    turns
        .iter()
        .filter_map(|turn| match turn {
            Turn::User { text } => Some(("user", text)),
            Turn::Assistant { text } => Some(("assistant", text)),
            _ => None,
        })
        .map(|(role, text)| TranscriptMessage {
            role: role.to_string(),
            content: text.clone(),
        })
        .collect()
}

struct ActiveConversation {
    id: Uuid,
    agent: AgentLoop,
}

pub struct Session {
    engine: Arc<Engine>,
    store: Arc<dyn ConversationStore>,
    user_id: String,
    outbound: UnboundedSender<ServerMessage>,
    active: Option<ActiveConversation>,
}

impl Session {
    pub fn new(
        engine: Arc<Engine>,
        store: Arc<dyn ConversationStore>,
        user_id: impl Into<String>,
        outbound: UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            engine,
            store,
            user_id: user_id.into(),
            outbound,
            active: None,
        }
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|active| active.id)
    }

    pub fn agent(&self) -> Option<&AgentLoop> {
        self.active.as_ref().map(|active| &active.agent)
    }

    /// Handle one raw frame from the client
    pub async fn handle_text(&mut self, raw: &str) {
        match serde_json::from_str::<ClientMessage>(raw) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                debug!(error = %e, "Rejected client frame");
                self.send_error(&AgentError::ProtocolError(format!(
                    "Invalid message format: {}",
                    e
                )));
            }
        }
    }

    pub async fn handle(&mut self, message: ClientMessage) {
        if let Err(e) = self.dispatch(message).await {
            self.send_error(&e);
        }
    }

    /// Release the conversation; a pending confirmation is dropped unanswered
    pub fn close(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Some(pending) = active.agent.cancel_pending() {
                info!(
                    conversation_id = %active.id,
                    action_id = %pending.action_id,
                    "Session closed with an unanswered confirmation"
                );
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::NewConversation => self.new_conversation().await,
            ClientMessage::ResumeConversation { conversation_id } => {
                self.resume_conversation(&conversation_id).await
            }
            ClientMessage::Message { content } => self.message(&content).await,
            ClientMessage::Confirm { action_id } => self.resolve(&action_id, true).await,
            ClientMessage::Cancel { action_id } => self.resolve(&action_id, false).await,
        }
    }

    async fn new_conversation(&mut self) -> Result<()> {
        self.close();

        let meta = self.store.create(&self.user_id).await?;
        self.active = Some(ActiveConversation {
            id: meta.id,
            agent: self.engine.start().with_user(self.user_id.clone()),
        });

        info!(conversation_id = %meta.id, user_id = %self.user_id, "Started conversation");
        self.send(ServerMessage::ConversationStarted {
            conversation_id: meta.id,
        });
        Ok(())
    }

    async fn resume_conversation(&mut self, raw_id: &str) -> Result<()> {
        self.close();

        let id = conversation_uuid(raw_id);
        let stored = self
            .store
            .load(id)
            .await?
            .filter(|stored| stored.meta.user_id == self.user_id)
            .ok_or_else(|| AgentError::ConversationNotFound(raw_id.to_string()))?;

        let messages = transcript(&stored.turns);
        let agent = self
            .engine
            .resume(ConversationState::from_turns(stored.turns))
            .with_user(self.user_id.clone());
        self.active = Some(ActiveConversation { id, agent });

        info!(conversation_id = %id, user_id = %self.user_id, "Resumed conversation");
        self.send(ServerMessage::ConversationResumed {
            conversation_id: id,
            messages,
        });
        Ok(())
    }

    async fn message(&mut self, content: &str) -> Result<()> {
        let sink = self.stream_sink();
        let active = self.active.as_mut().ok_or_else(|| {
            AgentError::ProtocolError(
                "No active conversation. Send 'new_conversation' first.".to_string(),
            )
        })?;

        debug!(conversation_id = %active.id, "User message");
        let result = active.agent.send_message(content, &sink).await;
        self.finish_cycle(result).await;
        Ok(())
    }

    async fn resolve(&mut self, action_id: &str, approved: bool) -> Result<()> {
        let sink = self.stream_sink();
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| AgentError::ProtocolError("No active conversation".to_string()))?;

        // a stale or foreign id never reaches the loop
        match active.agent.pending() {
            Some(pending) if pending.action_id == action_id => {}
            _ => return Err(AgentError::ConfirmationNotFound(action_id.to_string())),
        }

        let result = active.agent.resolve(action_id, approved, &sink).await;
        self.finish_cycle(result).await;
        Ok(())
    }

    /// Report a cycle outcome to the client, then persist the conversation
    async fn finish_cycle(&mut self, result: Result<LoopOutput>) {
        match result {
            Ok(LoopOutput::Complete { text, usage }) => {
                self.send(ServerMessage::Text { content: text });
                self.send(ServerMessage::Complete {
                    token_usage: Some(usage),
                });
            }
            Ok(LoopOutput::ConfirmationNeeded { pending, text }) => {
                self.send(ServerMessage::ConfirmRequest {
                    action_id: pending.action_id,
                    tool: pending.tool_name,
                    summary: pending.summary,
                    content: text,
                });
            }
            Err(e) => self.send_error(&e),
        }

        self.persist().await;
    }

    async fn persist(&self) {
        let Some(active) = &self.active else {
            return;
        };

        if let Err(e) = self.store.save(active.id, active.agent.state().turns()).await {
            warn!(conversation_id = %active.id, error = %e, "Failed to save conversation");
            self.send(ServerMessage::Error {
                content: format!("Conversation could not be saved: {}", e),
                recoverable: true,
            });
        }
    }

    fn stream_sink(&self) -> StreamSink {
        let outbound = self.outbound.clone();
        StreamSink::new(move |chunk| {
            let _ = outbound.send(ServerMessage::TextChunk {
                content: chunk.to_string(),
            });
        })
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!("Outbound channel closed; dropping server message");
        }
    }

    fn send_error(&self, error: &AgentError) {
        self.send(ServerMessage::Error {
            content: error.to_string(),
            recoverable: error.is_recoverable(),
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EngineConfig;
    use crate::llm::scripted::ScriptStep;
    use crate::llm::{ModelResponse, ScriptedModel};
    use crate::models::{ToolInput, ToolInvocation, ToolOutcome, ToolOutput, ToolResult};
    use crate::store::InMemoryConversationStore;
    use crate::tools::schema::{object_schema, string_property};
    use crate::tools::{FunctionTool, ToolDescriptor, ToolRegistry};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct Harness {
        session: Session,
        rx: UnboundedReceiver<ServerMessage>,
        store: Arc<InMemoryConversationStore>,
        sends: Arc<AtomicUsize>,
    }

    fn send_money_registry(sends: &Arc<AtomicUsize>) -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        let counter = Arc::clone(sends);
        registry
            .register(Arc::new(FunctionTool::new(
                ToolDescriptor::new(
                    "send_money",
                    "Send money",
                    object_schema(
                        vec![
                            ("amount", string_property("Amount")),
                            ("token", string_property("Token")),
                            ("recipient", string_property("Recipient")),
                        ],
                        &["amount", "token", "recipient"],
                    ),
                )
                .with_confirmation("Send {amount} {token} to @{recipient}"),
                move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(ToolOutput::ok(json!({"status": "sent"})))
                    }
                },
            )))
            .unwrap();
        registry
    }

    fn harness(responses: Vec<ModelResponse>) -> Harness {
        let sends = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(Engine::new(
            Arc::new(ScriptedModel::from_responses(responses)),
            send_money_registry(&sends),
            EngineConfig::default(),
        ));
        let store = Arc::new(InMemoryConversationStore::new());
        let (tx, rx) = unbounded_channel();
        let session = Session::new(
            engine,
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            "default-user",
            tx,
        );

        Harness {
            session,
            rx,
            store,
            sends,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn send_money_response() -> ModelResponse {
        ModelResponse::tool_calls(vec![ToolInvocation::with_id(
            "call_send",
            "send_money",
            json!({"amount": "50.00", "token": "usdc", "recipient": "alice"}),
        )])
        .with_text("Let me set that up.")
    }

    #[test]
    fn test_wire_format() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"confirm","actionId":"a-1"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Confirm {
                action_id: "a-1".into()
            }
        );

        let value = serde_json::to_value(ServerMessage::ConfirmRequest {
            action_id: "a-1".into(),
            tool: "send_money".into(),
            summary: "Send 50.00 usdc to @alice".into(),
            content: String::new(),
        })
        .unwrap();
        assert_eq!(value["type"], "confirm_request");
        assert_eq!(value["actionId"], "a-1");

        let complete = serde_json::to_value(ServerMessage::Complete { token_usage: None }).unwrap();
        assert_eq!(complete, json!({"type": "complete"}));
    }

    #[test]
    fn test_conversation_uuid_is_stable() {
        let id = Uuid::new_v4();
        assert_eq!(conversation_uuid(&id.to_string()), id);
        assert_eq!(conversation_uuid("chat-42"), conversation_uuid("chat-42"));
        assert_ne!(conversation_uuid("chat-42"), conversation_uuid("chat-43"));
    }

    #[tokio::test]
    async fn test_send_money_scenario() {
        let mut h = harness(vec![
            send_money_response(),
            ModelResponse::text("Sent 50.00 USDC to @alice.").with_usage(40, 12),
        ]);

        h.session.handle(ClientMessage::NewConversation).await;
        let conversation_id = match drain(&mut h.rx).as_slice() {
            [ServerMessage::ConversationStarted { conversation_id }] => *conversation_id,
            other => panic!("unexpected messages: {:?}", other),
        };

        h.session
            .handle_text(r#"{"type":"message","content":"send 50 usdc to @alice"}"#)
            .await;

        let messages = drain(&mut h.rx);
        let action_id = match messages.last() {
            Some(ServerMessage::ConfirmRequest {
                action_id,
                tool,
                summary,
                content,
            }) => {
                assert_eq!(tool, "send_money");
                assert_eq!(summary, "Send 50.00 usdc to @alice");
                assert_eq!(content, "Let me set that up.");
                action_id.clone()
            }
            other => panic!("expected confirm_request, got {:?}", other),
        };
        assert_eq!(h.sends.load(Ordering::SeqCst), 0);

        h.session
            .handle(ClientMessage::Confirm {
                action_id: action_id.clone(),
            })
            .await;

        let messages = drain(&mut h.rx);
        let chunks: String = messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::TextChunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            &messages[messages.len() - 2..],
            &[
                ServerMessage::Text {
                    content: "Sent 50.00 USDC to @alice.".into()
                },
                ServerMessage::Complete {
                    token_usage: Some(TokenUsage {
                        input_tokens: 40,
                        output_tokens: 12
                    })
                },
            ]
        );
        assert_eq!(chunks, "Sent 50.00 USDC to @alice.");
        assert_eq!(h.sends.load(Ordering::SeqCst), 1);

        let stored = h.store.load(conversation_id).await.unwrap().unwrap();
        assert!(stored.turns.contains(&Turn::ToolResult(ToolResult::success(
            "call_send",
            json!({"status": "sent"})
        ))));
        assert_eq!(stored.meta.title, "send 50 usdc to @alice");

        // replaying the confirmation is refused without side effects
        h.session.handle(ClientMessage::Confirm { action_id }).await;
        match drain(&mut h.rx).as_slice() {
            [ServerMessage::Error { recoverable, .. }] => assert!(*recoverable),
            other => panic!("expected one error, got {:?}", other),
        }
        assert_eq!(h.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_cancel_is_ignored() {
        let mut h = harness(vec![send_money_response()]);
        h.session.handle(ClientMessage::NewConversation).await;
        h.session
            .handle(ClientMessage::Message {
                content: "send 50 to alice".into(),
            })
            .await;
        drain(&mut h.rx);

        h.session
            .handle(ClientMessage::Cancel {
                action_id: "not-the-pending-one".into(),
            })
            .await;

        assert!(matches!(
            drain(&mut h.rx).as_slice(),
            [ServerMessage::Error {
                recoverable: true,
                ..
            }]
        ));
        assert!(h.session.agent().unwrap().pending().is_some());
    }

    #[tokio::test]
    async fn test_close_with_pending_confirmation() {
        let mut h = harness(vec![send_money_response()]);
        h.session.handle(ClientMessage::NewConversation).await;
        h.session
            .handle(ClientMessage::Message {
                content: "send 50 to alice".into(),
            })
            .await;
        let conversation_id = h.session.conversation_id().unwrap();

        h.session.close();

        assert!(h.session.agent().is_none());
        assert_eq!(h.sends.load(Ordering::SeqCst), 0);

        // the saved conversation holds the invocation without a result
        let stored = h.store.load(conversation_id).await.unwrap().unwrap();
        assert!(!stored
            .turns
            .iter()
            .any(|t| matches!(t, Turn::ToolResult(_))));
    }

    #[tokio::test]
    async fn test_resume_closes_dangling_invocations() {
        let mut h = harness(vec![
            send_money_response(),
            ModelResponse::text("That transfer was interrupted; want me to retry?"),
        ]);
        h.session.handle(ClientMessage::NewConversation).await;
        h.session
            .handle(ClientMessage::Message {
                content: "send 50 to alice".into(),
            })
            .await;
        let conversation_id = h.session.conversation_id().unwrap();
        drain(&mut h.rx);

        h.session
            .handle(ClientMessage::ResumeConversation {
                conversation_id: conversation_id.to_string(),
            })
            .await;

        match drain(&mut h.rx).as_slice() {
            [ServerMessage::ConversationResumed { messages, .. }] => {
                assert_eq!(messages[0].role, "user");
                assert_eq!(messages[1].content, "Let me set that up.");
            }
            other => panic!("expected conversation_resumed, got {:?}", other),
        }

        let state = h.session.agent().unwrap().state();
        assert!(matches!(
            state.turns().last(),
            Some(Turn::ToolResult(ToolResult {
                outcome: ToolOutcome::Error(_),
                ..
            }))
        ));

        h.session
            .handle(ClientMessage::Message {
                content: "what happened?".into(),
            })
            .await;
        assert!(drain(&mut h.rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::Complete { .. })));
        assert_eq!(h.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sessions_do_not_wait_on_each_other() {
        let sends = Arc::new(AtomicUsize::new(0));
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptStep::Stall(Duration::from_secs(30), ModelResponse::text("slow answer")),
            ScriptStep::Respond(send_money_response()),
            ScriptStep::Respond(ModelResponse::text("You have 120 USDC.")),
        ]));
        let engine = Arc::new(Engine::new(
            Arc::clone(&model) as Arc<dyn crate::llm::ModelService>,
            send_money_registry(&sends),
            EngineConfig::default(),
        ));
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());

        let open = |user: &str| {
            let (tx, rx) = unbounded_channel();
            (
                Session::new(Arc::clone(&engine), Arc::clone(&store), user, tx),
                rx,
            )
        };
        let (mut slow, mut slow_rx) = open("carol");
        let (mut gated, mut gated_rx) = open("dave");
        let (mut quick, mut quick_rx) = open("erin");

        // carol's model call hangs
        slow.handle(ClientMessage::NewConversation).await;
        let slow_task = tokio::spawn(async move {
            slow.handle(ClientMessage::Message {
                content: "think hard".into(),
            })
            .await;
            slow
        });
        while model.call_count() == 0 {
            tokio::task::yield_now().await;
        }

        // dave ends up waiting on a confirmation
        let limit = Duration::from_secs(5);
        gated.handle(ClientMessage::NewConversation).await;
        tokio::time::timeout(
            limit,
            gated.handle(ClientMessage::Message {
                content: "send 50 to alice".into(),
            }),
        )
        .await
        .unwrap();
        assert!(matches!(
            drain(&mut gated_rx).last(),
            Some(ServerMessage::ConfirmRequest { .. })
        ));

        // erin is served while both of them wait
        quick.handle(ClientMessage::NewConversation).await;
        tokio::time::timeout(
            limit,
            quick.handle(ClientMessage::Message {
                content: "balance?".into(),
            }),
        )
        .await
        .unwrap();
        assert!(matches!(
            drain(&mut quick_rx).last(),
            Some(ServerMessage::Complete { .. })
        ));

        assert!(!slow_task.is_finished());
        assert!(matches!(
            drain(&mut slow_rx).as_slice(),
            [ServerMessage::ConversationStarted { .. }]
        ));
        assert!(gated.agent().unwrap().pending().is_some());
        assert_eq!(sends.load(Ordering::SeqCst), 0);

        slow_task.abort();
    }

    #[tokio::test]
    async fn test_tools_run_for_the_session_user() {
        let registry = Arc::new(ToolRegistry::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let captured = Arc::clone(&seen);
        registry
            .register(Arc::new(FunctionTool::new(
                ToolDescriptor::new("get_balance", "Balance", object_schema(vec![], &[])),
                move |input: ToolInput| {
                    captured.lock().unwrap().push(input.user_id);
                    async { Ok(ToolOutput::ok(json!({"usdc": "120.00"}))) }
                },
            )))
            .unwrap();
        let engine = Arc::new(Engine::new(
            Arc::new(ScriptedModel::from_responses(vec![
                ModelResponse::tool_calls(vec![ToolInvocation::new("get_balance", json!({}))]),
                ModelResponse::text("You have 120 USDC."),
                ModelResponse::tool_calls(vec![ToolInvocation::new("get_balance", json!({}))]),
                ModelResponse::text("Still 120 USDC."),
            ])),
            registry,
            EngineConfig::default(),
        ));
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
        let (tx, _rx) = unbounded_channel();
        let mut session = Session::new(engine, store, "alice", tx);

        session.handle(ClientMessage::NewConversation).await;
        session
            .handle(ClientMessage::Message {
                content: "balance?".into(),
            })
            .await;
        let conversation_id = session.conversation_id().unwrap();

        // a resumed conversation keeps acting for the same user
        session
            .handle(ClientMessage::ResumeConversation {
                conversation_id: conversation_id.to_string(),
            })
            .await;
        session
            .handle(ClientMessage::Message {
                content: "and now?".into(),
            })
            .await;

        assert_eq!(*seen.lock().unwrap(), vec!["alice", "alice"]);
    }

    #[tokio::test]
    async fn test_protocol_errors_keep_session_alive() {
        let mut h = harness(vec![ModelResponse::text("hi")]);

        h.session.handle_text("not json").await;
        h.session
            .handle(ClientMessage::Message {
                content: "hello".into(),
            })
            .await;
        h.session
            .handle(ClientMessage::ResumeConversation {
                conversation_id: "missing".into(),
            })
            .await;

        let messages = drain(&mut h.rx);
        assert_eq!(messages.len(), 3);
        assert!(messages
            .iter()
            .all(|m| matches!(m, ServerMessage::Error { recoverable: true, .. })));

        h.session.handle(ClientMessage::NewConversation).await;
        h.session
            .handle(ClientMessage::Message {
                content: "hello".into(),
            })
            .await;
        assert!(drain(&mut h.rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::Text { content } if content == "hi")));
    }
}
