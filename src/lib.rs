//! Financial Agent Runtime
//!
//! A conversational agent runtime that:
//! - Drives multi-turn exchanges between a user and a language model
//! - Lets the model invoke named financial tools through one registry
//! - Gates money-moving tools behind explicit user confirmation
//! - Delegates sub-tasks to bounded, capability-restricted sub-agents
//! - Streams replies to clients over a WebSocket session protocol
//!
//! AGENT LOOP:
//! USER MESSAGE → MODEL → DISPATCH TOOLS → CONFIRM? → MODEL → ... → TEXT

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod session;
pub mod store;
pub mod subagent;
pub mod tools;

pub use error::{AgentError, Result};

// Re-export common types
pub use agent::{AgentLoop, Engine, EngineConfig, LoopOutput, LoopStatus};
pub use models::*;
pub use tools::{Tool, ToolDescriptor, ToolRegistry};
