//! Scripted end-to-end run of the send-money flow.
//!
//! No network: the model is scripted and the wallet lives in memory. Prints
//! every server message the way a client would receive it.

use financial_agent_runtime::{
    agent::{Engine, EngineConfig},
    llm::{ModelResponse, ScriptedModel},
    models::{ToolInput, ToolInvocation, ToolOutput},
    session::{ClientMessage, ServerMessage, Session},
    store::InMemoryConversationStore,
    tools::{wallet::wallet_tool_definitions, FunctionTool, ToolRegistry},
    AgentError,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::info;
use tracing_subscriber::EnvFilter;

type Balances = Arc<Mutex<HashMap<String, f64>>>;

fn demo_wallet(balances: Balances) -> Result<Arc<ToolRegistry>, AgentError> {
    let registry = Arc::new(ToolRegistry::new());

    for descriptor in wallet_tool_definitions() {
        let balances = Arc::clone(&balances);
        let name = descriptor.name.clone();
        let tool = FunctionTool::new(descriptor, move |input: ToolInput| {
            let balances = Arc::clone(&balances);
            let name = name.clone();
            async move { run_wallet_tool(&name, &input, &balances) }
        });
        registry.register(Arc::new(tool))?;
    }

    Ok(registry)
}

fn run_wallet_tool(
    name: &str,
    input: &ToolInput,
    balances: &Balances,
) -> Result<ToolOutput, AgentError> {
    let mut balances = balances.lock().unwrap_or_else(PoisonError::into_inner);

    match name {
        "get_balance" => Ok(ToolOutput::ok(json!(*balances))),
        "send_money" => {
            let token = input.parameters["token"].as_str().unwrap_or("usdc").to_lowercase();
            let amount: f64 = input.parameters["amount"]
                .as_str()
                .and_then(|a| a.parse().ok())
                .ok_or_else(|| {
                    AgentError::InvalidToolInput("amount must be a decimal string".into())
                })?;

            let balance = balances.entry(token.clone()).or_insert(0.0);
            if *balance < amount {
                return Ok(ToolOutput::failed(format!("insufficient {} balance", token)));
            }
            *balance -= amount;

            Ok(ToolOutput::ok(json!({
                "status": "sent",
                "amount": input.parameters["amount"],
                "token": token,
                "recipient": input.parameters["recipient"],
            })))
        }
        other => Ok(ToolOutput::failed(format!("{} is not available in the demo", other))),
    }
}

fn print_outbound(rx: &mut UnboundedReceiver<ServerMessage>) {
    while let Ok(message) = rx.try_recv() {
        match serde_json::to_string(&message) {
            Ok(line) => println!("<- {}", line),
            Err(e) => eprintln!("failed to encode message: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    info!("Financial Agent Runtime - scripted demo");

    let balances: Balances = Arc::new(Mutex::new(HashMap::from([("usdc".to_string(), 120.0)])));
    let registry = demo_wallet(Arc::clone(&balances))?;

    let model = Arc::new(ScriptedModel::from_responses(vec![
        ModelResponse::tool_calls(vec![ToolInvocation::new("get_balance", json!({}))])
            .with_text("Let me check your balance first. ")
            .with_usage(180, 24),
        ModelResponse::tool_calls(vec![ToolInvocation::new(
            "send_money",
            json!({"amount": "50.00", "token": "usdc", "recipient": "alice"}),
        )])
        .with_text("You have enough USDC. Preparing the transfer.")
        .with_usage(260, 31),
        ModelResponse::text("Done! Sent 50.00 USDC to @alice. Your new balance is 70.00 USDC.")
            .with_usage(320, 22),
    ]));

    let engine = Arc::new(Engine::new(model, registry, EngineConfig::default()));
    let store = Arc::new(InMemoryConversationStore::new());
    let (tx, mut rx) = unbounded_channel();
    let mut session = Session::new(engine, store, "default-user", tx);

    let script = [
        ClientMessage::NewConversation,
        ClientMessage::Message {
            content: "Send 50 usdc to @alice".to_string(),
        },
    ];

    for message in script {
        println!("-> {}", serde_json::to_string(&message)?);
        session.handle(message).await;
        print_outbound(&mut rx);
    }

    let action_id = session
        .agent()
        .and_then(|agent| agent.pending())
        .map(|pending| pending.action_id.clone())
        .ok_or("expected a pending confirmation")?;

    let confirm = ClientMessage::Confirm { action_id };
    println!("-> {}", serde_json::to_string(&confirm)?);
    session.handle(confirm).await;
    print_outbound(&mut rx);

    session.close();

    let remaining = balances
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get("usdc")
        .copied()
        .unwrap_or_default();
    info!(usdc = remaining, "Demo finished");

    Ok(())
}
