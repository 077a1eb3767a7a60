use financial_agent_runtime::{
    agent::Engine,
    api::{start_server, ApiState},
    config::RuntimeConfig,
    llm::{GeminiModel, ModelResponse, ModelService, ScriptedModel},
    store::build_store,
    subagent::presets::Orchestrator,
    tools::{wallet::wallet_tools, HttpToolExecutor, ToolExecutor, ToolRegistry},
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RuntimeConfig::from_env()?;

    info!("Financial Agent Runtime - API Server");
    info!(port = config.port, model = %config.gemini_model, "Configuration loaded");

    let model: Arc<dyn ModelService> = match &config.gemini_api_key {
        Some(key) => Arc::new(GeminiModel::new(
            key.clone(),
            config.gemini_model.clone(),
            config.engine.model_timeout,
        )?),
        None => {
            warn!("GEMINI_API_KEY not set; every reply will explain how to configure it");
            Arc::new(ScriptedModel::repeating(ModelResponse::text(
                "The language model is not configured. Set GEMINI_API_KEY in your .env file and restart the server.",
            )))
        }
    };

    let registry = Arc::new(ToolRegistry::new());

    let engine_config = match config.tools_api.clone() {
        Some(tools_api) => {
            info!(base_url = %tools_api.base_url, "Registering wallet tools");
            let executor: Arc<dyn ToolExecutor> = Arc::new(HttpToolExecutor::new(tools_api)?);
            registry.register_all(wallet_tools(executor))?;

            // specialists share the model and registry, not the parent prompt
            let workers = Engine::new(
                Arc::clone(&model),
                Arc::clone(&registry),
                config.engine.clone(),
            );
            let orchestrator = Orchestrator::new(&workers)?;
            registry.register_all(orchestrator.worker_tools())?;
            info!(specialists = ?orchestrator.worker_names(), "Registered specialist sub-agents");

            orchestrator.engine_config(&config.engine)
        }
        None => {
            warn!("FINANCIAL_API_BASE_URL not set; starting without tools");
            config.engine.clone()
        }
    };

    let engine = Arc::new(Engine::new(model, Arc::clone(&registry), engine_config));

    let store = build_store(config.database_url.as_deref());

    info!(tools = registry.len(), store = store.backend(), "Runtime initialized");

    start_server(ApiState { engine, store }, config.port).await?;

    Ok(())
}
