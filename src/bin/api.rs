use std::sync::Arc;

use financial_pipeline_orchestrator::{
    api::start_server,
    config::EngineConfig,
    event_log::EventLog,
    gemini::GeminiClient,
    llm::{LlmClient, MockLlm},
    orchestrator::Orchestrator,
    reliability::{CheckpointStore, CircuitBreakerRegistry},
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = EngineConfig::from_env();

    let llm: Arc<dyn LlmClient> = match std::env::var("GEMINI_API_KEY") {
        Ok(api_key) if !api_key.is_empty() => Arc::new(GeminiClient::new(api_key)?),
        _ => {
            eprintln!("GEMINI_API_KEY not set; using the deterministic mock LLM");
            Arc::new(MockLlm::new())
        }
    };

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Financial Pipeline Orchestrator - API Server");
    info!("Port: {}", api_port);

    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        llm,
        Arc::new(CircuitBreakerRegistry::new(config.breaker)),
        Arc::new(CheckpointStore::from_database_url(config.database_url.as_deref())),
        Arc::new(EventLog::from_database_url(config.database_url.as_deref())),
    ));

    info!("Orchestrator initialized");

    start_server(orchestrator, api_port).await?;

    Ok(())
}
