use std::sync::Arc;

use financial_pipeline_orchestrator::{
    config::EngineConfig,
    event_log::EventLog,
    llm::MockLlm,
    orchestrator::Orchestrator,
    reliability::{CheckpointStore, CircuitBreakerRegistry},
};
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    dotenv::dotenv().ok();

    info!("Financial Pipeline Orchestrator starting");

    let config = EngineConfig::from_env();
    let orchestrator = Orchestrator::new(
        &config,
        Arc::new(MockLlm::new()),
        Arc::new(CircuitBreakerRegistry::new(config.breaker)),
        Arc::new(CheckpointStore::from_database_url(config.database_url.as_deref())),
        Arc::new(EventLog::from_database_url(config.database_url.as_deref())),
    );

    let user_id = Uuid::new_v4();
    let input = serde_json::json!({
        "transactions": [
            {"transaction_id": "t1", "date": "2025-06-01", "description": "ACME payroll", "amount": 5200.0},
            {"transaction_id": "t2", "date": "2025-06-02", "description": "Monthly rent", "amount": -1600.0},
            {"transaction_id": "t3", "date": "2025-06-04", "description": "Grocery store", "amount": -840.0},
            {"transaction_id": "t4", "date": "2025-06-07", "description": "Gas station fill-up", "amount": -620.0},
            {"transaction_id": "t5", "date": "2025-06-11", "description": "Electric bill", "amount": -480.0},
            {"transaction_id": "t6", "date": "2025-06-15", "description": "Restaurant dinner", "amount": -310.0},
        ]
    });

    let session_id = orchestrator.start_session(user_id, input).await?;
    info!(session_id = %session_id, "Running pipeline");

    match orchestrator.run(session_id).await {
        Ok(result) => {
            println!("\n=== PIPELINE RESULT ===");
            println!("Session:     {}", result.session_id);
            println!("Final state: {}", result.final_state);
            println!("Iterations:  {}", result.iterations);

            if let Some(text) = result.final_report.get("report_text").and_then(|v| v.as_str()) {
                println!("\n{}", text);
            }

            println!("\n=== EVENT LOG ===");
            for (i, entry) in orchestrator
                .event_log()
                .replay(session_id)
                .await?
                .iter()
                .enumerate()
            {
                println!(
                    "  {:>2}. [{}] {} error={}",
                    i + 1,
                    entry.state,
                    entry.agent,
                    entry.error
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Pipeline failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
