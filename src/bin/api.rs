use financial_qa_pipeline::{
    agent::{Components, Pipeline},
    api::{serving_config, start_server},
    config::PipelineConfig,
    output::TaskOutcome,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = serving_config(PipelineConfig::from_env()?);
    info!(port = config.port, model = %config.model.model, "Financial QA pipeline API");

    let components = Components::from_config(&config).await?;
    let pipeline = Arc::new(Pipeline::start(&config, components).await);

    // Outcomes are only logged here; contexts stay queryable in the store.
    let drain = pipeline.clone();
    tokio::spawn(async move {
        while let Some(outcome) = drain.next_outcome().await {
            match outcome {
                TaskOutcome::Completed(context) => {
                    info!(task_id = %context.task_id, "Task completed")
                }
                TaskOutcome::Failed { task_id, error } => {
                    warn!(task_id = %task_id, error = %error, "Task failed")
                }
            }
        }
    });

    start_server(pipeline, config.port).await?;
    Ok(())
}
