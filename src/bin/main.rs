use financial_qa_pipeline::{
    agent::{Components, Pipeline},
    config::PipelineConfig,
    eval::{evaluate_context, Accuracy},
    models::{TaskId, TaskInput},
    output::TaskOutcome,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn sample_task() -> TaskInput {
    TaskInput {
        task: "sample".to_string(),
        question: "What was the percentage change in revenue from 2019 to 2020?".to_string(),
        context: "Total revenue was $120.0 million in 2019.\n\n\
                  | Year | Revenue |\n| 2019 | 120.0 |\n| 2020 | 150.0 |\n\n\
                  Total revenue increased to $150.0 million in 2020."
            .to_string(),
        answer: Some("25.0".to_string()),
        program: None,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = PipelineConfig::from_env()?;

    // Usage: pipeline [--final-review] [tasks.json]
    let mut final_review = false;
    let mut task_file = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--final-review" => final_review = true,
            _ => task_file = Some(arg),
        }
    }
    if final_review {
        // The review reads each context after its first outcome.
        config.output.evict_on_output = false;
    }

    let inputs = match task_file {
        Some(path) => {
            let raw = tokio::fs::read_to_string(&path).await?;
            let inputs: Vec<TaskInput> = serde_json::from_str(&raw)?;
            info!(path = %path, tasks = inputs.len(), "Loaded tasks");
            inputs
        }
        None => {
            info!("No task file given, running the sample task");
            vec![sample_task()]
        }
    };

    let components = Components::from_config(&config).await?;
    let pipeline = Pipeline::start(&config, components).await;

    let outcomes = pipeline.run_batch(inputs).await?;

    let tolerance = config.output.eval_tolerance;
    let mut completed: Vec<TaskId> = Vec::new();
    let mut accuracy = Accuracy::default();
    for outcome in &outcomes {
        match outcome {
            TaskOutcome::Completed(context) => {
                completed.push(context.task_id);
                let verdict = context.latest_verify();
                let evaluation = evaluate_context(context, tolerance);
                if let Some(evaluation) = &evaluation {
                    accuracy.record(evaluation);
                }
                info!(
                    task_id = %context.task_id,
                    approved = verdict.map(|v| v.approved).unwrap_or(false),
                    verdict = ?verdict.map(|v| v.verdict),
                    correct = ?evaluation.map(|e| e.correct),
                    "Task completed"
                );
                if let Some(execute) = context.latest_execute() {
                    println!("\n=== {} ===\n{}\n{}", context.task_id, context.input.question, execute.output);
                }
            }
            TaskOutcome::Failed { task_id, error } => {
                error!(task_id = %task_id, error = %error, "Task failed");
            }
        }
    }

    info!(
        completed = completed.len(),
        failed = outcomes.len() - completed.len(),
        correct = accuracy.correct,
        evaluated = accuracy.evaluated,
        "Batch finished"
    );
    println!(
        "\nAccuracy: {}/{} ({:.2}%)",
        accuracy.correct,
        accuracy.evaluated,
        accuracy.rate()
    );

    if final_review && !completed.is_empty() {
        info!(tasks = completed.len(), "Requesting final reviews");
        for outcome in pipeline.review_batch(&completed).await? {
            match outcome {
                TaskOutcome::Completed(context) => {
                    if let Some(review) = context.latest_verify() {
                        println!("\n=== review {} ===\n{}", context.task_id, review.summary());
                    }
                }
                TaskOutcome::Failed { task_id, error } => {
                    error!(task_id = %task_id, error = %error, "Final review failed");
                }
            }
        }
    }

    pipeline.shutdown().await;
    Ok(())
}
