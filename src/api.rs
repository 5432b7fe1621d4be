//! REST API for the financial QA pipeline
//!
//! Accepts task submissions and serves task context snapshots.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::Pipeline;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{TaskId, TaskInput};

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmittedTask {
    pub task_id: TaskId,
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<Pipeline>,
}

/// =============================
/// Handlers
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn submit_task(
    State(state): State<ApiState>,
    Json(input): Json<TaskInput>,
) -> (StatusCode, Json<ApiResponse>) {
    if input.question.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("question must not be empty".into())),
        );
    }

    match state.pipeline.submit(input).await {
        Ok(task_id) => {
            info!(task_id = %task_id, "Task accepted");
            (
                StatusCode::ACCEPTED,
                Json(ApiResponse::success(SubmittedTask { task_id })),
            )
        }
        Err(e) => {
            warn!(error = %e, "Task submission failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse::error(format!("Submission failed: {}", e))),
            )
        }
    }
}

async fn get_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let task_id = match TaskId::parse(&task_id) {
        Ok(id) => id,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(format!("Invalid task id: {}", e))),
            )
        }
    };

    match state.pipeline.store().get(task_id).await {
        Ok(context) => (StatusCode::OK, Json(ApiResponse::success(context))),
        Err(e @ PipelineError::TaskNotFound(_)) => {
            (StatusCode::NOT_FOUND, Json(ApiResponse::error(e.to_string())))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

async fn review_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let task_id = match TaskId::parse(&task_id) {
        Ok(id) => id,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(format!("Invalid task id: {}", e))),
            )
        }
    };

    match state.pipeline.request_final_review(task_id).await {
        Ok(()) => {
            info!(task_id = %task_id, "Final review requested");
            (
                StatusCode::ACCEPTED,
                Json(ApiResponse::success(SubmittedTask { task_id })),
            )
        }
        Err(e @ PipelineError::TaskNotFound(_)) => {
            (StatusCode::NOT_FOUND, Json(ApiResponse::error(e.to_string())))
        }
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Final review request failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse::error(format!("Review request failed: {}", e))),
            )
        }
    }
}

/// =============================
/// Router
/// =============================

/// Configuration for serving: finished contexts stay in the store so they can
/// be fetched and reviewed after their outcome.
pub fn serving_config(mut config: PipelineConfig) -> PipelineConfig {
    if config.output.evict_on_output {
        info!("Context eviction disabled while serving");
    }
    config.output.evict_on_output = false;
    config
}

pub fn create_router(pipeline: Arc<Pipeline>) -> Router {
    let state = ApiState { pipeline };

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/:task_id", get(get_task))
        .route("/api/tasks/:task_id/review", post(review_task))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    pipeline: Arc<Pipeline>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(pipeline);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Components;
    use crate::config::PipelineConfig;
    use crate::llm::ScriptedModelClient;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn router() -> (Router, Arc<Pipeline>) {
        let mut config = serving_config(PipelineConfig::default());
        // No rollouts: submitted tasks stop after registration.
        config.search.num_rollouts = 0;
        config.output.report_path = None;

        let model = Arc::new(ScriptedModelClient::new(|_| Ok(String::new())));
        let pipeline = Arc::new(
            Pipeline::start(&config, Components::with_model(model, &config)).await,
        );
        (create_router(pipeline.clone()), pipeline)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = router().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_submit_then_fetch_task() {
        let (app, _pipeline) = router().await;

        let request = Request::post("/api/tasks")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"task": "finqa", "question": "What is the ratio?", "context": "a is 1"}"#,
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::get(format!("/api/tasks/{}", task_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["input"]["question"], "What is the ratio?");
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_task_ids() {
        let (app, _) = router().await;

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/tasks/{}", TaskId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["success"], false);

        let response = app
            .oneshot(Request::get("/api/tasks/not-a-uuid").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_serving_keeps_contexts() {
        let config = serving_config(PipelineConfig::default());
        assert!(!config.output.evict_on_output);
    }

    #[tokio::test]
    async fn test_review_route() {
        let (app, pipeline) = router().await;
        let task_id = pipeline
            .submit(TaskInput {
                task: "finqa".into(),
                question: "What is the ratio?".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::post(format!("/api/tasks/{}/review", task_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["data"]["task_id"], task_id.to_string());

        let response = app
            .oneshot(
                Request::post(format!("/api/tasks/{}/review", TaskId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let (app, _) = router().await;
        let request = Request::post("/api/tasks")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"task": "finqa", "question": " ", "context": ""}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
