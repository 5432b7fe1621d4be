//! Extraction stage
//!
//! Pulls the values of the reasoned-about variables out of the task's
//! supporting passage.

use crate::bus::{
    ExecuteTask, ExtractTask, Message, MessageBus, MessageContext, MessageHandler, MessageKind,
    ReviewExtract, Topic,
};
use crate::llm::{ChatMessage, ModelClient};
use crate::models::{ExtractResult, StageResult, TaskId, PENDING_REVIEW};
use crate::parsing::extract_variables;
use crate::prompts;
use crate::retrieval::ChunkRetriever;
use crate::state::ContextStore;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ExtractionStage {
    bus: MessageBus,
    store: Arc<dyn ContextStore>,
    model: Arc<dyn ModelClient>,
    retriever: Arc<dyn ChunkRetriever>,
    top_k: usize,
}

impl ExtractionStage {
    pub fn new(
        bus: MessageBus,
        store: Arc<dyn ContextStore>,
        model: Arc<dyn ModelClient>,
        retriever: Arc<dyn ChunkRetriever>,
        top_k: usize,
    ) -> Self {
        Self {
            bus,
            store,
            model,
            retriever,
            top_k,
        }
    }

    async fn extract(
        &self,
        task_id: TaskId,
        review: Option<String>,
        ctx: &MessageContext,
    ) -> Result<()> {
        let context = self.store.get(task_id).await?;
        let variables = extract_variables(&context.require_reason()?.variables);

        let query = format!("{} {}", context.input.question, variables);
        let chunks = self
            .retriever
            .top_chunks(&query, &context.input.context, self.top_k);

        let prompt = prompts::extract_prompt(
            &context.input.question,
            &variables,
            &chunks,
            review.as_deref(),
        );
        let response = self
            .model
            .create(
                &[
                    ChatMessage::system(prompts::SYSTEM_EXTRACTOR),
                    ChatMessage::user(prompt),
                ],
                &ctx.cancellation,
            )
            .await?;

        info!(
            task_id = %task_id,
            chunks = chunks.len(),
            reviewed = review.is_some(),
            "Variables extracted"
        );

        self.store
            .append(
                task_id,
                StageResult::Extract(ExtractResult {
                    extracted: format!("Variables: {}\nExtracted: {}", variables, response.trim()),
                    review: review.unwrap_or_else(|| PENDING_REVIEW.to_string()),
                    created_at: Utc::now(),
                }),
            )
            .await?;

        self.bus
            .publish(Topic::Execute, Message::Execute(ExecuteTask { task_id }))
            .await
    }
}

#[async_trait]
impl MessageHandler for ExtractionStage {
    fn name(&self) -> &'static str {
        "extractor"
    }

    fn accepts(&self) -> &'static [MessageKind] {
        &[MessageKind::Extract, MessageKind::ReviewExtract]
    }

    async fn handle(&self, message: Message, ctx: MessageContext) -> Result<()> {
        match message {
            Message::Extract(ExtractTask { task_id }) => self.extract(task_id, None, &ctx).await,
            Message::ReviewExtract(ReviewExtract { task_id, comment }) => {
                self.extract(task_id, Some(comment), &ctx).await
            }
            other => {
                warn!(kind = ?other.kind(), "Extractor ignored message");
                Ok(())
            }
        }
    }
}
