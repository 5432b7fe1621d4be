//! Execution stage
//!
//! Turns the formula and extracted values into code, runs it on both
//! backends and retries with the observed error a bounded number of times.

use crate::bus::{
    ExecuteTask, Message, MessageBus, MessageContext, MessageHandler, MessageKind, ReviewExecute,
    Topic,
};
use crate::llm::{ChatMessage, ModelClient};
use crate::models::{ExecuteResult, StageResult, TaskId, PENDING_REVIEW};
use crate::parsing::extract_code_block;
use crate::prompts;
use crate::sandbox::CodeRunner;
use crate::state::ContextStore;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Substrings that mark a backend's output as failed. `Error` subsumes the
/// specific names; they are listed so logs can name the first match.
pub const ERROR_MARKERS: &[&str] = &[
    "Traceback",
    "NameError",
    "SyntaxError",
    "TypeError",
    "ValueError",
    "IndexError",
    "KeyError",
    "AttributeError",
    "Error",
];

pub fn first_error_marker(output: &str) -> Option<&'static str> {
    ERROR_MARKERS.iter().copied().find(|marker| output.contains(marker))
}

pub fn is_erroneous(output: &str) -> bool {
    first_error_marker(output).is_some()
}

pub struct ExecutionStage {
    bus: MessageBus,
    store: Arc<dyn ContextStore>,
    model: Arc<dyn ModelClient>,
    sandbox: Arc<dyn CodeRunner>,
    inline: Arc<dyn CodeRunner>,
    max_attempts: u32,
}

impl ExecutionStage {
    pub fn new(
        bus: MessageBus,
        store: Arc<dyn ContextStore>,
        model: Arc<dyn ModelClient>,
        sandbox: Arc<dyn CodeRunner>,
        inline: Arc<dyn CodeRunner>,
        max_attempts: u32,
    ) -> Self {
        Self {
            bus,
            store,
            model,
            sandbox,
            inline,
            max_attempts: max_attempts.max(1),
        }
    }

    async fn execute(&self, task_id: TaskId, ctx: &MessageContext) -> Result<()> {
        let context = self.store.get(task_id).await?;
        let reason = context.require_reason()?;
        let extract = context.require_extract()?;
        let question = &context.input.question;

        let original = match context.latest_execute() {
            None => prompts::execute_initial_prompt(question, reason, extract),
            Some(previous) => prompts::execute_refine_prompt(question, reason, extract, previous),
        };

        let system = ChatMessage::system(prompts::SYSTEM_EXECUTOR);
        let mut prompt = original.clone();
        let mut attempts = 0;
        let mut code = String::new();
        let mut output = String::new();

        while attempts < self.max_attempts {
            attempts += 1;

            let response = self
                .model
                .create(&[system.clone(), ChatMessage::user(prompt.clone())], &ctx.cancellation)
                .await?;
            code = extract_code_block(&response);

            let (sandbox_output, inline_output) =
                tokio::join!(self.sandbox.run(&code), self.inline.run(&code));

            output = format!(
                "[{}]\n{}\n[{}]\n{}",
                self.sandbox.name(),
                sandbox_output.trim_end(),
                self.inline.name(),
                inline_output.trim_end()
            );

            let errors: Vec<&str> = [sandbox_output.as_str(), inline_output.as_str()]
                .into_iter()
                .filter(|out| is_erroneous(out))
                .collect();

            if errors.is_empty() {
                debug!(task_id = %task_id, attempt = attempts, "Code ran cleanly");
                break;
            }

            warn!(
                task_id = %task_id,
                attempt = attempts,
                max_attempts = self.max_attempts,
                marker = first_error_marker(&output).unwrap_or_default(),
                "Generated code failed"
            );
            prompt = prompts::execution_error_prompt(&errors.join("\n"), &original);
        }

        info!(task_id = %task_id, attempts, "Execution finished");

        self.store
            .append(
                task_id,
                StageResult::Execute(ExecuteResult {
                    code,
                    output,
                    review: PENDING_REVIEW.to_string(),
                    attempts,
                    created_at: Utc::now(),
                }),
            )
            .await?;

        self.bus
            .publish(Topic::Verify, Message::ReviewExecute(ReviewExecute { task_id }))
            .await
    }
}

#[async_trait]
impl MessageHandler for ExecutionStage {
    fn name(&self) -> &'static str {
        "executor"
    }

    fn accepts(&self) -> &'static [MessageKind] {
        &[MessageKind::Execute]
    }

    async fn handle(&self, message: Message, ctx: MessageContext) -> Result<()> {
        match message {
            Message::Execute(ExecuteTask { task_id }) => self.execute(task_id, &ctx).await,
            other => {
                warn!(kind = ?other.kind(), "Executor ignored message");
                Ok(())
            }
        }
    }
}
