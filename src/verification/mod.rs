//! Verification stage
//!
//! One actor, three contracts:
//! - `ReviewExecute`: review the latest code and either approve it, bounce
//!   it back to execution, or give up once the turn limit is reached.
//! - `ScoreAction`: score a candidate reasoning action for the search.
//! - `VerifyTask`: a final structured critique of every stage.

use crate::bus::{
    ActionScored, ExecuteTask, Message, MessageBus, MessageContext, MessageHandler, MessageKind,
    OutputTask, ScoreAction, Topic,
};
use crate::llm::{ChatMessage, ModelClient};
use crate::models::{StageResult, TaskId, Verdict, VerifyResult};
use crate::parsing::{parse_approval, parse_critique};
use crate::prompts;
use crate::retrieval::FormulaStore;
use crate::state::ContextStore;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where the review loop sends a task next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReviewDecision {
    Approve,
    GiveUp,
    Retry { turn: u32 },
}

pub struct VerificationStage {
    bus: MessageBus,
    store: Arc<dyn ContextStore>,
    model: Arc<dyn ModelClient>,
    formulas: Arc<dyn FormulaStore>,
    related_formulas: usize,
    max_turns: u32,
    turns: Mutex<HashMap<TaskId, u32>>,
}

impl VerificationStage {
    pub fn new(
        bus: MessageBus,
        store: Arc<dyn ContextStore>,
        model: Arc<dyn ModelClient>,
        formulas: Arc<dyn FormulaStore>,
        related_formulas: usize,
        max_turns: u32,
    ) -> Self {
        Self {
            bus,
            store,
            model,
            formulas,
            related_formulas,
            max_turns,
            turns: Mutex::new(HashMap::new()),
        }
    }

    /// Review turns already spent on a task in the current loop.
    pub async fn turns(&self, task_id: TaskId) -> u32 {
        self.turns.lock().await.get(&task_id).copied().unwrap_or(0)
    }

    async fn decide(&self, task_id: TaskId, approved: bool) -> ReviewDecision {
        let mut turns = self.turns.lock().await;
        let turn = turns.get(&task_id).copied().unwrap_or(0);

        if approved {
            turns.remove(&task_id);
            ReviewDecision::Approve
        } else if turn >= self.max_turns {
            turns.remove(&task_id);
            ReviewDecision::GiveUp
        } else {
            turns.insert(task_id, turn + 1);
            ReviewDecision::Retry { turn: turn + 1 }
        }
    }

    async fn review_execution(&self, task_id: TaskId, ctx: &MessageContext) -> Result<()> {
        let context = self.store.get(task_id).await?;
        let execute = context.require_execute()?;

        let prompt = prompts::review_code_prompt(&context.input.question, execute);
        let review = self
            .model
            .create(
                &[
                    ChatMessage::system(prompts::SYSTEM_CODE_REVIEWER),
                    ChatMessage::user(prompt),
                ],
                &ctx.cancellation,
            )
            .await?;

        let approved = match parse_approval(&review) {
            Some(approved) => approved,
            None => {
                warn!(task_id = %task_id, "Review carried no approval field, treating as rejected");
                false
            }
        };

        let comment = review.trim().to_string();
        self.store
            .update(
                task_id,
                Box::new({
                    let comment = comment.clone();
                    move |ctx| ctx.record_execute_review(comment)
                }),
            )
            .await?;

        match self.decide(task_id, approved).await {
            ReviewDecision::Approve => {
                info!(task_id = %task_id, "Code approved");
                self.finish(task_id, comment, true, Verdict::Approved).await
            }
            ReviewDecision::GiveUp => {
                warn!(task_id = %task_id, max_turns = self.max_turns, "Review turn limit reached");
                self.finish(task_id, comment, false, Verdict::TurnLimitReached)
                    .await
            }
            ReviewDecision::Retry { turn } => {
                debug!(task_id = %task_id, turn, "Code rejected, requesting another attempt");
                self.bus
                    .publish(Topic::Execute, Message::Execute(ExecuteTask { task_id }))
                    .await
            }
        }
    }

    async fn finish(
        &self,
        task_id: TaskId,
        executor_comment: String,
        approved: bool,
        verdict: Verdict,
    ) -> Result<()> {
        self.store
            .append(
                task_id,
                StageResult::Verify(VerifyResult {
                    reasoner_comment: String::new(),
                    extractor_comment: String::new(),
                    executor_comment,
                    approved,
                    verdict,
                    created_at: Utc::now(),
                }),
            )
            .await?;

        self.bus
            .publish(Topic::Output, Message::Output(OutputTask { task_id }))
            .await
    }

    async fn score_action(&self, request: ScoreAction, ctx: &MessageContext) -> Result<()> {
        let query = format!("{} {}", request.action, request.question);
        let formulas = self.formulas.related(&query, self.related_formulas);

        let prompt = prompts::score_action_prompt(
            &request.question,
            &request.action,
            &request.instruction,
            &formulas,
        );
        let raw = self
            .model
            .create(
                &[
                    ChatMessage::system(prompts::SYSTEM_ACTION_SCORER),
                    ChatMessage::user(prompt),
                ],
                &ctx.cancellation,
            )
            .await?;

        debug!(
            task_id = %request.task_id,
            correlation_id = %request.correlation_id,
            action = %request.action,
            formulas = formulas.len(),
            "Action scored"
        );

        self.bus
            .publish(
                Topic::Reason,
                Message::ActionScored(ActionScored {
                    correlation_id: request.correlation_id,
                    raw,
                }),
            )
            .await
    }

    async fn final_review(&self, task_id: TaskId, ctx: &MessageContext) -> Result<()> {
        let context = self.store.get(task_id).await?;
        let prompt = prompts::final_review_prompt(
            &context.input,
            context.require_reason()?,
            context.require_extract()?,
            context.require_execute()?,
        );

        let response = self
            .model
            .create(
                &[ChatMessage::system(prompts::SYSTEM_VERIFIER), ChatMessage::user(prompt)],
                &ctx.cancellation,
            )
            .await?;
        let critique = parse_critique(&response);

        info!(task_id = %task_id, approved = critique.approved, "Final review recorded");

        self.store
            .append(
                task_id,
                StageResult::Verify(VerifyResult {
                    reasoner_comment: critique.reasoner_comment,
                    extractor_comment: critique.extractor_comment,
                    executor_comment: critique.executor_comment,
                    approved: critique.approved,
                    verdict: Verdict::FinalReview,
                    created_at: Utc::now(),
                }),
            )
            .await?;

        self.bus
            .publish(Topic::Output, Message::Output(OutputTask { task_id }))
            .await
    }
}

#[async_trait]
impl MessageHandler for VerificationStage {
    fn name(&self) -> &'static str {
        "verifier"
    }

    fn accepts(&self) -> &'static [MessageKind] {
        &[
            MessageKind::Verify,
            MessageKind::ScoreAction,
            MessageKind::ReviewExecute,
        ]
    }

    async fn handle(&self, message: Message, ctx: MessageContext) -> Result<()> {
        match message {
            Message::ReviewExecute(review) => self.review_execution(review.task_id, &ctx).await,
            Message::ScoreAction(request) => self.score_action(request, &ctx).await,
            Message::Verify(task) => self.final_review(task.task_id, &ctx).await,
            other => {
                warn!(kind = ?other.kind(), "Verifier ignored message");
                Ok(())
            }
        }
    }
}
