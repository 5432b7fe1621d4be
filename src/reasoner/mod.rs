//! Reasoning stage
//!
//! Searches for an ordering of the reasoning actions, runs the chosen actions
//! against the model and hands the aggregated reasoning to extraction.
//! The same stage receives the verifier's action scores and completes the
//! rollouts waiting on them.

pub mod actions;
pub mod bridge;

pub use bridge::RewardBridge;

use crate::bus::{
    ActionScored, ExtractTask, Message, MessageBus, MessageContext, MessageHandler, MessageKind,
    ReasonTask, Topic,
};
use crate::error::PipelineError;
use crate::llm::{ChatMessage, ModelClient};
use crate::mcts::{MctsConfig, MctsSearcher, PendingRewards, ReasoningNode};
use crate::models::{ReasonResult, StageResult};
use crate::parsing::{extract_formula, extract_score};
use crate::prompts;
use crate::state::ContextStore;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ReasoningStage {
    bus: MessageBus,
    store: Arc<dyn ContextStore>,
    model: Arc<dyn ModelClient>,
    searcher: MctsSearcher,
    pending: Arc<dyn PendingRewards>,
    reward_timeout: Duration,
}

impl ReasoningStage {
    pub fn new(
        bus: MessageBus,
        store: Arc<dyn ContextStore>,
        model: Arc<dyn ModelClient>,
        search: MctsConfig,
        pending: Arc<dyn PendingRewards>,
        reward_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            store,
            model,
            searcher: MctsSearcher::new(search),
            pending,
            reward_timeout,
        }
    }

    async fn handle_reason_task(&self, task: ReasonTask, ctx: &MessageContext) -> Result<()> {
        let task_id = task.task_id;
        let context = self.store.get(task_id).await?;

        info!(task_id = %task_id, "Searching for reasoning actions");

        let bridge = RewardBridge::new(
            self.bus.clone(),
            self.pending.clone(),
            task_id,
            context.input.question.clone(),
            self.reward_timeout,
        );
        let outcome = self
            .searcher
            .search(ReasoningNode::root(&actions::catalog()), &bridge)
            .await;

        if outcome.best_actions.is_empty() {
            warn!(task_id = %task_id, rollouts = outcome.rollouts, "Search produced no actions");
            return Err(PipelineError::EmptyActionSequence(task_id));
        }

        let system = ChatMessage::system(prompts::SYSTEM_REASONER);
        let mut aggregate = String::new();

        for name in &outcome.best_actions {
            let Some(action) = actions::find(name) else {
                warn!(task_id = %task_id, action = %name, "Unknown action skipped");
                continue;
            };

            let prompt = prompts::reason_action_prompt(&context.input, action, &aggregate);
            let response = self
                .model
                .create(&[system.clone(), ChatMessage::user(prompt)], &ctx.cancellation)
                .await?;

            debug!(task_id = %task_id, action = %name, chars = response.len(), "Action executed");
            aggregate.push_str(&format!("## {}\n{}\n\n", action.name, response.trim()));
        }

        let aggregate = aggregate.trim_end().to_string();
        self.store
            .append(
                task_id,
                StageResult::Reason(ReasonResult {
                    formula: extract_formula(&aggregate),
                    variables: aggregate.clone(),
                    raw_response: aggregate,
                    actions: outcome.best_actions.clone(),
                    created_at: Utc::now(),
                }),
            )
            .await?;

        info!(task_id = %task_id, actions = ?outcome.best_actions, "Reasoning complete");

        self.bus
            .publish(Topic::Extract, Message::Extract(ExtractTask { task_id }))
            .await
    }

    fn handle_action_scored(&self, scored: ActionScored) {
        let score = extract_score(&scored.raw);
        if !self.pending.resolve(scored.correlation_id, score) {
            debug!(correlation_id = %scored.correlation_id, "Late score discarded");
        }
    }
}

#[async_trait]
impl MessageHandler for ReasoningStage {
    fn name(&self) -> &'static str {
        "reasoner"
    }

    fn accepts(&self) -> &'static [MessageKind] {
        &[MessageKind::Reason, MessageKind::ActionScored]
    }

    async fn handle(&self, message: Message, ctx: MessageContext) -> Result<()> {
        match message {
            Message::Reason(task) => self.handle_reason_task(task, &ctx).await,
            Message::ActionScored(scored) => {
                self.handle_action_scored(scored);
                Ok(())
            }
            other => {
                warn!(kind = ?other.kind(), "Reasoner ignored message");
                Ok(())
            }
        }
    }
}
