//! Reward source that asks the verifier to score actions over the bus

use super::actions;
use crate::bus::{Message, MessageBus, ScoreAction, Topic};
use crate::mcts::{PendingRewards, RewardSource};
use crate::models::TaskId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Scores actions for one task's search.
pub struct RewardBridge {
    bus: MessageBus,
    pending: Arc<dyn PendingRewards>,
    task_id: TaskId,
    question: String,
    timeout: Duration,
}

impl RewardBridge {
    pub fn new(
        bus: MessageBus,
        pending: Arc<dyn PendingRewards>,
        task_id: TaskId,
        question: String,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            pending,
            task_id,
            question,
            timeout,
        }
    }
}

#[async_trait]
impl RewardSource for RewardBridge {
    /// Publish a scoring request and wait for its answer; 0.0 on timeout or
    /// transport failure.
    async fn reward(&self, action: &str) -> f64 {
        let (correlation_id, receiver) = self.pending.enqueue();

        let request = Message::ScoreAction(ScoreAction {
            correlation_id,
            task_id: self.task_id,
            action: action.to_string(),
            instruction: actions::find(action)
                .map(|a| a.instruction.to_string())
                .unwrap_or_default(),
            question: self.question.clone(),
        });

        if let Err(e) = self.bus.publish(Topic::Verify, request).await {
            warn!(task_id = %self.task_id, %correlation_id, error = %e, "Scoring request not sent");
            self.pending.expire(correlation_id);
            return 0.0;
        }

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(score)) => {
                debug!(task_id = %self.task_id, action, score, "Action scored");
                score
            }
            Ok(Err(_)) => {
                warn!(task_id = %self.task_id, %correlation_id, "Scoring request dropped");
                self.pending.expire(correlation_id);
                0.0
            }
            Err(_) => {
                warn!(
                    task_id = %self.task_id,
                    %correlation_id,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Scoring timed out"
                );
                self.pending.expire(correlation_id);
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ActionScored, MessageContext, MessageHandler, MessageKind};
    use crate::mcts::CorrelatedRewards;
    use crate::Result;

    /// Answers every scoring request with a fixed score.
    struct Scorer {
        score: f64,
        pending: Arc<dyn PendingRewards>,
    }

    #[async_trait]
    impl MessageHandler for Scorer {
        fn name(&self) -> &'static str {
            "scorer"
        }

        fn accepts(&self) -> &'static [MessageKind] {
            &[MessageKind::ScoreAction]
        }

        async fn handle(&self, message: Message, _ctx: MessageContext) -> Result<()> {
            if let Message::ScoreAction(request) = message {
                // Resolve directly instead of routing through the reasoner topic.
                let reply = ActionScored {
                    correlation_id: request.correlation_id,
                    raw: format!("{{\"score\": {}}}", self.score),
                };
                self.pending
                    .resolve(reply.correlation_id, crate::parsing::extract_score(&reply.raw));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reward_round_trip() {
        let bus = MessageBus::new();
        let pending: Arc<dyn PendingRewards> = Arc::new(CorrelatedRewards::new());
        bus.subscribe(
            Topic::Verify,
            Arc::new(Scorer {
                score: 0.75,
                pending: pending.clone(),
            }),
        )
        .await;

        let bridge = RewardBridge::new(
            bus,
            pending.clone(),
            TaskId::new(),
            "q".into(),
            Duration::from_secs(1),
        );

        assert_eq!(bridge.reward("map_variables").await, 0.75);
        assert_eq!(pending.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_zero_and_clears_pending() {
        // No verifier subscribed: the request is dropped and never answered.
        let bus = MessageBus::new();
        let pending: Arc<dyn PendingRewards> = Arc::new(CorrelatedRewards::new());
        let bridge = RewardBridge::new(
            bus,
            pending.clone(),
            TaskId::new(),
            "q".into(),
            Duration::from_secs(10),
        );

        assert_eq!(bridge.reward("map_variables").await, 0.0);
        assert_eq!(pending.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_yields_zero() {
        let bus = MessageBus::new();
        bus.shutdown().await;
        let pending: Arc<dyn PendingRewards> = Arc::new(CorrelatedRewards::new());
        let bridge = RewardBridge::new(
            bus,
            pending.clone(),
            TaskId::new(),
            "q".into(),
            Duration::from_secs(10),
        );

        assert_eq!(bridge.reward("map_variables").await, 0.0);
        assert_eq!(pending.outstanding(), 0);
    }
}
