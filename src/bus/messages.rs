//! Topics and message payloads exchanged between stages

use crate::mcts::reward::RequestId;
use crate::models::TaskId;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const REASONER_TOPIC: &str = "reasoner";
pub const EXTRACTOR_TOPIC: &str = "extractor";
pub const EXECUTOR_TOPIC: &str = "executor";
pub const VERIFIER_TOPIC: &str = "verifier";
pub const OUTPUT_TOPIC: &str = "output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Reason,
    Extract,
    Execute,
    Verify,
    Output,
}

impl Topic {
    pub fn name(&self) -> &'static str {
        match self {
            Topic::Reason => REASONER_TOPIC,
            Topic::Extract => EXTRACTOR_TOPIC,
            Topic::Execute => EXECUTOR_TOPIC,
            Topic::Verify => VERIFIER_TOPIC,
            Topic::Output => OUTPUT_TOPIC,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

//
// ================= Payloads =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonTask {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractTask {
    pub task_id: TaskId,
}

/// Asks the extraction stage to redo its work in light of a review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewExtract {
    pub task_id: TaskId,
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteTask {
    pub task_id: TaskId,
}

/// Asks the verifier to review the latest generated code and its output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewExecute {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyTask {
    pub task_id: TaskId,
}

/// Reward request for one candidate reasoning action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreAction {
    pub correlation_id: RequestId,
    pub task_id: TaskId,
    pub action: String,
    pub instruction: String,
    pub question: String,
}

/// Raw scorer response, routed back by correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionScored {
    pub correlation_id: RequestId,
    pub raw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputTask {
    pub task_id: TaskId,
}

//
// ================= Envelope =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    Reason(ReasonTask),
    Extract(ExtractTask),
    ReviewExtract(ReviewExtract),
    Execute(ExecuteTask),
    ReviewExecute(ReviewExecute),
    Verify(VerifyTask),
    ScoreAction(ScoreAction),
    ActionScored(ActionScored),
    Output(OutputTask),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Reason,
    Extract,
    ReviewExtract,
    Execute,
    ReviewExecute,
    Verify,
    ScoreAction,
    ActionScored,
    Output,
}

impl MessageKind {
    /// Whether a handler failure on this kind ends the owning task.
    ///
    /// Scoring traffic is recovered by the reward bridge's timeout instead.
    pub fn fails_task(&self) -> bool {
        !matches!(self, MessageKind::ScoreAction | MessageKind::ActionScored)
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Reason(_) => MessageKind::Reason,
            Message::Extract(_) => MessageKind::Extract,
            Message::ReviewExtract(_) => MessageKind::ReviewExtract,
            Message::Execute(_) => MessageKind::Execute,
            Message::ReviewExecute(_) => MessageKind::ReviewExecute,
            Message::Verify(_) => MessageKind::Verify,
            Message::ScoreAction(_) => MessageKind::ScoreAction,
            Message::ActionScored(_) => MessageKind::ActionScored,
            Message::Output(_) => MessageKind::Output,
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Message::Reason(m) => Some(m.task_id),
            Message::Extract(m) => Some(m.task_id),
            Message::ReviewExtract(m) => Some(m.task_id),
            Message::Execute(m) => Some(m.task_id),
            Message::ReviewExecute(m) => Some(m.task_id),
            Message::Verify(m) => Some(m.task_id),
            Message::ScoreAction(m) => Some(m.task_id),
            Message::ActionScored(_) => None,
            Message::Output(m) => Some(m.task_id),
        }
    }
}
