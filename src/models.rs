//! Core data models for the financial QA pipeline

use crate::error::PipelineError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Identifiers =================
//

/// Identifier assigned to a task when it is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Result<Self> {
        Ok(Self(Uuid::parse_str(value)?))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Reason,
    Extract,
    Execute,
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Reason => "reason",
            Stage::Extract => "extract",
            Stage::Execute => "execute",
            Stage::Verify => "verify",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Task Input =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInput {
    /// Dataset or task family name, reported verbatim.
    #[serde(default)]
    pub task: String,
    pub question: String,
    /// Supporting passage (paragraphs and markdown tables).
    #[serde(default)]
    pub context: String,
    /// Gold answer, when known.
    #[serde(default)]
    pub answer: Option<String>,
    /// Declared formula or program, when the dataset carries one.
    #[serde(default)]
    pub program: Option<String>,
}

//
// ================= Stage Results =================
//

pub const PENDING_REVIEW: &str = "pending";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonResult {
    pub formula: String,
    pub variables: String,
    pub raw_response: String,
    pub actions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResult {
    pub extracted: String,
    pub review: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub code: String,
    /// Combined output of both execution backends.
    pub output: String,
    pub review: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// How a task's verification ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    TurnLimitReached,
    FinalReview,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResult {
    pub reasoner_comment: String,
    pub extractor_comment: String,
    pub executor_comment: String,
    pub approved: bool,
    pub verdict: Verdict,
    pub created_at: DateTime<Utc>,
}

impl VerifyResult {
    /// Human-readable digest of the comments and approval status.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        if !self.reasoner_comment.is_empty() {
            lines.push(format!("Reasoner Comment: {}", self.reasoner_comment));
        }
        if !self.extractor_comment.is_empty() {
            lines.push(format!("Extractor Comment: {}", self.extractor_comment));
        }
        if !self.executor_comment.is_empty() {
            lines.push(format!("Executor Comment: {}", self.executor_comment));
        }
        let status = if self.approved { "Approved" } else { "Not Approved" };
        lines.push(format!("Approval Status: {}", status));
        lines.join("\n")
    }
}

/// One attempt's result from any stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum StageResult {
    Reason(ReasonResult),
    Extract(ExtractResult),
    Execute(ExecuteResult),
    Verify(VerifyResult),
}

impl StageResult {
    pub fn stage(&self) -> Stage {
        match self {
            StageResult::Reason(_) => Stage::Reason,
            StageResult::Extract(_) => Stage::Extract,
            StageResult::Execute(_) => Stage::Execute,
            StageResult::Verify(_) => Stage::Verify,
        }
    }
}

//
// ================= Task Context =================
//

/// Aggregate of everything the stages produced for one task.
///
/// Logs are append-only; the "current" result of a stage is its last entry.
/// Each stage's log is only reachable through that stage's accessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub input: TaskInput,
    pub created_at: DateTime<Utc>,
    reason_log: Vec<ReasonResult>,
    extract_log: Vec<ExtractResult>,
    execute_log: Vec<ExecuteResult>,
    verify_log: Vec<VerifyResult>,
}

impl TaskContext {
    pub fn new(task_id: TaskId, input: TaskInput) -> Self {
        Self {
            task_id,
            input,
            created_at: Utc::now(),
            reason_log: Vec::new(),
            extract_log: Vec::new(),
            execute_log: Vec::new(),
            verify_log: Vec::new(),
        }
    }

    pub fn append(&mut self, result: StageResult) {
        match result {
            StageResult::Reason(r) => self.reason_log.push(r),
            StageResult::Extract(r) => self.extract_log.push(r),
            StageResult::Execute(r) => self.execute_log.push(r),
            StageResult::Verify(r) => self.verify_log.push(r),
        }
    }

    pub fn latest_reason(&self) -> Option<&ReasonResult> {
        self.reason_log.last()
    }

    pub fn latest_extract(&self) -> Option<&ExtractResult> {
        self.extract_log.last()
    }

    pub fn latest_execute(&self) -> Option<&ExecuteResult> {
        self.execute_log.last()
    }

    pub fn latest_verify(&self) -> Option<&VerifyResult> {
        self.verify_log.last()
    }

    pub fn require_reason(&self) -> Result<&ReasonResult> {
        self.latest_reason().ok_or_else(|| self.missing(Stage::Reason))
    }

    pub fn require_extract(&self) -> Result<&ExtractResult> {
        self.latest_extract().ok_or_else(|| self.missing(Stage::Extract))
    }

    pub fn require_execute(&self) -> Result<&ExecuteResult> {
        self.latest_execute().ok_or_else(|| self.missing(Stage::Execute))
    }

    pub fn reason_log(&self) -> &[ReasonResult] {
        &self.reason_log
    }

    pub fn extract_log(&self) -> &[ExtractResult] {
        &self.extract_log
    }

    pub fn execute_log(&self) -> &[ExecuteResult] {
        &self.execute_log
    }

    pub fn verify_log(&self) -> &[VerifyResult] {
        &self.verify_log
    }

    /// Attach a reviewer comment to the execution stage's latest attempt.
    pub fn record_execute_review(&mut self, review: String) -> Result<()> {
        let missing = self.missing(Stage::Execute);
        let latest = self.execute_log.last_mut().ok_or(missing)?;
        latest.review = review;
        Ok(())
    }

    /// True once every stage has logged at least one result.
    pub fn is_complete(&self) -> bool {
        !self.reason_log.is_empty()
            && !self.extract_log.is_empty()
            && !self.execute_log.is_empty()
            && !self.verify_log.is_empty()
    }

    fn missing(&self, stage: Stage) -> PipelineError {
        PipelineError::MissingStageResult {
            stage,
            task_id: self.task_id,
        }
    }
}
