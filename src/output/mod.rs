//! Output stage and CSV report
//!
//! Checkpoints each finished task into a tabular report, hands the final
//! context to whoever is waiting on outcomes and, optionally, evicts it.

use crate::bus::{Message, MessageContext, MessageHandler, MessageKind, OutputTask};
use crate::error::PipelineError;
use crate::eval::{evaluate_context, Evaluation};
use crate::models::{TaskContext, TaskId, VerifyResult};
use crate::state::ContextStore;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub const REPORT_COLUMNS: [&str; 12] = [
    "task",
    "context",
    "question",
    "answer",
    "program",
    "model_output",
    "evaluations",
    "reasoner_output",
    "reasoner_actions",
    "extractor_output",
    "executor_output",
    "verifier_output",
];

/// How a submitted task ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(Box<TaskContext>),
    Failed { task_id: TaskId, error: String },
}

impl TaskOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskOutcome::Completed(context) => context.task_id,
            TaskOutcome::Failed { task_id, .. } => *task_id,
        }
    }
}

/// Contents of the `evaluations` column.
#[derive(Debug, Serialize)]
struct Evaluations<'a> {
    /// Absent when the task has no numeric gold answer.
    accuracy: Option<Evaluation>,
    reviews: &'a [VerifyResult],
}

/// One report line, in `REPORT_COLUMNS` order.
#[derive(Debug, Clone)]
pub struct ReportRow {
    pub task: String,
    pub context: String,
    pub question: String,
    pub answer: String,
    pub program: String,
    pub model_output: String,
    pub evaluations: String,
    pub reasoner_output: String,
    pub reasoner_actions: String,
    pub extractor_output: String,
    pub executor_output: String,
    pub verifier_output: String,
}

impl ReportRow {
    pub fn from_context(context: &TaskContext, tolerance: f64) -> Result<Self> {
        let input = &context.input;
        let reason = context.latest_reason();
        let execute = context.latest_execute();

        Ok(Self {
            task: input.task.clone(),
            context: input.context.clone(),
            question: input.question.clone(),
            answer: input.answer.clone().unwrap_or_default(),
            program: input.program.clone().unwrap_or_default(),
            model_output: execute.map(|e| e.output.clone()).unwrap_or_default(),
            evaluations: serde_json::to_string(&Evaluations {
                accuracy: evaluate_context(context, tolerance),
                reviews: context.verify_log(),
            })?,
            reasoner_output: reason.map(|r| r.raw_response.clone()).unwrap_or_default(),
            reasoner_actions: reason.map(|r| r.actions.join(" -> ")).unwrap_or_default(),
            extractor_output: context
                .latest_extract()
                .map(|e| e.extracted.clone())
                .unwrap_or_default(),
            executor_output: execute.map(|e| e.code.clone()).unwrap_or_default(),
            verifier_output: context
                .latest_verify()
                .map(|v| v.summary())
                .unwrap_or_default(),
        })
    }

    fn fields(&self) -> [&str; 12] {
        [
            &self.task,
            &self.context,
            &self.question,
            &self.answer,
            &self.program,
            &self.model_output,
            &self.evaluations,
            &self.reasoner_output,
            &self.reasoner_actions,
            &self.extractor_output,
            &self.executor_output,
            &self.verifier_output,
        ]
    }
}

/// RFC 4180 quoting: fields with separators, quotes or line breaks are wrapped
/// in quotes with inner quotes doubled.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_line<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut line = fields.into_iter().map(csv_field).collect::<Vec<_>>().join(",");
    line.push('\n');
    line
}

/// Appends rows to a CSV file, writing the header when the file is new.
pub struct ReportWriter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ReportWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, row: &ReportRow) -> Result<()> {
        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::ReportError(format!("{}: {}", parent.display(), e)))?;
        }

        let exists = tokio::fs::try_exists(&self.path).await.unwrap_or(false);
        let mut buffer = String::new();
        if !exists {
            debug!(path = %self.path.display(), "Creating report");
            buffer.push_str(&csv_line(REPORT_COLUMNS));
        }
        buffer.push_str(&csv_line(row.fields()));

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PipelineError::ReportError(format!("{}: {}", self.path.display(), e)))?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

pub struct OutputStage {
    store: Arc<dyn ContextStore>,
    report: Option<ReportWriter>,
    outcomes: mpsc::UnboundedSender<TaskOutcome>,
    evict: bool,
    tolerance: f64,
}

impl OutputStage {
    pub fn new(
        store: Arc<dyn ContextStore>,
        report: Option<ReportWriter>,
        outcomes: mpsc::UnboundedSender<TaskOutcome>,
        evict: bool,
        tolerance: f64,
    ) -> Self {
        Self {
            store,
            report,
            outcomes,
            evict,
            tolerance,
        }
    }

    async fn complete(&self, task_id: TaskId) -> Result<()> {
        let context = self.store.get(task_id).await?;

        if let Some(report) = &self.report {
            report
                .append(&ReportRow::from_context(&context, self.tolerance)?)
                .await?;
            debug!(task_id = %task_id, path = %report.path().display(), "Report row written");
        }

        let context = if self.evict {
            self.store.evict(task_id).await?
        } else {
            context
        };

        info!(
            task_id = %task_id,
            approved = context.latest_verify().map(|v| v.approved).unwrap_or(false),
            correct = ?evaluate_context(&context, self.tolerance).map(|e| e.correct),
            "Task complete"
        );

        if self.outcomes.send(TaskOutcome::Completed(Box::new(context))).is_err() {
            debug!(task_id = %task_id, "No outcome listener");
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for OutputStage {
    fn name(&self) -> &'static str {
        "output"
    }

    fn accepts(&self) -> &'static [MessageKind] {
        &[MessageKind::Output]
    }

    async fn handle(&self, message: Message, _ctx: MessageContext) -> Result<()> {
        match message {
            Message::Output(OutputTask { task_id }) => self.complete(task_id).await,
            other => {
                warn!(kind = ?other.kind(), "Output stage ignored message");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use crate::eval::DEFAULT_TOLERANCE;
    use crate::models::{
        ExecuteResult, ExtractResult, ReasonResult, StageResult, TaskInput, Verdict, VerifyResult,
    };
    use crate::state::InMemoryContextStore;
    use chrono::Utc;

    fn finished_context() -> TaskContext {
        let task_id = TaskId::new();
        let mut context = TaskContext::new(
            task_id,
            TaskInput {
                task: "finqa".into(),
                question: "What was the growth, in %?".into(),
                context: "Revenue: 120 \"old\"\nRevenue: 150 new".into(),
                answer: Some("25.0".into()),
                program: None,
            },
        );
        context.append(StageResult::Reason(ReasonResult {
            formula: "(b - a) / a".into(),
            variables: String::new(),
            raw_response: "## recall_financial_formula\ngrowth".into(),
            actions: vec!["recall_financial_formula".into(), "map_variables".into()],
            created_at: Utc::now(),
        }));
        context.append(StageResult::Extract(ExtractResult {
            extracted: "a = 120, b = 150".into(),
            review: "pending".into(),
            created_at: Utc::now(),
        }));
        context.append(StageResult::Execute(ExecuteResult {
            code: "print(25.0)".into(),
            output: "25.0".into(),
            review: "\"Approved\": true".into(),
            attempts: 1,
            created_at: Utc::now(),
        }));
        context.append(StageResult::Verify(VerifyResult {
            reasoner_comment: String::new(),
            extractor_comment: String::new(),
            executor_comment: "fine".into(),
            approved: true,
            verdict: Verdict::Approved,
            created_at: Utc::now(),
        }));
        context
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_row_from_context() {
        let row = ReportRow::from_context(&finished_context(), DEFAULT_TOLERANCE).unwrap();
        assert_eq!(row.answer, "25.0");
        assert_eq!(row.program, "");
        assert_eq!(row.model_output, "25.0");
        assert_eq!(row.reasoner_actions, "recall_financial_formula -> map_variables");
        assert!(row.verifier_output.contains("Approval Status: Approved"));
        assert!(row.evaluations.contains("\"verdict\":\"approved\""));

        let evaluations: serde_json::Value = serde_json::from_str(&row.evaluations).unwrap();
        assert_eq!(evaluations["accuracy"]["correct"], true);
        assert_eq!(evaluations["accuracy"]["answer"], 25.0);
    }

    #[test]
    fn test_wrong_or_missing_answer_in_evaluations() {
        let mut context = finished_context();
        context.input.answer = Some("31.5".into());
        let row = ReportRow::from_context(&context, DEFAULT_TOLERANCE).unwrap();
        let evaluations: serde_json::Value = serde_json::from_str(&row.evaluations).unwrap();
        assert_eq!(evaluations["accuracy"]["correct"], false);

        context.input.answer = None;
        let row = ReportRow::from_context(&context, DEFAULT_TOLERANCE).unwrap();
        let evaluations: serde_json::Value = serde_json::from_str(&row.evaluations).unwrap();
        assert!(evaluations["accuracy"].is_null());
    }

    #[tokio::test]
    async fn test_report_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("results.csv");
        let writer = ReportWriter::new(&path);
        let row = ReportRow::from_context(&finished_context(), DEFAULT_TOLERANCE).unwrap();

        writer.append(&row).await.unwrap();
        writer.append(&row).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.starts_with(&REPORT_COLUMNS.join(",")));
        assert_eq!(contents.matches("verifier_output").count(), 1);
        assert_eq!(contents.matches("finqa,").count(), 2);
    }

    #[tokio::test]
    async fn test_output_stage_reports_and_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryContextStore::new());
        let context = finished_context();
        let task_id = context.task_id;
        store.register(task_id, context).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stage = OutputStage::new(
            store.clone(),
            Some(ReportWriter::new(dir.path().join("out.csv"))),
            tx,
            true,
            DEFAULT_TOLERANCE,
        );

        stage
            .handle(
                Message::Output(OutputTask { task_id }),
                MessageContext {
                    topic: Topic::Output,
                    sequence: 0,
                    cancellation: Default::default(),
                },
            )
            .await
            .unwrap();

        match rx.recv().await {
            Some(TaskOutcome::Completed(ctx)) => assert_eq!(ctx.task_id, task_id),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(store.len().await, 0);
        assert!(tokio::fs::try_exists(dir.path().join("out.csv")).await.unwrap());
    }
}
