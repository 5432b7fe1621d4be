//! Pipeline facade
//!
//! Wires the five stages onto one bus and exposes task submission and
//! outcome collection:
//!
//! SUBMIT → REASON (search + actions) → EXTRACT → EXECUTE ⇄ REVIEW → OUTPUT

use crate::bus::{
    HandlerFailure, Message, MessageBus, ReasonTask, Topic, VerifyTask,
};
use crate::config::PipelineConfig;
use crate::execution::ExecutionStage;
use crate::extractor::ExtractionStage;
use crate::llm::{ModelClient, OpenAiCompatibleClient};
use crate::models::{TaskContext, TaskId, TaskInput};
use crate::output::{OutputStage, ReportWriter, TaskOutcome};
use crate::reasoner::ReasoningStage;
use crate::retrieval::{Bm25Retriever, ChunkRetriever, FormulaStore, InMemoryFormulaStore};
use crate::sandbox::{CodeRunner, InlineEvaluator, PythonSubprocessRunner};
use crate::state::{ContextStore, InMemoryContextStore};
use crate::verification::VerificationStage;
use crate::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// External collaborators the stages are built from.
pub struct Components {
    pub model: Arc<dyn ModelClient>,
    pub sandbox: Arc<dyn CodeRunner>,
    pub retriever: Arc<dyn ChunkRetriever>,
    pub formulas: Arc<dyn FormulaStore>,
    pub store: Arc<dyn ContextStore>,
}

impl Components {
    /// Production collaborators: the HTTP model client, a Python subprocess
    /// sandbox, BM25 retrieval and the formula file (or built-in formulas).
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let formulas = match &config.formula_file {
            Some(path) => {
                info!(path = %path.display(), "Loading formula store");
                InMemoryFormulaStore::from_json_file(path).await?
            }
            None => InMemoryFormulaStore::with_defaults(),
        };

        Ok(Self {
            model: Arc::new(OpenAiCompatibleClient::new(&config.model)?),
            sandbox: Arc::new(PythonSubprocessRunner::new(
                config.execution.python.clone(),
                config.execution.sandbox_timeout,
            )),
            retriever: Arc::new(Bm25Retriever::new()),
            formulas: Arc::new(formulas),
            store: Arc::new(InMemoryContextStore::new()),
        })
    }

    /// Same collaborators with a caller-supplied model client.
    pub fn with_model(model: Arc<dyn ModelClient>, config: &PipelineConfig) -> Self {
        Self {
            model,
            sandbox: Arc::new(PythonSubprocessRunner::new(
                config.execution.python.clone(),
                config.execution.sandbox_timeout,
            )),
            retriever: Arc::new(Bm25Retriever::new()),
            formulas: Arc::new(InMemoryFormulaStore::with_defaults()),
            store: Arc::new(InMemoryContextStore::new()),
        }
    }
}

pub struct Pipeline {
    bus: MessageBus,
    store: Arc<dyn ContextStore>,
    outcomes: Mutex<mpsc::UnboundedReceiver<TaskOutcome>>,
    /// Outcomes a batch received for tasks outside it, handed out by
    /// `next_outcome` first.
    backlog: Mutex<VecDeque<TaskOutcome>>,
    failure_forwarder: JoinHandle<()>,
}

impl Pipeline {
    pub async fn start(config: &PipelineConfig, components: Components) -> Self {
        let bus = MessageBus::new();
        let Components {
            model,
            sandbox,
            retriever,
            formulas,
            store,
        } = components;
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        // Subscribed before any task can fail.
        let failures = bus.failures();

        bus.subscribe(
            Topic::Reason,
            Arc::new(ReasoningStage::new(
                bus.clone(),
                store.clone(),
                model.clone(),
                config.search.clone(),
                config.reward.correlation.build(),
                config.reward.timeout,
            )),
        )
        .await;

        bus.subscribe(
            Topic::Extract,
            Arc::new(ExtractionStage::new(
                bus.clone(),
                store.clone(),
                model.clone(),
                retriever,
                config.extraction.top_k,
            )),
        )
        .await;

        bus.subscribe(
            Topic::Execute,
            Arc::new(ExecutionStage::new(
                bus.clone(),
                store.clone(),
                model.clone(),
                sandbox,
                Arc::new(InlineEvaluator::new()),
                config.execution.max_attempts,
            )),
        )
        .await;

        bus.subscribe(
            Topic::Verify,
            Arc::new(VerificationStage::new(
                bus.clone(),
                store.clone(),
                model,
                formulas,
                config.verification.related_formulas,
                config.verification.max_review_turns,
            )),
        )
        .await;

        bus.subscribe(
            Topic::Output,
            Arc::new(OutputStage::new(
                store.clone(),
                config.output.report_path.clone().map(ReportWriter::new),
                outcome_tx.clone(),
                config.output.evict_on_output,
                config.output.eval_tolerance,
            )),
        )
        .await;

        let failure_forwarder = tokio::spawn(forward_failures(failures, outcome_tx));

        info!(
            rollouts = config.search.num_rollouts,
            correlation = ?config.reward.correlation,
            report = ?config.output.report_path,
            "Pipeline started"
        );

        Self {
            bus,
            store,
            outcomes: Mutex::new(outcome_rx),
            backlog: Mutex::new(VecDeque::new()),
            failure_forwarder,
        }
    }

    /// Register a task and start its reasoning stage.
    pub async fn submit(&self, input: TaskInput) -> Result<TaskId> {
        let task_id = TaskId::new();
        self.store
            .register(task_id, TaskContext::new(task_id, input))
            .await?;
        self.bus
            .publish(Topic::Reason, Message::Reason(ReasonTask { task_id }))
            .await?;

        debug!(task_id = %task_id, "Task submitted");
        Ok(task_id)
    }

    /// Ask the verifier for a structured critique of every stage of a task
    /// whose context is still in the store.
    pub async fn request_final_review(&self, task_id: TaskId) -> Result<()> {
        self.store.get(task_id).await?;
        self.bus
            .publish(Topic::Verify, Message::Verify(VerifyTask { task_id }))
            .await
    }

    /// Next finished or failed task; `None` once the pipeline is shut down.
    pub async fn next_outcome(&self) -> Option<TaskOutcome> {
        let buffered = self.backlog.lock().await.pop_front();
        if buffered.is_some() {
            return buffered;
        }
        self.outcomes.lock().await.recv().await
    }

    /// Submit every input and wait for all of their outcomes, returned in
    /// submission order. Outcomes of other tasks that arrive meanwhile stay
    /// available to `next_outcome`.
    pub async fn run_batch(&self, inputs: Vec<TaskInput>) -> Result<Vec<TaskOutcome>> {
        let mut order = Vec::with_capacity(inputs.len());
        for input in inputs {
            order.push(self.submit(input).await?);
        }
        Ok(self.collect(&order).await)
    }

    /// Request the final review of each task and wait for the reviewed
    /// outcomes, in the given order. The contexts must still be in the store,
    /// so the pipeline has to run with eviction off.
    pub async fn review_batch(&self, task_ids: &[TaskId]) -> Result<Vec<TaskOutcome>> {
        for task_id in task_ids {
            self.request_final_review(*task_id).await?;
        }
        Ok(self.collect(task_ids).await)
    }

    async fn collect(&self, order: &[TaskId]) -> Vec<TaskOutcome> {
        let mut finished: HashMap<TaskId, TaskOutcome> = HashMap::with_capacity(order.len());
        let wanted = |finished: &HashMap<TaskId, TaskOutcome>, task_id: &TaskId| {
            order.contains(task_id) && !finished.contains_key(task_id)
        };

        {
            let mut backlog = self.backlog.lock().await;
            let mut kept = VecDeque::with_capacity(backlog.len());
            while let Some(outcome) = backlog.pop_front() {
                let task_id = outcome.task_id();
                if wanted(&finished, &task_id) {
                    finished.insert(task_id, outcome);
                } else {
                    kept.push_back(outcome);
                }
            }
            *backlog = kept;
        }

        let mut receiver = self.outcomes.lock().await;
        while finished.len() < order.len() {
            let Some(outcome) = receiver.recv().await else {
                warn!(pending = order.len() - finished.len(), "Outcome stream closed early");
                break;
            };
            let task_id = outcome.task_id();
            if wanted(&finished, &task_id) {
                finished.insert(task_id, outcome);
            } else {
                debug!(task_id = %task_id, "Outcome outside this batch buffered");
                self.backlog.lock().await.push_back(outcome);
            }
        }

        order
            .iter()
            .filter_map(|task_id| finished.remove(task_id))
            .collect()
    }

    pub fn store(&self) -> Arc<dyn ContextStore> {
        self.store.clone()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub async fn shutdown(&self) {
        self.bus.shutdown().await;
        self.failure_forwarder.abort();
        info!("Pipeline shut down");
    }
}

/// Turn task-ending handler failures into `Failed` outcomes.
async fn forward_failures(
    mut failures: broadcast::Receiver<HandlerFailure>,
    outcomes: mpsc::UnboundedSender<TaskOutcome>,
) {
    loop {
        match failures.recv().await {
            Ok(failure) => {
                let Some(task_id) = failure.task_id else {
                    continue;
                };
                if !failure.kind.fails_task() {
                    debug!(task_id = %task_id, handler = failure.handler, "Non-fatal handler failure");
                    continue;
                }

                error!(
                    task_id = %task_id,
                    handler = failure.handler,
                    topic = %failure.topic,
                    error = %failure.error,
                    "Task failed"
                );
                let outcome = TaskOutcome::Failed {
                    task_id,
                    error: failure.error,
                };
                if outcomes.send(outcome).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Failure stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, Role, ScriptedModelClient};
    use crate::mcts::WeightScheduler;
    use crate::models::Verdict;
    use crate::prompts;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Runs code with the inline evaluator so tests don't need Python.
    struct FakeSubprocess;

    #[async_trait]
    impl CodeRunner for FakeSubprocess {
        fn name(&self) -> &'static str {
            "subprocess"
        }

        async fn run(&self, code: &str) -> String {
            format!(
                "exitcode: 0 (execution succeeded)\nCode output: {}",
                InlineEvaluator::evaluate(code)
            )
        }
    }

    fn system_prompt(messages: &[ChatMessage]) -> &str {
        messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }

    /// Answers each stage's prompt with a canned response.
    fn scripted_model(review: &'static str, executor_calls: Arc<AtomicUsize>) -> Arc<ScriptedModelClient> {
        Arc::new(ScriptedModelClient::new(move |messages| {
            let response = match system_prompt(messages) {
                s if s == prompts::SYSTEM_ACTION_SCORER => r#"{"score": 0.7, "comment": "useful"}"#,
                s if s == prompts::SYSTEM_REASONER => {
                    "Formula: (revenue_2020 - revenue_2019) / revenue_2019 * 100\n\
                     Variable 1: revenue_2019\nVariable 2: revenue_2020"
                }
                s if s == prompts::SYSTEM_EXTRACTOR => "revenue_2019 = 120\nrevenue_2020 = 150",
                s if s == prompts::SYSTEM_EXECUTOR => {
                    executor_calls.fetch_add(1, Ordering::SeqCst);
                    "```python\nrevenue_2019 = 120\nrevenue_2020 = 150\n\
                     print((revenue_2020 - revenue_2019) / revenue_2019 * 100)\n```"
                }
                s if s == prompts::SYSTEM_CODE_REVIEWER => review,
                s if s == prompts::SYSTEM_VERIFIER => {
                    r#"{"reasoner_comment": "ok", "extractor_comment": "ok", "executor_comment": "ok", "approved": true}"#
                }
                _ => "",
            };
            Ok(response.to_string())
        }))
    }

    fn test_config(rollouts: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.search.num_rollouts = rollouts;
        config.search.max_concurrent_rollouts = 4;
        config.search.weight_scheduler = WeightScheduler::Const;
        config.search.seed = Some(11);
        config.reward.timeout = Duration::from_secs(5);
        config.output.report_path = None;
        config.output.evict_on_output = false;
        config
    }

    async fn start(config: &PipelineConfig, model: Arc<ScriptedModelClient>) -> Pipeline {
        let mut components = Components::with_model(model, config);
        components.sandbox = Arc::new(FakeSubprocess);
        Pipeline::start(config, components).await
    }

    fn revenue_question() -> TaskInput {
        TaskInput {
            task: "finqa".into(),
            question: "What was the revenue growth rate from 2019 to 2020?".into(),
            context: "Revenue was $120 million in 2019.\n\nRevenue was $150 million in 2020.".into(),
            answer: Some("25.0".into()),
            program: None,
        }
    }

    async fn next(pipeline: &Pipeline) -> TaskOutcome {
        tokio::time::timeout(Duration::from_secs(20), pipeline.next_outcome())
            .await
            .expect("pipeline produced no outcome")
            .expect("outcome stream closed")
    }

    #[tokio::test]
    async fn test_end_to_end_approved() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = test_config(6);
        let pipeline = start(&config, scripted_model(r#"{"Approved": true}"#, calls.clone())).await;

        let task_id = pipeline.submit(revenue_question()).await.unwrap();

        let TaskOutcome::Completed(context) = next(&pipeline).await else {
            panic!("task failed");
        };
        assert_eq!(context.task_id, task_id);
        assert!(context.is_complete());

        let execute = context.require_execute().unwrap();
        assert!(execute.output.contains("[inline]\n25.0"));
        assert_eq!(execute.attempts, 1);

        let verify = context.latest_verify().unwrap();
        assert!(verify.approved);
        assert_eq!(verify.verdict, Verdict::Approved);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Exactly one outcome per task.
        assert!(
            tokio::time::timeout(Duration::from_millis(200), pipeline.next_outcome())
                .await
                .is_err()
        );

        pipeline.request_final_review(task_id).await.unwrap();
        let TaskOutcome::Completed(reviewed) = next(&pipeline).await else {
            panic!("final review failed");
        };
        assert_eq!(reviewed.latest_verify().unwrap().verdict, Verdict::FinalReview);
        assert_eq!(reviewed.verify_log().len(), 2);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_search_fails_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = test_config(0);
        let pipeline = start(&config, scripted_model(r#"{"Approved": true}"#, calls.clone())).await;

        let task_id = pipeline.submit(revenue_question()).await.unwrap();

        match next(&pipeline).await {
            TaskOutcome::Failed { task_id: failed, error } => {
                assert_eq!(failed, task_id);
                assert!(error.contains("empty action sequence"));
            }
            TaskOutcome::Completed(_) => panic!("task should not complete"),
        }

        let context = pipeline.store().get(task_id).await.unwrap();
        assert!(context.reason_log().is_empty());
        assert!(context.extract_log().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_review_loop_stops_at_turn_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = test_config(4);
        let pipeline = start(
            &config,
            scripted_model(r#"{"Approved": false, "comment": "check units"}"#, calls.clone()),
        )
        .await;

        pipeline.submit(revenue_question()).await.unwrap();

        let TaskOutcome::Completed(context) = next(&pipeline).await else {
            panic!("task failed");
        };
        // First delivery plus one per rejected turn.
        let expected = config.verification.max_review_turns as usize + 1;
        assert_eq!(calls.load(Ordering::SeqCst), expected);
        assert_eq!(context.execute_log().len(), expected);

        let verify = context.latest_verify().unwrap();
        assert!(!verify.approved);
        assert_eq!(verify.verdict, Verdict::TurnLimitReached);
    }

    #[tokio::test]
    async fn test_run_batch_returns_outcomes_in_submission_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut config = test_config(3);
        config.output.evict_on_output = true;
        let pipeline = start(&config, scripted_model(r#""Approved": true"#, calls)).await;

        let outcomes = pipeline
            .run_batch(vec![revenue_question(), revenue_question(), revenue_question()])
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| matches!(o, TaskOutcome::Completed(_))));
        assert_eq!(pipeline.store().len().await, 0);
    }

    #[tokio::test]
    async fn test_run_batch_keeps_other_outcomes_for_next_outcome() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = test_config(3);
        let pipeline = start(&config, scripted_model(r#""Approved": true"#, calls)).await;

        let outside = pipeline.submit(revenue_question()).await.unwrap();
        let outcomes = pipeline.run_batch(vec![revenue_question()]).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_ne!(outcomes[0].task_id(), outside);

        assert_eq!(next(&pipeline).await.task_id(), outside);
    }

    #[tokio::test]
    async fn test_review_batch_after_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = test_config(3);
        let pipeline = start(&config, scripted_model(r#""Approved": true"#, calls)).await;

        let outcomes = pipeline
            .run_batch(vec![revenue_question(), revenue_question()])
            .await
            .unwrap();
        let task_ids: Vec<TaskId> = outcomes.iter().map(TaskOutcome::task_id).collect();

        let reviewed = pipeline.review_batch(&task_ids).await.unwrap();
        assert_eq!(reviewed.iter().map(TaskOutcome::task_id).collect::<Vec<_>>(), task_ids);
        for outcome in reviewed {
            let TaskOutcome::Completed(context) = outcome else {
                panic!("final review failed");
            };
            assert_eq!(context.latest_verify().unwrap().verdict, Verdict::FinalReview);
        }
    }

    #[tokio::test]
    async fn test_final_review_needs_retained_context() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut config = test_config(3);
        config.output.evict_on_output = true;
        let pipeline = start(&config, scripted_model(r#""Approved": true"#, calls)).await;

        let outcomes = pipeline.run_batch(vec![revenue_question()]).await.unwrap();
        let result = pipeline.request_final_review(outcomes[0].task_id()).await;
        assert!(matches!(result, Err(crate::PipelineError::TaskNotFound(_))));
    }
}
