//! Task context store
//!
//! Maps task identifiers to the mutable aggregate of every stage's results.
//! The store is handed to each stage at construction; entries are dropped
//! explicitly via `evict` once the output stage has checkpointed them.

use crate::error::PipelineError;
use crate::models::{StageResult, TaskContext, TaskId};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-place mutation applied to a stored context.
pub type ContextMutation = Box<dyn FnOnce(&mut TaskContext) -> Result<()> + Send>;

/// Trait for task context persistence
#[async_trait::async_trait]
pub trait ContextStore: Send + Sync {
    async fn register(&self, task_id: TaskId, context: TaskContext) -> Result<()>;

    /// Snapshot of the current context; `TaskNotFound` if absent.
    async fn get(&self, task_id: TaskId) -> Result<TaskContext>;

    async fn update(&self, task_id: TaskId, mutation: ContextMutation) -> Result<()>;

    /// Remove and return the context.
    async fn evict(&self, task_id: TaskId) -> Result<TaskContext>;

    async fn len(&self) -> usize;

    async fn append(&self, task_id: TaskId, result: StageResult) -> Result<()> {
        self.update(
            task_id,
            Box::new(move |ctx| {
                ctx.append(result);
                Ok(())
            }),
        )
        .await
    }
}

/// In-memory context store
pub struct InMemoryContextStore {
    contexts: Arc<RwLock<HashMap<TaskId, TaskContext>>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self {
            contexts: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryContextStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ContextStore for InMemoryContextStore {
    async fn register(&self, task_id: TaskId, context: TaskContext) -> Result<()> {
        let mut contexts = self.contexts.write().await;
        contexts.insert(task_id, context);
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<TaskContext> {
        let contexts = self.contexts.read().await;
        contexts
            .get(&task_id)
            .cloned()
            .ok_or(PipelineError::TaskNotFound(task_id))
    }

    async fn update(&self, task_id: TaskId, mutation: ContextMutation) -> Result<()> {
        let mut contexts = self.contexts.write().await;
        let context = contexts
            .get_mut(&task_id)
            .ok_or(PipelineError::TaskNotFound(task_id))?;
        mutation(context)
    }

    async fn evict(&self, task_id: TaskId) -> Result<TaskContext> {
        let mut contexts = self.contexts.write().await;
        contexts
            .remove(&task_id)
            .ok_or(PipelineError::TaskNotFound(task_id))
    }

    async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractResult, TaskInput, PENDING_REVIEW};
    use chrono::Utc;

    fn context(task_id: TaskId) -> TaskContext {
        TaskContext::new(
            task_id,
            TaskInput {
                question: "What is the growth rate?".into(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_get_unknown_task_is_not_found() {
        let store = InMemoryContextStore::new();
        let task_id = TaskId::new();
        let err = store.get(task_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::TaskNotFound(id) if id == task_id));
    }

    #[tokio::test]
    async fn test_append_mutates_in_place() {
        let store = InMemoryContextStore::new();
        let task_id = TaskId::new();
        store.register(task_id, context(task_id)).await.unwrap();

        store
            .append(
                task_id,
                StageResult::Extract(ExtractResult {
                    extracted: "revenue = 10".into(),
                    review: PENDING_REVIEW.into(),
                    created_at: Utc::now(),
                }),
            )
            .await
            .unwrap();

        let snapshot = store.get(task_id).await.unwrap();
        assert_eq!(snapshot.extract_log().len(), 1);
        assert_eq!(snapshot.input.question, "What is the growth rate?");
    }

    #[tokio::test]
    async fn test_update_propagates_mutation_error() {
        let store = InMemoryContextStore::new();
        let task_id = TaskId::new();
        store.register(task_id, context(task_id)).await.unwrap();

        let result = store
            .update(
                task_id,
                Box::new(|ctx| ctx.record_execute_review("no code yet".into())),
            )
            .await;
        assert!(matches!(result, Err(PipelineError::MissingStageResult { .. })));
    }

    #[tokio::test]
    async fn test_evict_removes_entry() {
        let store = InMemoryContextStore::new();
        let task_id = TaskId::new();
        store.register(task_id, context(task_id)).await.unwrap();
        assert_eq!(store.len().await, 1);

        let evicted = store.evict(task_id).await.unwrap();
        assert_eq!(evicted.task_id, task_id);
        assert_eq!(store.len().await, 0);
        assert!(store.evict(task_id).await.is_err());
    }
}
