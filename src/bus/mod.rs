//! Topic-based publish/subscribe bus connecting the pipeline stages
//!
//! Every subscription owns a dispatcher task that starts one handler task per
//! delivered message, in arrival order. A handler that suspends (model call,
//! code execution, reward wait) never holds up other deliveries.

pub mod messages;

pub use messages::{
    ActionScored, ExecuteTask, ExtractTask, Message, MessageKind, OutputTask, ReasonTask,
    ReviewExecute, ReviewExtract, ScoreAction, Topic, VerifyTask,
};

use crate::error::PipelineError;
use crate::models::TaskId;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

const FAILURE_CHANNEL_CAPACITY: usize = 256;

/// A stage (or probe) that consumes messages from one topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Message kinds this handler is registered for.
    fn accepts(&self) -> &'static [MessageKind];

    async fn handle(&self, message: Message, ctx: MessageContext) -> Result<()>;
}

/// Delivery metadata handed to a handler alongside the message.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub topic: Topic,
    pub sequence: u64,
    /// Cancelled when the bus shuts down; threaded into model requests.
    pub cancellation: CancellationToken,
}

/// Reported whenever a handler returns an error.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler: &'static str,
    pub topic: Topic,
    pub kind: MessageKind,
    pub task_id: Option<TaskId>,
    pub error: String,
}

struct Delivery {
    message: Message,
    ctx: MessageContext,
}

struct Subscription {
    handler: &'static str,
    kinds: &'static [MessageKind],
    sender: mpsc::UnboundedSender<Delivery>,
}

struct BusInner {
    subscriptions: RwLock<HashMap<Topic, Vec<Subscription>>>,
    sequence: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    failures: broadcast::Sender<HandlerFailure>,
}

/// Cheaply cloneable handle to the shared bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(HashMap::new()),
                sequence: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                failures,
            }),
        }
    }

    /// Register `handler` on `topic` for the message kinds it accepts.
    pub async fn subscribe(&self, topic: Topic, handler: Arc<dyn MessageHandler>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let name = handler.name();
        let kinds = handler.accepts();

        self.inner.tracker.spawn(dispatch(
            topic,
            handler,
            receiver,
            self.inner.tracker.clone(),
            self.inner.failures.clone(),
            self.inner.shutdown.clone(),
        ));

        let mut subscriptions = self.inner.subscriptions.write().await;
        subscriptions.entry(topic).or_default().push(Subscription {
            handler: name,
            kinds,
            sender,
        });

        debug!(topic = %topic, handler = name, ?kinds, "Handler subscribed");
    }

    /// Enqueue `message` for every subscriber of `topic` that accepts its kind.
    pub async fn publish(&self, topic: Topic, message: Message) -> Result<()> {
        let kind = message.kind();

        if self.inner.shutdown.is_cancelled() {
            return Err(PipelineError::BusError(format!(
                "bus is shut down; dropped {:?} on {}",
                kind, topic
            )));
        }

        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        let subscriptions = self.inner.subscriptions.read().await;

        let targets: Vec<&Subscription> = subscriptions
            .get(&topic)
            .map(|subs| subs.iter().filter(|s| s.kinds.contains(&kind)).collect())
            .unwrap_or_default();

        if targets.is_empty() {
            warn!(topic = %topic, ?kind, sequence, "No subscriber accepts message; dropped");
            return Ok(());
        }

        for subscription in targets {
            let delivery = Delivery {
                message: message.clone(),
                ctx: MessageContext {
                    topic,
                    sequence,
                    cancellation: self.inner.shutdown.child_token(),
                },
            };

            subscription.sender.send(delivery).map_err(|_| {
                PipelineError::BusError(format!(
                    "subscriber {} on {} is no longer receiving",
                    subscription.handler, topic
                ))
            })?;
        }

        debug!(topic = %topic, ?kind, sequence, task_id = ?message.task_id(), "Message published");
        Ok(())
    }

    /// Stream of handler failures.
    pub fn failures(&self) -> broadcast::Receiver<HandlerFailure> {
        self.inner.failures.subscribe()
    }

    pub async fn subscriber_count(&self, topic: Topic) -> usize {
        let subscriptions = self.inner.subscriptions.read().await;
        subscriptions.get(&topic).map(Vec::len).unwrap_or(0)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop dispatching, cancel in-flight model requests and wait for handlers.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("Message bus shut down");
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch(
    topic: Topic,
    handler: Arc<dyn MessageHandler>,
    mut receiver: mpsc::UnboundedReceiver<Delivery>,
    tracker: TaskTracker,
    failures: broadcast::Sender<HandlerFailure>,
    shutdown: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = receiver.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let handler = handler.clone();
        let failures = failures.clone();

        tracker.spawn(async move {
            let kind = delivery.message.kind();
            let task_id = delivery.message.task_id();
            let sequence = delivery.ctx.sequence;

            if let Err(e) = handler.handle(delivery.message, delivery.ctx).await {
                error!(
                    handler = handler.name(),
                    topic = %topic,
                    ?kind,
                    sequence,
                    task_id = ?task_id,
                    error = %e,
                    "Message handler failed"
                );

                // No receivers just means nobody is watching failures.
                let _ = failures.send(HandlerFailure {
                    handler: handler.name(),
                    topic,
                    kind,
                    task_id,
                    error: e.to_string(),
                });
            }
        });
    }

    debug!(topic = %topic, handler = handler.name(), "Dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Forwards every delivery to a channel.
    struct Recorder {
        kinds: &'static [MessageKind],
        seen: mpsc::UnboundedSender<(Topic, MessageKind)>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn accepts(&self) -> &'static [MessageKind] {
            self.kinds
        }

        async fn handle(&self, message: Message, ctx: MessageContext) -> Result<()> {
            let _ = self.seen.send((ctx.topic, message.kind()));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl MessageHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn accepts(&self) -> &'static [MessageKind] {
            &[MessageKind::Execute]
        }

        async fn handle(&self, _message: Message, _ctx: MessageContext) -> Result<()> {
            Err(PipelineError::ModelError("boom".into()))
        }
    }

    /// Re-publishes every extract request as an execute request.
    struct Relay {
        bus: MessageBus,
    }

    #[async_trait]
    impl MessageHandler for Relay {
        fn name(&self) -> &'static str {
            "relay"
        }

        fn accepts(&self) -> &'static [MessageKind] {
            &[MessageKind::Extract]
        }

        async fn handle(&self, message: Message, _ctx: MessageContext) -> Result<()> {
            if let Message::Extract(task) = message {
                self.bus
                    .publish(Topic::Execute, Message::Execute(ExecuteTask { task_id: task.task_id }))
                    .await?;
            }
            Ok(())
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<(Topic, MessageKind)>) -> (Topic, MessageKind) {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_publish_reaches_every_accepting_subscriber() {
        let bus = MessageBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..2 {
            bus.subscribe(
                Topic::Execute,
                Arc::new(Recorder {
                    kinds: &[MessageKind::Execute],
                    seen: tx.clone(),
                }),
            )
            .await;
        }

        let task_id = TaskId::new();
        bus.publish(Topic::Execute, Message::Execute(ExecuteTask { task_id }))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, (Topic::Execute, MessageKind::Execute));
        assert_eq!(recv(&mut rx).await, (Topic::Execute, MessageKind::Execute));
        assert_eq!(bus.subscriber_count(Topic::Execute).await, 2);
    }

    #[tokio::test]
    async fn test_unaccepted_kind_is_dropped() {
        let bus = MessageBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(
            Topic::Verify,
            Arc::new(Recorder {
                kinds: &[MessageKind::ReviewExecute],
                seen: tx,
            }),
        )
        .await;

        let task_id = TaskId::new();
        bus.publish(Topic::Verify, Message::Verify(VerifyTask { task_id }))
            .await
            .unwrap();
        bus.publish(Topic::Verify, Message::ReviewExecute(ReviewExecute { task_id }))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, (Topic::Verify, MessageKind::ReviewExecute));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_can_publish_onward() {
        let bus = MessageBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(Topic::Extract, Arc::new(Relay { bus: bus.clone() })).await;
        bus.subscribe(
            Topic::Execute,
            Arc::new(Recorder {
                kinds: &[MessageKind::Execute],
                seen: tx,
            }),
        )
        .await;

        bus.publish(Topic::Extract, Message::Extract(ExtractTask { task_id: TaskId::new() }))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, (Topic::Execute, MessageKind::Execute));
    }

    #[tokio::test]
    async fn test_handler_failure_is_broadcast() {
        let bus = MessageBus::new();
        let mut failures = bus.failures();
        bus.subscribe(Topic::Execute, Arc::new(Failing)).await;

        let task_id = TaskId::new();
        bus.publish(Topic::Execute, Message::Execute(ExecuteTask { task_id }))
            .await
            .unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.handler, "failing");
        assert_eq!(failure.task_id, Some(task_id));
        assert!(failure.error.contains("boom"));
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let bus = MessageBus::new();
        bus.shutdown().await;

        let result = bus
            .publish(Topic::Reason, Message::Reason(ReasonTask { task_id: TaskId::new() }))
            .await;
        assert!(matches!(result, Err(PipelineError::BusError(_))));
        assert!(bus.is_shut_down());
    }
}
