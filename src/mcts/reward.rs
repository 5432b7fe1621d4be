//! Pending reward requests
//!
//! A rollout asks another actor to score an action and suspends on a oneshot
//! receiver until the answer arrives. These types hold the matching senders.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Correlation id carried by a scoring request and its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outstanding reward futures awaiting a score.
pub trait PendingRewards: Send + Sync {
    fn enqueue(&self) -> (RequestId, oneshot::Receiver<f64>);

    /// Deliver `score` for `id`. Returns false if nothing was waiting.
    fn resolve(&self, id: RequestId, score: f64) -> bool;

    /// Give up on `id`, completing it with 0.0. Returns false if it was
    /// already resolved or expired.
    fn expire(&self, id: RequestId) -> bool;

    fn outstanding(&self) -> usize;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Single queue of futures completed strictly in enqueue order.
///
/// Ids are accepted but ignored: each response completes the oldest waiter.
/// Pairing is only correct while at most one request is in flight.
#[derive(Default)]
pub struct FifoRewardQueue {
    queue: Mutex<VecDeque<oneshot::Sender<f64>>>,
}

impl FifoRewardQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pop_and_send(&self, score: f64) -> bool {
        let sender = lock(&self.queue).pop_front();
        match sender {
            // A dropped receiver means the waiter already gave up.
            Some(sender) => {
                let _ = sender.send(score);
                true
            }
            None => false,
        }
    }
}

impl PendingRewards for FifoRewardQueue {
    fn enqueue(&self) -> (RequestId, oneshot::Receiver<f64>) {
        let (tx, rx) = oneshot::channel();
        lock(&self.queue).push_back(tx);
        (RequestId::new(), rx)
    }

    fn resolve(&self, id: RequestId, score: f64) -> bool {
        let delivered = self.pop_and_send(score);
        if !delivered {
            warn!(request_id = %id, "Score arrived with no pending request");
        }
        delivered
    }

    fn expire(&self, id: RequestId) -> bool {
        let expired = self.pop_and_send(0.0);
        if !expired {
            debug!(request_id = %id, "Expire on empty queue ignored");
        }
        expired
    }

    fn outstanding(&self) -> usize {
        lock(&self.queue).len()
    }
}

/// Futures keyed by request id; responses complete exactly their own request.
#[derive(Default)]
pub struct CorrelatedRewards {
    pending: Mutex<HashMap<RequestId, oneshot::Sender<f64>>>,
}

impl CorrelatedRewards {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingRewards for CorrelatedRewards {
    fn enqueue(&self) -> (RequestId, oneshot::Receiver<f64>) {
        let (tx, rx) = oneshot::channel();
        let id = RequestId::new();
        lock(&self.pending).insert(id, tx);
        (id, rx)
    }

    fn resolve(&self, id: RequestId, score: f64) -> bool {
        let sender = lock(&self.pending).remove(&id);
        match sender {
            Some(sender) => {
                let _ = sender.send(score);
                true
            }
            None => {
                warn!(request_id = %id, "Score for unknown or expired request");
                false
            }
        }
    }

    fn expire(&self, id: RequestId) -> bool {
        let sender = lock(&self.pending).remove(&id);
        match sender {
            Some(sender) => {
                let _ = sender.send(0.0);
                true
            }
            None => false,
        }
    }

    fn outstanding(&self) -> usize {
        lock(&self.pending).len()
    }
}

/// How scoring responses are matched to waiting rollouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardCorrelation {
    Correlated,
    Fifo,
}

impl RewardCorrelation {
    pub fn build(&self) -> Arc<dyn PendingRewards> {
        match self {
            RewardCorrelation::Correlated => Arc::new(CorrelatedRewards::new()),
            RewardCorrelation::Fifo => Arc::new(FifoRewardQueue::new()),
        }
    }
}

impl FromStr for RewardCorrelation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "correlated" | "id" => Ok(RewardCorrelation::Correlated),
            "fifo" => Ok(RewardCorrelation::Fifo),
            other => Err(format!("unknown reward correlation '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_pairs_sequential_requests() {
        let queue = FifoRewardQueue::new();

        for n in 0..5 {
            let (id, rx) = queue.enqueue();
            assert!(queue.resolve(id, n as f64));
            assert_eq!(rx.await.unwrap(), n as f64);
            assert_eq!(queue.outstanding(), 0);
        }
    }

    #[tokio::test]
    async fn test_fifo_mispairs_overlapping_requests() {
        let queue = FifoRewardQueue::new();

        let (first_id, first_rx) = queue.enqueue();
        let (second_id, second_rx) = queue.enqueue();

        // The scorer answers the second request first.
        queue.resolve(second_id, 0.9);
        queue.resolve(first_id, 0.1);

        // Each waiter receives the other's score.
        assert_eq!(first_rx.await.unwrap(), 0.9);
        assert_eq!(second_rx.await.unwrap(), 0.1);
    }

    #[tokio::test]
    async fn test_correlated_pairs_overlapping_requests() {
        let rewards = CorrelatedRewards::new();

        let (first_id, first_rx) = rewards.enqueue();
        let (second_id, second_rx) = rewards.enqueue();
        assert_eq!(rewards.outstanding(), 2);

        rewards.resolve(second_id, 0.9);
        rewards.resolve(first_id, 0.1);

        assert_eq!(first_rx.await.unwrap(), 0.1);
        assert_eq!(second_rx.await.unwrap(), 0.9);
        assert_eq!(rewards.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_expire_completes_with_zero_and_is_idempotent() {
        let rewards = CorrelatedRewards::new();
        let (id, rx) = rewards.enqueue();

        assert!(rewards.expire(id));
        assert_eq!(rx.await.unwrap(), 0.0);
        assert!(!rewards.expire(id));
        assert!(!rewards.resolve(id, 1.0));

        let queue = FifoRewardQueue::new();
        assert!(!queue.expire(RequestId::new()));
    }

    #[test]
    fn test_correlation_parsing() {
        assert_eq!("FIFO".parse::<RewardCorrelation>().unwrap(), RewardCorrelation::Fifo);
        assert_eq!(
            "correlated".parse::<RewardCorrelation>().unwrap(),
            RewardCorrelation::Correlated
        );
        assert!("random".parse::<RewardCorrelation>().is_err());
    }
}
