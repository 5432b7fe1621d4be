//! Monte-Carlo tree search over reasoning action sequences
//!
//! Nodes live in an arena owned by one search; parents and children are
//! indices into it. Rewards come from an async `RewardSource`, so every
//! rollout suspends while an action is being scored. The arena lock is only
//! taken between those suspensions.

pub mod node;
pub mod reward;

pub use node::ReasoningNode;
pub use reward::{CorrelatedRewards, FifoRewardQueue, PendingRewards, RequestId, RewardCorrelation};

use async_trait::async_trait;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Supplies the score of a single action.
#[async_trait]
pub trait RewardSource: Send + Sync {
    async fn reward(&self, action: &str) -> f64;
}

/// How the exploration weight decays over the rollouts of one search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightScheduler {
    Exp,
    Lin,
    Const,
}

impl WeightScheduler {
    pub fn weight(&self, base: f64, rollout_id: usize, num_rollouts: usize) -> f64 {
        let progress = if num_rollouts == 0 {
            0.0
        } else {
            rollout_id as f64 / num_rollouts as f64
        };
        match self {
            WeightScheduler::Exp => base * 0.1f64.powf(progress),
            WeightScheduler::Lin => base * (1.0 - 0.9 * progress),
            WeightScheduler::Const => base,
        }
    }
}

impl FromStr for WeightScheduler {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exp" => Ok(WeightScheduler::Exp),
            "lin" => Ok(WeightScheduler::Lin),
            "const" => Ok(WeightScheduler::Const),
            other => Err(format!("unknown weight scheduler '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MctsConfig {
    pub exploration_weight: f64,
    pub weight_scheduler: WeightScheduler,
    pub num_rollouts: usize,
    pub discount: f64,
    pub max_concurrent_rollouts: usize,
    /// Fixed seed for reproducible searches.
    pub seed: Option<u64>,
}

impl Default for MctsConfig {
    fn default() -> Self {
        Self {
            exploration_weight: 1.414,
            weight_scheduler: WeightScheduler::Exp,
            num_rollouts: 16,
            discount: 1.0,
            max_concurrent_rollouts: 1,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best_actions: Vec<String>,
    pub rollouts: usize,
    pub tree_size: usize,
}

#[derive(Debug)]
struct TreeEntry {
    node: ReasoningNode,
    parent: Option<usize>,
    /// `None` until expanded; terminal nodes expand to an empty list.
    children: Option<Vec<usize>>,
    q: f64,
    n: u32,
    explored: bool,
}

impl TreeEntry {
    fn new(node: ReasoningNode, parent: Option<usize>) -> Self {
        Self {
            node,
            parent,
            children: None,
            q: 0.0,
            n: 0,
            explored: false,
        }
    }

    fn mean(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.q / self.n as f64
        }
    }
}

#[derive(Debug, Default)]
struct Arena {
    entries: Vec<TreeEntry>,
}

impl Arena {
    fn with_root(root: ReasoningNode) -> Self {
        Self {
            entries: vec![TreeEntry::new(root, None)],
        }
    }

    fn push(&mut self, node: ReasoningNode, parent: usize) -> usize {
        self.entries.push(TreeEntry::new(node, Some(parent)));
        self.entries.len() - 1
    }

    /// Path from the root to the node a rollout should work on.
    fn select(&self, weight: f64, rng: &mut StdRng) -> Vec<usize> {
        let mut path = vec![0];
        let mut current = 0;

        loop {
            let children = match &self.entries[current].children {
                Some(children) if !children.is_empty() => children,
                _ => return path,
            };

            let unexplored: Vec<usize> = children
                .iter()
                .copied()
                .filter(|&c| !self.entries[c].explored)
                .collect();
            if let Some(&pick) = unexplored.choose(rng) {
                path.push(pick);
                return path;
            }

            current = self.uct_select(current, children, weight);
            path.push(current);
        }
    }

    fn uct_select(&self, parent: usize, children: &[usize], weight: f64) -> usize {
        let parent_visits = self.entries[parent].n.max(1) as f64;
        let uct = |c: usize| {
            let entry = &self.entries[c];
            if entry.n == 0 {
                return f64::INFINITY;
            }
            entry.mean() + weight * (parent_visits.ln() / entry.n as f64).sqrt()
        };

        children
            .iter()
            .copied()
            .max_by(|&a, &b| uct(a).total_cmp(&uct(b)))
            .unwrap_or(parent)
    }

    fn expand(&mut self, index: usize) {
        if self.entries[index].children.is_some() {
            return;
        }
        let children: Vec<usize> = self.entries[index]
            .node
            .children()
            .into_iter()
            .map(|child| self.push(child, index))
            .collect();
        self.entries[index].children = Some(children);
    }

    fn backpropagate(&mut self, path: &[usize], reward: f64, discount: f64) {
        let mut value = reward;
        for &index in path.iter().rev() {
            let entry = &mut self.entries[index];
            entry.q += value;
            entry.n += 1;
            entry.explored = true;
            value *= discount;
        }
    }

    /// Follow the best child (mean value, then visits) from the root.
    fn best_sequence(&self) -> Vec<String> {
        let mut actions = Vec::new();
        let mut current = 0;

        while let Some(children) = &self.entries[current].children {
            let best = children.iter().copied().max_by(|&a, &b| {
                let (ea, eb) = (&self.entries[a], &self.entries[b]);
                ea.mean().total_cmp(&eb.mean()).then(ea.n.cmp(&eb.n))
            });
            let Some(best) = best else { break };

            if let Some(action) = self.entries[best].node.last_action() {
                actions.push(action.to_string());
            }
            current = best;
        }

        actions
    }

    fn depth(&self, mut index: usize) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.entries[index].parent {
            depth += 1;
            index = parent;
        }
        depth
    }
}

/// Runs searches with a fixed configuration.
pub struct MctsSearcher {
    config: MctsConfig,
}

impl MctsSearcher {
    pub fn new(config: MctsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MctsConfig {
        &self.config
    }

    /// Start every rollout at once (bounded by the concurrency limit) and
    /// return the best action sequence found.
    pub async fn search(&self, root: ReasoningNode, rewards: &dyn RewardSource) -> SearchOutcome {
        let arena = Mutex::new(Arena::with_root(root));
        let semaphore = Semaphore::new(self.config.max_concurrent_rollouts.max(1));

        debug!(
            rollouts = self.config.num_rollouts,
            concurrency = self.config.max_concurrent_rollouts,
            "Starting search"
        );

        let rollouts = (0..self.config.num_rollouts)
            .map(|rollout_id| self.rollout(rollout_id, &arena, &semaphore, rewards));
        join_all(rollouts).await;

        let arena = lock(&arena);
        let outcome = SearchOutcome {
            best_actions: arena.best_sequence(),
            rollouts: self.config.num_rollouts,
            tree_size: arena.entries.len(),
        };

        info!(
            rollouts = outcome.rollouts,
            tree_size = outcome.tree_size,
            best = ?outcome.best_actions,
            "Search finished"
        );
        outcome
    }

    async fn rollout(
        &self,
        rollout_id: usize,
        arena: &Mutex<Arena>,
        semaphore: &Semaphore,
        rewards: &dyn RewardSource,
    ) {
        // The semaphore is never closed.
        let Ok(_permit) = semaphore.acquire().await else {
            return;
        };

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(rollout_id as u64)),
            None => StdRng::from_entropy(),
        };
        let weight = self.config.weight_scheduler.weight(
            self.config.exploration_weight,
            rollout_id,
            self.config.num_rollouts,
        );

        // Select
        let (path, pending) = {
            let arena = lock(arena);
            let path = arena.select(weight, &mut rng);
            let leaf = &arena.entries[path[path.len() - 1]].node;
            let pending = if leaf.awaiting_reward() {
                leaf.last_action().map(str::to_string)
            } else {
                None
            };
            (path, pending)
        };
        let leaf = path[path.len() - 1];

        // Score the leaf's own action the first time it is reached.
        if let Some(action) = pending {
            let score = rewards.reward(&action).await;
            let mut arena = lock(arena);
            let node = &mut arena.entries[leaf].node;
            if node.awaiting_reward() {
                node.action_rewards.push(score);
            }
        }

        // Expand
        let mut state = {
            let mut arena = lock(arena);
            arena.expand(leaf);
            arena.entries[leaf].node.clone()
        };

        // Simulate
        while !state.is_terminal() {
            let Some(action) = state.possible_actions.choose(&mut rng).cloned() else {
                break;
            };
            let score = rewards.reward(&action).await;
            state = state.take(&action, Some(score));
        }

        // Backpropagate
        let reward = state.reward();
        let mut arena = lock(arena);
        arena.backpropagate(&path, reward, self.config.discount);

        debug!(
            rollout_id,
            depth = arena.depth(leaf),
            reward,
            "Rollout complete"
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedRewards {
        scores: HashMap<String, f64>,
        calls: AtomicUsize,
    }

    impl FixedRewards {
        fn new(pairs: &[(&str, f64)]) -> Self {
            Self {
                scores: pairs.iter().map(|(a, s)| (a.to_string(), *s)).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RewardSource for FixedRewards {
        async fn reward(&self, action: &str) -> f64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.scores.get(action).copied().unwrap_or(0.0)
        }
    }

    fn catalog() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    fn config(num_rollouts: usize, concurrency: usize) -> MctsConfig {
        MctsConfig {
            num_rollouts,
            max_concurrent_rollouts: concurrency,
            weight_scheduler: WeightScheduler::Const,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_zero_rollouts_yield_empty_sequence() {
        let rewards = FixedRewards::new(&[("a", 1.0)]);
        let searcher = MctsSearcher::new(config(0, 1));

        let outcome = searcher.search(ReasoningNode::root(&catalog()), &rewards).await;

        assert!(outcome.best_actions.is_empty());
        assert_eq!(outcome.tree_size, 1);
        assert_eq!(rewards.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_enough_rollouts_produce_full_permutation() {
        let rewards = FixedRewards::new(&[("a", 1.0), ("b", 0.5), ("c", 0.2)]);
        let searcher = MctsSearcher::new(config(60, 1));

        let outcome = searcher.search(ReasoningNode::root(&catalog()), &rewards).await;

        let mut actions = outcome.best_actions.clone();
        actions.sort();
        assert_eq!(actions, catalog());
        // root + 3 + 6 + 6
        assert_eq!(outcome.tree_size, 16);
    }

    #[tokio::test]
    async fn test_concurrent_rollouts_complete() {
        let rewards = FixedRewards::new(&[("a", 1.0), ("b", 0.5), ("c", 0.2)]);
        let searcher = MctsSearcher::new(config(24, 4));

        let outcome = searcher.search(ReasoningNode::root(&catalog()), &rewards).await;

        assert_eq!(outcome.rollouts, 24);
        assert!(!outcome.best_actions.is_empty());
        assert!(rewards.calls.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_best_sequence_prefers_mean_then_visits() {
        let root = ReasoningNode::root(&catalog());
        let mut arena = Arena::with_root(root);
        arena.expand(0);
        let children = arena.entries[0].children.clone().unwrap();

        // a: mean 0.5 over 4 visits, b: mean 0.8 over 1 visit, c: mean 0.8 over 3 visits
        for (&child, (q, n)) in children.iter().zip([(2.0, 4), (0.8, 1), (2.4, 3)]) {
            arena.entries[child].q = q;
            arena.entries[child].n = n;
        }

        assert_eq!(arena.best_sequence(), vec!["c".to_string()]);
    }

    #[test]
    fn test_weight_schedules() {
        let w = 1.0;
        assert!((WeightScheduler::Exp.weight(w, 0, 10) - 1.0).abs() < 1e-9);
        assert!((WeightScheduler::Exp.weight(w, 10, 10) - 0.1).abs() < 1e-9);
        assert!((WeightScheduler::Lin.weight(w, 5, 10) - 0.55).abs() < 1e-9);
        assert_eq!(WeightScheduler::Const.weight(w, 9, 10), 1.0);
        assert!("cubic".parse::<WeightScheduler>().is_err());
    }

    #[test]
    fn test_backpropagate_applies_discount() {
        let mut arena = Arena::with_root(ReasoningNode::root(&catalog()));
        arena.expand(0);
        let child = arena.entries[0].children.as_ref().unwrap()[0];

        arena.backpropagate(&[0, child], 1.0, 0.5);

        assert_eq!(arena.entries[child].q, 1.0);
        assert_eq!(arena.entries[0].q, 0.5);
        assert!(arena.entries[0].explored && arena.entries[child].explored);
    }
}
