//! Search state for one point in an action sequence

use serde::{Deserialize, Serialize};

/// Actions taken so far, their rewards, and what is left to try.
///
/// `action_rewards` lags `actions_taken` by one while the newest action is
/// waiting for its score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningNode {
    pub actions_taken: Vec<String>,
    pub action_index: usize,
    pub action_rewards: Vec<f64>,
    pub possible_actions: Vec<String>,
    pub total_actions: usize,
}

impl ReasoningNode {
    pub fn root(catalog: &[String]) -> Self {
        Self {
            actions_taken: Vec::new(),
            action_index: 0,
            action_rewards: Vec::new(),
            possible_actions: catalog.to_vec(),
            total_actions: catalog.len(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.action_index >= self.total_actions
    }

    /// Mean of the rewards collected so far.
    pub fn reward(&self) -> f64 {
        if self.action_rewards.is_empty() {
            return 0.0;
        }
        self.action_rewards.iter().sum::<f64>() / self.action_rewards.len() as f64
    }

    pub fn last_action(&self) -> Option<&str> {
        self.actions_taken.last().map(String::as_str)
    }

    pub fn awaiting_reward(&self) -> bool {
        self.action_rewards.len() < self.actions_taken.len()
    }

    /// The state after taking `action`, with its reward if already known.
    pub fn take(&self, action: &str, reward: Option<f64>) -> Self {
        let mut action_rewards = self.action_rewards.clone();
        action_rewards.extend(reward);

        let mut actions_taken = self.actions_taken.clone();
        actions_taken.push(action.to_string());

        Self {
            actions_taken,
            action_index: self.action_index + 1,
            action_rewards,
            possible_actions: self
                .possible_actions
                .iter()
                .filter(|a| a.as_str() != action)
                .cloned()
                .collect(),
            total_actions: self.total_actions,
        }
    }

    /// One unscored child per remaining action.
    pub fn children(&self) -> Vec<ReasoningNode> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.possible_actions
            .iter()
            .map(|action| self.take(action, None))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    #[test]
    fn test_children_remove_taken_action() {
        let root = ReasoningNode::root(&catalog());
        let children = root.children();

        assert_eq!(children.len(), 3);
        assert_eq!(children[1].actions_taken, vec!["b".to_string()]);
        assert_eq!(children[1].possible_actions, vec!["a".to_string(), "c".to_string()]);
        assert!(children[1].awaiting_reward());
    }

    #[test]
    fn test_terminal_after_all_actions() {
        let node = ReasoningNode::root(&catalog())
            .take("a", Some(1.0))
            .take("b", Some(0.5))
            .take("c", Some(0.0));

        assert!(node.is_terminal());
        assert!(node.children().is_empty());
        assert!((node.reward() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_reward_is_zero() {
        assert_eq!(ReasoningNode::root(&catalog()).reward(), 0.0);
    }
}
