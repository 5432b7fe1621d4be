//! Pipeline configuration
//!
//! Every knob is read from a `FINQA_*` environment variable (binaries load a
//! `.env` file first) and falls back to a default.

use crate::error::PipelineError;
use crate::mcts::reward::RewardCorrelation;
use crate::mcts::{MctsConfig, WeightScheduler};
use crate::Result;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: "http://0.0.0.0:8000/v1".to_string(),
            api_key: "placeholder".to_string(),
            model: "meta-llama/Llama-3.2-1B-Instruct".to_string(),
            temperature: 0.2,
            max_tokens: 1024,
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RewardSettings {
    /// How long a rollout waits for a score before using 0.0.
    pub timeout: Duration,
    pub correlation: RewardCorrelation,
}

impl Default for RewardSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            correlation: RewardCorrelation::Correlated,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub top_k: usize,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self { top_k: 4 }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub max_attempts: u32,
    pub sandbox_timeout: Duration,
    pub python: String,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            sandbox_timeout: Duration::from_secs(10),
            python: "python3".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationSettings {
    pub max_review_turns: u32,
    /// Reference formulas attached to each action-scoring prompt.
    pub related_formulas: usize,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            max_review_turns: 6,
            related_formulas: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    /// CSV report; `None` disables writing.
    pub report_path: Option<PathBuf>,
    pub evict_on_output: bool,
    /// Relative tolerance when judging output against the gold answer.
    pub eval_tolerance: f64,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            report_path: Some(PathBuf::from("output/results.csv")),
            evict_on_output: true,
            eval_tolerance: crate::eval::DEFAULT_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub model: ModelSettings,
    pub search: MctsConfig,
    pub reward: RewardSettings,
    pub extraction: ExtractionSettings,
    pub execution: ExecutionSettings,
    pub verification: VerificationSettings,
    pub output: OutputSettings,
    pub formula_file: Option<PathBuf>,
    pub port: u16,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = PipelineConfig::default();
        let env = Env(lookup);

        let model = ModelSettings {
            base_url: env.string("FINQA_MODEL_BASE_URL", defaults.model.base_url),
            api_key: env.string("FINQA_API_KEY", defaults.model.api_key),
            model: env.string("FINQA_MODEL_NAME", defaults.model.model),
            temperature: env.parse("FINQA_MODEL_TEMPERATURE", defaults.model.temperature)?,
            max_tokens: env.parse("FINQA_MODEL_MAX_TOKENS", defaults.model.max_tokens)?,
            request_timeout: env.seconds("FINQA_MODEL_TIMEOUT_SECS", defaults.model.request_timeout)?,
        };

        let search = MctsConfig {
            exploration_weight: env.parse("FINQA_MCTS_EXPLORATION", defaults.search.exploration_weight)?,
            weight_scheduler: env.parse::<WeightScheduler>("FINQA_MCTS_SCHEDULER", defaults.search.weight_scheduler)?,
            num_rollouts: env.parse("FINQA_MCTS_ROLLOUTS", defaults.search.num_rollouts)?,
            discount: env.parse("FINQA_MCTS_DISCOUNT", defaults.search.discount)?,
            max_concurrent_rollouts: env.parse("FINQA_MCTS_CONCURRENCY", defaults.search.max_concurrent_rollouts)?,
            seed: env.optional("FINQA_MCTS_SEED")?,
        };

        let reward = RewardSettings {
            timeout: env.seconds("FINQA_REWARD_TIMEOUT_SECS", defaults.reward.timeout)?,
            correlation: env.parse("FINQA_REWARD_CORRELATION", defaults.reward.correlation)?,
        };

        let extraction = ExtractionSettings {
            top_k: env.parse("FINQA_TOP_K_CHUNKS", defaults.extraction.top_k)?,
        };

        let execution = ExecutionSettings {
            max_attempts: env.parse("FINQA_MAX_EXECUTION_ATTEMPTS", defaults.execution.max_attempts)?,
            sandbox_timeout: env.seconds("FINQA_SANDBOX_TIMEOUT_SECS", defaults.execution.sandbox_timeout)?,
            python: env.string("FINQA_PYTHON", defaults.execution.python),
        };

        let verification = VerificationSettings {
            max_review_turns: env.parse("FINQA_MAX_REVIEW_TURNS", defaults.verification.max_review_turns)?,
            related_formulas: defaults.verification.related_formulas,
        };

        let report_path = match env.get("FINQA_REPORT_PATH") {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => defaults.output.report_path,
        };
        let output = OutputSettings {
            report_path,
            evict_on_output: env.parse("FINQA_EVICT_ON_OUTPUT", defaults.output.evict_on_output)?,
            eval_tolerance: env.parse("FINQA_EVAL_TOLERANCE", defaults.output.eval_tolerance)?,
        };

        if execution.max_attempts == 0 {
            return Err(PipelineError::ConfigError(
                "FINQA_MAX_EXECUTION_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            model,
            search,
            reward,
            extraction,
            execution,
            verification,
            output,
            formula_file: env.get("FINQA_FORMULA_FILE").map(PathBuf::from),
            port: env.parse("PORT", 8080)?,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn string(&self, key: &str, default: String) -> String {
        self.get(key).unwrap_or(default)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse::<T>().map_err(|e| {
                PipelineError::ConfigError(format!("{}={:?}: {}", key, raw, e))
            }),
            None => Ok(default),
        }
    }

    fn optional<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| {
                    PipelineError::ConfigError(format!("{}={:?}: {}", key, raw, e))
                })
            })
            .transpose()
    }

    fn seconds(&self, key: &str, default: Duration) -> Result<Duration> {
        let secs = self.parse::<f64>(key, default.as_secs_f64())?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(PipelineError::ConfigError(format!(
                "{} must be a non-negative number of seconds",
                key
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_documented_limits() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.reward.timeout, Duration::from_secs(10));
        assert_eq!(config.execution.max_attempts, 3);
        assert_eq!(config.execution.sandbox_timeout, Duration::from_secs(10));
        assert_eq!(config.verification.max_review_turns, 6);
        assert_eq!(config.reward.correlation, RewardCorrelation::Correlated);
        assert_eq!(config.port, 8080);
        assert!(config.output.evict_on_output);
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("FINQA_MCTS_ROLLOUTS", "0"),
            ("FINQA_MCTS_SCHEDULER", "lin"),
            ("FINQA_MCTS_SEED", "7"),
            ("FINQA_REWARD_CORRELATION", "fifo"),
            ("FINQA_REWARD_TIMEOUT_SECS", "0.5"),
            ("FINQA_REPORT_PATH", ""),
            ("FINQA_EVAL_TOLERANCE", "0.01"),
            ("PORT", "9000"),
        ]))
        .unwrap();

        assert_eq!(config.search.num_rollouts, 0);
        assert_eq!(config.search.weight_scheduler, WeightScheduler::Lin);
        assert_eq!(config.search.seed, Some(7));
        assert_eq!(config.reward.correlation, RewardCorrelation::Fifo);
        assert_eq!(config.reward.timeout, Duration::from_millis(500));
        assert!(config.output.report_path.is_none());
        assert_eq!(config.output.eval_tolerance, 0.01);
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let result = PipelineConfig::from_lookup(lookup(&[("FINQA_MCTS_ROLLOUTS", "many")]));
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));

        let result = PipelineConfig::from_lookup(lookup(&[("FINQA_MAX_EXECUTION_ATTEMPTS", "0")]));
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }
}
