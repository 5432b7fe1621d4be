//! Answer accuracy
//!
//! Pulls numbers out of a task's printed output and checks them against the
//! gold answer within a relative tolerance.

use crate::models::TaskContext;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

pub const DEFAULT_TOLERANCE: f64 = 0.02;

/// Values at or above this magnitude are rescaled to millions.
pub const LARGE_VALUE_THRESHOLD: f64 = 1_000_000.0;

lazy_static! {
    static ref NUMBER: Regex = Regex::new(r"[-+]?\$?\d*\.?\d+").unwrap();
}

/// Python-style rounding to `decimals` places (ties to even).
fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round_ties_even() / scale
}

/// Every number in `text`. Commas are dropped and `$` prefixes accepted. With
/// `normalize_large`, values of a million or more are expressed in millions
/// rounded to two places, the unit gold answers use.
pub fn extract_numbers(text: &str, normalize_large: bool) -> Vec<f64> {
    let cleaned = text.replace(',', "");
    NUMBER
        .find_iter(cleaned.trim())
        .filter_map(|m| m.as_str().replace('$', "").parse::<f64>().ok())
        .map(|value| {
            if normalize_large && value.abs() >= LARGE_VALUE_THRESHOLD {
                round_to(value / LARGE_VALUE_THRESHOLD, 2)
            } else {
                value
            }
        })
        .collect()
}

/// Parse a gold answer like `"1,234.56"`, rounded to one decimal place.
pub fn normalize_number(value: &str) -> Option<f64> {
    value
        .replace(',', "")
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| round_to(v, 1))
}

/// Whether any candidate's magnitude lies within `tolerance` of the answer.
pub fn within_tolerance(answer: f64, candidates: &[f64], tolerance: f64) -> bool {
    let magnitude = answer.abs();
    let lower = round_to(magnitude * (1.0 - tolerance), 1);
    let upper = round_to(magnitude * (1.0 + tolerance), 1);
    candidates
        .iter()
        .any(|candidate| (lower..=upper).contains(&candidate.abs()))
}

/// Correctness judgement for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub answer: f64,
    pub extracted_numbers: Vec<f64>,
    pub correct: bool,
    pub token_length: usize,
    pub tolerance: f64,
}

/// Judge `output` against `answer`; `None` when the answer is not numeric.
pub fn evaluate(answer: &str, output: &str, tolerance: f64) -> Option<Evaluation> {
    let answer = normalize_number(answer)?;
    let extracted_numbers = extract_numbers(output, true);
    Some(Evaluation {
        answer,
        correct: within_tolerance(answer, &extracted_numbers, tolerance),
        extracted_numbers,
        token_length: output.split_whitespace().count(),
        tolerance,
    })
}

/// Judge the latest execution output of a task that carries a gold answer.
pub fn evaluate_context(context: &TaskContext, tolerance: f64) -> Option<Evaluation> {
    let answer = context.input.answer.as_deref()?;
    let output = context.latest_execute()?.output.as_str();
    evaluate(answer, output, tolerance)
}

/// Running accuracy over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Accuracy {
    pub correct: usize,
    pub evaluated: usize,
}

impl Accuracy {
    pub fn record(&mut self, evaluation: &Evaluation) {
        self.evaluated += 1;
        if evaluation.correct {
            self.correct += 1;
        }
    }

    /// Percentage correct; zero when nothing was evaluated.
    pub fn rate(&self) -> f64 {
        if self.evaluated == 0 {
            return 0.0;
        }
        self.correct as f64 / self.evaluated as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_numbers_formats() {
        assert_eq!(extract_numbers("Conclusion: $3.76", false), vec![3.76]);
        assert_eq!(extract_numbers("[[456]] and -12", false), vec![456.0, -12.0]);
        assert_eq!(extract_numbers("total 1,234.5", false), vec![1234.5]);
        assert_eq!(extract_numbers(".5 of it", false), vec![0.5]);
        assert!(extract_numbers("no digits here", true).is_empty());
    }

    #[test]
    fn test_large_values_rescaled_to_millions() {
        assert_eq!(extract_numbers("$12,345,678", true), vec![12.35]);
        assert_eq!(extract_numbers("$12,345,678", false), vec![12_345_678.0]);
        assert_eq!(extract_numbers("999999", true), vec![999_999.0]);
    }

    #[test]
    fn test_normalize_number() {
        assert_eq!(normalize_number(" 1,234.56 "), Some(1234.6));
        assert_eq!(normalize_number("85.0"), Some(85.0));
        assert_eq!(normalize_number("-0.25"), Some(-0.2));
        assert_eq!(normalize_number("n/a"), None);
    }

    #[test]
    fn test_tolerance_window() {
        assert!(within_tolerance(25.0, &[0.0, 25.4], 0.02));
        assert!(!within_tolerance(25.0, &[26.0], 0.02));
        assert!(within_tolerance(-25.0, &[-24.6], 0.02));
        assert!(!within_tolerance(25.0, &[], 0.02));
    }

    #[test]
    fn test_evaluate_pipeline_output() {
        let output = "[subprocess]\nexitcode: 0 (execution succeeded)\nCode output: 25.0\n[inline]\n25.0";
        let evaluation = evaluate("25.0", output, DEFAULT_TOLERANCE).unwrap();
        assert!(evaluation.correct);
        assert!(evaluation.extracted_numbers.contains(&25.0));
        assert_eq!(evaluation.token_length, 10);

        assert!(!evaluate("30", output, DEFAULT_TOLERANCE).unwrap().correct);
        assert!(evaluate("unknown", output, DEFAULT_TOLERANCE).is_none());
    }

    #[test]
    fn test_accuracy_rate() {
        let mut accuracy = Accuracy::default();
        assert_eq!(accuracy.rate(), 0.0);
        for answer in ["25", "25", "40", "25"] {
            accuracy.record(&evaluate(answer, "25.0", DEFAULT_TOLERANCE).unwrap());
        }
        assert_eq!(accuracy.correct, 3);
        assert_eq!(accuracy.rate(), 75.0);
    }
}
