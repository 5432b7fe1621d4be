//! Prompt text for every model request the stages make

use crate::models::{ExecuteResult, ExtractResult, ReasonResult, TaskInput};
use crate::reasoner::actions::ReasoningAction;
use crate::retrieval::{FormulaEntry, ScoredChunk};

pub const SYSTEM_REASONER: &str = "You are a financial analyst. Work out which formula answers \
the question and which variables it needs. Describe each variable as `Variable N: <description>` \
and give the formula as `Formula: <expression>`.";

pub const SYSTEM_EXTRACTOR: &str = "You are a financial data extractor. Given variable \
descriptions and passages from a report, state the numeric value of every variable as \
`<name> = <value>`. Use only numbers present in the passages.";

pub const SYSTEM_EXECUTOR: &str = "You are a Python programmer. Write a short, self-contained \
Python script that computes the answer from the given formula and values and prints the final \
number. Return only the code in a ```python block.";

pub const SYSTEM_VERIFIER: &str = "You are a senior financial reviewer. Judge the reasoning, the \
extracted values and the computed answer. Reply with a JSON object with the keys \
\"Reasoner Comment\", \"Extractor Comment\", \"Executor Comment\" and \"Approved\" (true or false).";

pub const SYSTEM_ACTION_SCORER: &str = "You evaluate how useful a reasoning step is for answering \
a financial question. Reply with a JSON object {\"score\": <number between 0 and 1>, \
\"comment\": <text>}.";

pub const SYSTEM_CODE_REVIEWER: &str = "You review Python code line by line against the question \
it is meant to answer and its execution output. Reply with a JSON object {\"comment\": <text>, \
\"Approved\": true or false}.";

pub fn reason_action_prompt(input: &TaskInput, action: &ReasoningAction, previous: &str) -> String {
    let mut prompt = format!(
        "Question: {}\n\nStep: {}\n{}\n",
        input.question, action.name, action.instruction
    );
    if !previous.is_empty() {
        prompt.push_str(&format!("\nFindings so far:\n{}\n", previous));
    }
    prompt
}

pub fn extract_prompt(
    question: &str,
    variables: &str,
    chunks: &[ScoredChunk],
    review: Option<&str>,
) -> String {
    let passages = chunks
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[{}] {}", i + 1, c.chunk))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut prompt = format!(
        "Question: {}\n\nVariables: {}\n\nPassages:\n{}\n",
        question, variables, passages
    );
    if let Some(review) = review {
        prompt.push_str(&format!("\nA reviewer commented on the previous extraction:\n{}\n", review));
    }
    prompt
}

pub fn execute_initial_prompt(
    question: &str,
    reason: &ReasonResult,
    extract: &ExtractResult,
) -> String {
    format!(
        "Question: {}\n\nFormula:\n{}\n\n{}\n\nWrite the Python code that computes the answer.",
        question, reason.formula, extract.extracted
    )
}

pub fn execute_refine_prompt(
    question: &str,
    reason: &ReasonResult,
    extract: &ExtractResult,
    previous: &ExecuteResult,
) -> String {
    format!(
        "Question: {}\n\nFormula:\n{}\n\n{}\n\nPrevious code:\n```python\n{}\n```\n\n\
         Reviewer comment:\n{}\n\nRewrite the code to address the review.",
        question, reason.formula, extract.extracted, previous.code, previous.review
    )
}

pub fn execution_error_prompt(error: &str, original: &str) -> String {
    format!(
        "The previous code failed with:\n{}\n\nFix the error.\n\n{}",
        error, original
    )
}

pub fn score_action_prompt(
    question: &str,
    action: &str,
    instruction: &str,
    formulas: &[FormulaEntry],
) -> String {
    let mut prompt = format!(
        "Question: {}\n\nCandidate step: {}\n{}\n",
        question, action, instruction
    );
    if !formulas.is_empty() {
        prompt.push_str("\nRelated formulas:\n");
        for entry in formulas {
            prompt.push_str(&format!("- {}: {}", entry.formula_name, entry.formula));
            if !entry.meaning.is_empty() {
                prompt.push_str(&format!(" ({})", entry.meaning));
            }
            prompt.push('\n');
        }
    }
    prompt
}

pub fn review_code_prompt(question: &str, execute: &ExecuteResult) -> String {
    format!(
        "Question: {}\n\nCode:\n```python\n{}\n```\n\nExecution output:\n{}\n",
        question, execute.code, execute.output
    )
}

pub fn final_review_prompt(
    input: &TaskInput,
    reason: &ReasonResult,
    extract: &ExtractResult,
    execute: &ExecuteResult,
) -> String {
    format!(
        "Question: {}\n\nReasoning:\n{}\n\nExtraction:\n{}\n\nCode:\n```python\n{}\n```\n\n\
         Output:\n{}\n",
        input.question, reason.raw_response, extract.extracted, execute.code, execute.output
    )
}
