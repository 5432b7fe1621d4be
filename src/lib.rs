//! Financial question answering pipeline
//!
//! Answers numeric questions over financial passages with a chain of
//! model-backed stages talking over a publish/subscribe bus:
//! - a reasoning stage that orders reasoning actions with Monte Carlo tree
//!   search, scoring each action through the verifier
//! - an extraction stage that pulls variable values from BM25-ranked chunks
//! - an execution stage that writes code and runs it on two backends with
//!   bounded error retries
//! - a verification stage that reviews the code in a bounded loop
//! - an output stage that appends every finished task to a CSV report
//!
//! SUBMIT → REASON → EXTRACT → EXECUTE ⇄ VERIFY → OUTPUT

pub mod agent;
pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod eval;
pub mod execution;
pub mod extractor;
pub mod llm;
pub mod mcts;
pub mod models;
pub mod output;
pub mod parsing;
pub mod prompts;
pub mod reasoner;
pub mod retrieval;
pub mod sandbox;
pub mod state;
pub mod verification;

pub use error::{PipelineError, Result};

// Re-export common types
pub use agent::{Components, Pipeline};
pub use config::PipelineConfig;
pub use models::*;
pub use output::TaskOutcome;
