//! Language model client abstraction
//!
//! Stages only see `ModelClient::create`: a list of chat messages in, the
//! completion text out, with a cancellation token from the delivering message.

pub mod openai;

pub use openai::OpenAiCompatibleClient;

use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn create(
        &self,
        messages: &[ChatMessage],
        cancellation: &CancellationToken,
    ) -> Result<String>;
}

type Script = dyn Fn(&[ChatMessage]) -> Result<String> + Send + Sync;

/// Model client answering from a closure; counts requests.
///
/// Used for tests and offline dry runs.
pub struct ScriptedModelClient {
    script: Arc<Script>,
    calls: AtomicUsize,
}

impl ScriptedModelClient {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&[ChatMessage]) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn create(
        &self,
        messages: &[ChatMessage],
        cancellation: &CancellationToken,
    ) -> Result<String> {
        if cancellation.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent handlers interleave the way a network call would.
        tokio::task::yield_now().await;
        (self.script)(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_client_counts_and_answers() {
        let client = ScriptedModelClient::new(|messages| {
            Ok(format!("echo: {}", messages.last().map(|m| m.content.as_str()).unwrap_or("")))
        });
        let token = CancellationToken::new();

        let answer = client
            .create(&[ChatMessage::system("sys"), ChatMessage::user("hi")], &token)
            .await
            .unwrap();

        assert_eq!(answer, "echo: hi");
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_client_honours_cancellation() {
        let client = ScriptedModelClient::new(|_| Ok(String::new()));
        let token = CancellationToken::new();
        token.cancel();

        let result = client.create(&[ChatMessage::user("hi")], &token).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(client.calls(), 0);
    }
}
