pub mod openai;
pub mod retry;
pub mod sse;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use openai::{OpenAiClient, OpenAiSettings};

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("provider returned an unexpected payload: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

/// Ordered fragments of a generated answer. Concatenating every fragment in
/// order yields the full answer.
pub type TextStream = BoxStream<'static, Result<String, GeneratorError>>;

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, GeneratorError>;

    /// Streams the answer. Providers without incremental output yield the
    /// complete answer as a single fragment.
    async fn generate_stream(&self, messages: &[ChatMessage]) -> Result<TextStream, GeneratorError> {
        let answer = self.generate(messages).await?;
        Ok(stream::once(async move { Ok(answer) }).boxed())
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns one vector per input, in input order.
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, GeneratorError>;
}

/// Drains a fragment stream into one string.
pub async fn collect_stream(mut stream: TextStream) -> Result<String, GeneratorError> {
    let mut answer = String::new();
    while let Some(fragment) = stream.next().await {
        answer.push_str(&fragment?);
    }
    Ok(answer)
}
