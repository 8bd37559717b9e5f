use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use super::retry::{evaluate_retry, parse_retry_after, RetryCause, RetryPolicy};
use super::sse::SseDecoder;
use super::{ChatMessage, Embedder, Generator, GeneratorError, TextStream};

const ERROR_BODY_LIMIT: usize = 512;

/// Connection settings for one OpenAI-compatible endpoint. Embedding and
/// chat models usually live behind different base URLs, so each gets its own
/// client.
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    /// Requested embedding width; `None` leaves the provider default.
    pub dimensions: Option<u32>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

pub struct OpenAiClient {
    http: Client,
    settings: OpenAiSettings,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingEntry>,
}

#[derive(Deserialize)]
struct EmbeddingEntry {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiClient {
    pub fn new(settings: OpenAiSettings) -> Result<Self, GeneratorError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| GeneratorError::Network(format!("failed to build http client: {err}")))?;
        Ok(Self { http, settings })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    async fn post_with_retry<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, GeneratorError> {
        let url = self.endpoint(path);
        let mut attempt = 0u32;

        loop {
            let mut request = self.http.post(&url).json(body);
            if let Some(key) = self.settings.api_key.as_deref().filter(|key| !key.is_empty()) {
                request = request.bearer_auth(key);
            }

            let (error, cause) = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let retry_after = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| parse_retry_after(value, SystemTime::now()));
                    let body = response.text().await.unwrap_or_default();
                    (
                        GeneratorError::Http {
                            status: status.as_u16(),
                            message: truncate(&body, ERROR_BODY_LIMIT),
                        },
                        RetryCause::Http {
                            status,
                            retry_after,
                        },
                    )
                }
                Err(err) => (GeneratorError::Network(err.to_string()), RetryCause::Network),
            };

            let decision = evaluate_retry(cause, self.settings.retry, attempt);
            if !decision.should_retry {
                return Err(error);
            }

            warn!(
                "{} request failed ({}), retrying in {:?} (attempt {}/{})",
                path,
                error,
                decision.delay,
                attempt + 1,
                self.settings.retry.max_retries
            );
            tokio::time::sleep(decision.delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Generator for OpenAiClient {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, GeneratorError> {
        let request = ChatRequest {
            model: &self.settings.model,
            messages,
            temperature: self.settings.temperature,
            stream: false,
        };
        let response = self.post_with_retry("chat/completions", &request).await?;
        let payload = response
            .json::<ChatResponse>()
            .await
            .map_err(|err| GeneratorError::InvalidResponse(err.to_string()))?;

        payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| GeneratorError::InvalidResponse("response contained no choices".into()))
    }

    async fn generate_stream(&self, messages: &[ChatMessage]) -> Result<TextStream, GeneratorError> {
        let request = ChatRequest {
            model: &self.settings.model,
            messages,
            temperature: self.settings.temperature,
            stream: true,
        };
        let response = self.post_with_retry("chat/completions", &request).await?;
        debug!("streaming answer from {}", self.settings.model);

        let bytes = Box::pin(response.bytes_stream());
        let state = (bytes, SseDecoder::new(), VecDeque::new(), false);
        let fragments = stream::unfold(state, |(mut bytes, mut decoder, mut pending, mut ended)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (bytes, decoder, pending, ended)));
                }
                if ended || decoder.is_done() {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                    Some(Err(err)) => {
                        ended = true;
                        pending.push_back(Err(GeneratorError::Network(err.to_string())));
                    }
                    None => {
                        ended = true;
                        pending.extend(decoder.finish());
                    }
                }
            }
        });

        Ok(fragments.boxed())
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, GeneratorError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.settings.model,
            input: inputs,
            dimensions: self.settings.dimensions,
        };
        let response = self.post_with_retry("embeddings", &request).await?;
        let mut payload = response
            .json::<EmbeddingResponse>()
            .await
            .map_err(|err| GeneratorError::InvalidResponse(err.to_string()))?;

        if payload.data.len() != inputs.len() {
            return Err(GeneratorError::InvalidResponse(format!(
                "expected {} embeddings, received {}",
                inputs.len(),
                payload.data.len()
            )));
        }

        payload.data.sort_by_key(|entry| entry.index);
        Ok(payload.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

fn truncate(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("  short  ", 10), "short");
        assert_eq!(truncate("末影珍珠", 2), "末影…");
    }
}
