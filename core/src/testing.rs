//! Deterministic stand-ins for the model capabilities, used by the test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::ai::{ChatMessage, Embedder, Generator, GeneratorError, TextStream};

const DIMENSIONS: usize = 64;

/// Bag-of-words embedder: every lowercase alphanumeric token is hashed into
/// one of a fixed number of buckets. Texts sharing a token always score above
/// zero, texts sharing none score (almost always) zero.
#[derive(Debug, Default)]
pub struct HashingEmbedder {
    calls: AtomicUsize,
}

impl HashingEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; DIMENSIONS];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let bucket = fnv1a(&token.to_lowercase()) as usize % DIMENSIONS;
            vector[bucket] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(inputs.iter().map(|input| Self::vector(input)).collect())
    }
}

fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

type Script = dyn Fn(&[ChatMessage]) -> Result<String, GeneratorError> + Send + Sync;

/// Generator that answers through a closure and records every prompt.
/// Streams are cut into fragments of `fragment_chars` characters.
pub struct ScriptedGenerator {
    script: Box<Script>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
    fragment_chars: usize,
}

impl ScriptedGenerator {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&[ChatMessage]) -> Result<String, GeneratorError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            prompts: Mutex::new(Vec::new()),
            fragment_chars: 3,
        }
    }

    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    fn answer(&self, messages: &[ChatMessage]) -> Result<String, GeneratorError> {
        if let Ok(mut guard) = self.prompts.lock() {
            guard.push(messages.to_vec());
        }
        (self.script)(messages)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, GeneratorError> {
        self.answer(messages)
    }

    async fn generate_stream(&self, messages: &[ChatMessage]) -> Result<TextStream, GeneratorError> {
        let answer = self.answer(messages)?;
        let chars: Vec<char> = answer.chars().collect();
        let fragments: Vec<Result<String, GeneratorError>> = chars
            .chunks(self.fragment_chars.max(1))
            .map(|chunk| Ok(chunk.iter().collect()))
            .collect();
        Ok(stream::iter(fragments).boxed())
    }
}

/// Text of the last user message in a prompt.
pub fn user_text(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|message| message.role == crate::ai::Role::User)
        .map(|message| message.content.as_str())
        .unwrap_or_default()
}
