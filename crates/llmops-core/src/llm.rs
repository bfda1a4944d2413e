//! Language-model collaborator interface.
//!
//! The core consumes two narrow surfaces: text completion through
//! [`LanguageModel`] and a pure token-count function through
//! [`TokenCounter`]. Embedding lives in [`crate::embedding`].

use async_trait::async_trait;
use std::sync::Mutex;

/// Sampling knobs forwarded to the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A text-completion model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier reported in node outputs.
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str, params: &CompletionParams) -> anyhow::Result<String>;
}

/// Pure token-count function used by the splitter and the segment counters.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Approximates tokens as one per four characters, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// Counts one token per character.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenCounter;

impl TokenCounter for CharTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        text.chars().count()
    }
}

/// Deterministic model for offline runs and tests.
///
/// Each rule is a `(needle, reply)` pair; the first rule whose needle
/// occurs in the prompt wins. Otherwise the fallback reply is returned.
/// Every prompt is recorded.
pub struct ScriptedModel {
    name: String,
    rules: Vec<(String, String)>,
    fallback: String,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(fallback: &str) -> Self {
        Self {
            name: "scripted".to_string(),
            rules: Vec::new(),
            fallback: fallback.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_rule(mut self, needle: &str, reply: &str) -> Self {
        self.rules.push((needle.to_string(), reply.to_string()));
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &str, _params: &CompletionParams) -> anyhow::Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let reply = self
            .rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.fallback.clone());
        Ok(reply)
    }
}
