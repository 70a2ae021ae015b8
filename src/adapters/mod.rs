//! Gateway adapter trait and host-facing chat types.
//!
//! The host hands us an OpenAI-style chat body; adapters speak the
//! gateway's Gemini dialect. The pipe only ever talks to the trait, so
//! tests can swap in a scripted gateway.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod edgeone;
pub mod gemini;

use gemini::{GenerateContentRequest, GenerateContentResponse, ThinkingLevel};

// ── Host Types ──────────────────────────────────────────────────────

/// A chat request as sent by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Token budget for Gemini 2.5 models (-1 = dynamic, 0 = off).
    #[serde(default)]
    pub thinking_budget: Option<i32>,
    /// Reasoning depth for Gemini 3 models.
    #[serde(default)]
    pub thinking_level: Option<ThinkingLevel>,
    #[serde(default)]
    pub include_thoughts: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String, // "user" | "assistant" | "system"
    #[serde(default)]
    pub content: MessageContent,
}

/// Message content: either plain text or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Text fragments of this message. Non-text parts are dropped.
    pub fn texts(&self) -> Vec<&str> {
        match self {
            MessageContent::Text(text) if !text.trim().is_empty() => vec![text.as_str()],
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .filter(|t| !t.trim().is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Chat-completion-shaped reply handed back to the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOutput {
    pub model: String,
    pub content: String,
    /// Thought summary, rendered by the host as a collapsible section.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub reasoning_tokens: u64,
    pub total_tokens: u64,
}

/// A model entry for the host's model picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
}

// ── Gateway Trait ───────────────────────────────────────────────────

/// An upstream that serves Gemini `generateContent` calls.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Send one request with the given key.
    /// The key must not be stored or logged.
    async fn generate(
        &self,
        model: &str,
        body: &GenerateContentRequest,
        key: &str,
    ) -> Result<GenerateContentResponse>;
}
