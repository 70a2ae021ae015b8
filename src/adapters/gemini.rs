//! Gemini `generateContent` wire types and conversion to/from host types.

use serde::{Deserialize, Serialize};

use super::{ChatOutput, ChatRequest, Usage};
use crate::config::PIPE_ID;
use crate::error::{PipeError, Result};

// ── Request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

impl GenerationConfig {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Thinking knobs, passed through as given.
///
/// Gemini 3 models take `thinkingLevel`, Gemini 2.5 models take
/// `thinkingBudget`. Sending both is rejected upstream on Gemini 3.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<ThinkingLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_thoughts: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "SCREAMING_SNAKE_CASE", deserialize = "lowercase"))]
pub enum ThinkingLevel {
    Minimal,
    Low,
    Medium,
    High,
}

// ── Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<ResponseContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseContent {
    #[serde(default)]
    pub parts: Vec<ResponsePart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponsePart {
    #[serde(default)]
    pub text: Option<String>,
    /// Set on thought-summary parts.
    #[serde(default)]
    pub thought: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageMetadata {
    pub prompt_token_count: u64,
    pub candidates_token_count: u64,
    pub thoughts_token_count: u64,
    pub total_token_count: u64,
}

// ── Conversion ──────────────────────────────────────────────────────

/// Model id to send upstream. The host prefixes ids with the pipe id.
pub fn target_model(model: &str) -> &str {
    model
        .strip_prefix(PIPE_ID)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(model)
}

/// Translate a host chat body into a `generateContent` request.
pub fn build_request(req: &ChatRequest) -> Result<GenerateContentRequest> {
    let mut contents = Vec::new();
    let mut system_parts = Vec::new();

    for msg in &req.messages {
        let parts: Vec<Part> = msg
            .content
            .texts()
            .into_iter()
            .map(|t| Part { text: t.to_string() })
            .collect();
        if parts.is_empty() {
            continue;
        }

        let role = match msg.role.as_str() {
            "system" => {
                system_parts.extend(parts);
                continue;
            }
            "assistant" => "model",
            _ => "user",
        };
        contents.push(Content {
            role: Some(role.to_string()),
            parts,
        });
    }

    if contents.is_empty() {
        return Err(PipeError::EmptyConversation);
    }

    let thinking = ThinkingConfig {
        thinking_budget: req.thinking_budget,
        thinking_level: req.thinking_level,
        include_thoughts: req.include_thoughts,
    };
    let generation = GenerationConfig {
        temperature: req.temperature,
        max_output_tokens: req.max_tokens,
        top_p: req.top_p,
        thinking_config: (thinking != ThinkingConfig::default()).then_some(thinking),
    };

    Ok(GenerateContentRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| Content {
            role: None,
            parts: system_parts,
        }),
        generation_config: (!generation.is_empty()).then_some(generation),
    })
}

/// Fold a `generateContent` response into host output, splitting
/// thought parts into the reasoning channel.
pub fn parse_response(model: &str, resp: GenerateContentResponse) -> Result<ChatOutput> {
    let candidate = resp
        .candidates
        .into_iter()
        .next()
        .ok_or(PipeError::EmptyResponse)?;

    let mut content = String::new();
    let mut reasoning = String::new();
    for part in candidate.content.unwrap_or_default().parts {
        let Some(text) = part.text else { continue };
        if part.thought {
            reasoning.push_str(&text);
        } else {
            content.push_str(&text);
        }
    }

    let usage = resp.usage_metadata.unwrap_or_default();
    let reasoning = reasoning.trim();

    Ok(ChatOutput {
        model: model.to_string(),
        content: content.trim().to_string(),
        reasoning: (!reasoning.is_empty()).then(|| reasoning.to_string()),
        finish_reason: candidate.finish_reason,
        usage: Usage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            reasoning_tokens: usage.thoughts_token_count,
            total_tokens: usage.total_token_count,
        },
    })
}
