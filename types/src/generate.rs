//! Generation request/response model, independent of any backend wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Content, FunctionCall, Part};

// ============================================================================
// Requests
// ============================================================================

/// A function the model may call, described by a JSON Schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl FunctionDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Some(parameters),
        }
    }
}

/// A group of function declarations offered together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    #[serde(default)]
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Per-request generation knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
}

impl GenerationConfig {
    /// Overlay `other` on top of `self`; set fields in `other` win.
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        Self {
            system_instruction: other
                .system_instruction
                .clone()
                .or_else(|| self.system_instruction.clone()),
            temperature: other.temperature.or(self.temperature),
            top_p: other.top_p.or(self.top_p),
            max_output_tokens: other.max_output_tokens.or(self.max_output_tokens),
            stop_sequences: if other.stop_sequences.is_empty() {
                self.stop_sequences.clone()
            } else {
                other.stop_sequences.clone()
            },
            tools: if other.tools.is_empty() {
                self.tools.clone()
            } else {
                other.tools.clone()
            },
        }
    }

    /// All declared functions across tool groups.
    pub fn function_declarations(&self) -> impl Iterator<Item = &FunctionDeclaration> {
        self.tools
            .iter()
            .flat_map(|tool| tool.function_declarations.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateContentRequest {
    pub model: String,
    pub contents: Vec<Content>,
    #[serde(default)]
    pub config: GenerationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountTokensRequest {
    pub model: String,
    pub contents: Vec<Content>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountTokensResponse {
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedContentRequest {
    pub model: String,
    pub contents: Vec<Content>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedContentResponse {
    pub embeddings: Vec<Vec<f32>>,
}

// ============================================================================
// Responses
// ============================================================================

/// Why a candidate stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    ToolCall,
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    pub prompt_token_count: u32,
    pub candidates_token_count: u32,
    pub total_token_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// A whole response or one streamed chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    /// Turns a backend looped through internally while auto-calling functions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub automatic_function_calling_history: Vec<Content>,
}

impl GenerateContentResponse {
    /// Content of the first candidate.
    #[must_use]
    pub fn first_content(&self) -> Option<&Content> {
        self.candidates.first().and_then(|c| c.content.as_ref())
    }

    /// Valid iff the first candidate carries a valid content turn.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.first_content().is_some_and(Content::is_valid)
    }

    /// Concatenated text of the first candidate, ignoring thoughts.
    #[must_use]
    pub fn text(&self) -> String {
        self.first_content().map(Content::text).unwrap_or_default()
    }

    /// Function calls requested by the first candidate.
    #[must_use]
    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.first_content()
            .map(|content| content.function_calls().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.candidates.first().and_then(|c| c.finish_reason)
    }

    /// All parts of the first candidate.
    #[must_use]
    pub fn parts(&self) -> &[Part] {
        self.first_content().map_or(&[][..], |c| c.parts.as_slice())
    }
}
