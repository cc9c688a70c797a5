//! Core domain types for Parley.
//!
//! This crate contains the provider-agnostic conversation model shared by every
//! layer: turns and their parts, generation requests and responses, and the
//! tool-call request issued by the model. Pure data with no IO and no async.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod generate;
pub use generate::{
    Candidate, CountTokensRequest, CountTokensResponse, EmbedContentRequest,
    EmbedContentResponse, FinishReason, FunctionDeclaration, GenerateContentRequest,
    GenerateContentResponse, GenerationConfig, Tool, UsageMetadata,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Roles
// ============================================================================

/// Author of a conversation turn.
///
/// Only `user` and `model` exist; any other role in serialized history is
/// rejected at the deserialization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Role must be user or model, but got {0}.")]
pub struct InvalidRoleError(pub String);

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidRoleError> {
        match value {
            "user" => Ok(Self::User),
            "model" => Ok(Self::Model),
            other => Err(InvalidRoleError(other.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Parts
// ============================================================================

/// A model-issued function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl FunctionCall {
    pub fn new(id: Option<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id,
            name: name.into(),
            args,
        }
    }
}

/// The result of a function invocation, fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: Value,
}

/// Inline binary payload (base64 data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Reference to binary content stored elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub mime_type: String,
    pub file_uri: String,
}

/// One fragment of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text(String),
    /// Model reasoning. Forwarded to callers, never recorded in history.
    Thought(String),
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
    InlineData(Blob),
    FileData(FileData),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_thought(&self) -> bool {
        matches!(self, Self::Thought(_))
    }

    /// `inlineData` or `fileData`.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::InlineData(_) | Self::FileData(_))
    }

    /// MIME type of a binary part.
    #[must_use]
    pub fn mime_type(&self) -> Option<&str> {
        match self {
            Self::InlineData(blob) => Some(&blob.mime_type),
            Self::FileData(file) => Some(&file.mime_type),
            _ => None,
        }
    }
}

// ============================================================================
// Content
// ============================================================================

/// A single role-tagged conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    #[must_use]
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![Part::text(text)])
    }

    /// A turn is valid when it has at least one part and no non-thought
    /// part carries empty text.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.parts.is_empty()
            && self
                .parts
                .iter()
                .all(|part| !matches!(part, Part::Text(text) if text.is_empty()))
    }

    /// A model turn that leads with a thought part.
    #[must_use]
    pub fn is_thought_content(&self) -> bool {
        self.role == Role::Model && self.parts.first().is_some_and(Part::is_thought)
    }

    /// A model turn that leads with a non-empty text part.
    #[must_use]
    pub fn is_text_content(&self) -> bool {
        self.role == Role::Model
            && matches!(self.parts.first(), Some(Part::Text(text)) if !text.is_empty())
    }

    /// A user turn made up entirely of function responses.
    #[must_use]
    pub fn is_function_response(&self) -> bool {
        self.role == Role::User
            && !self.parts.is_empty()
            && self
                .parts
                .iter()
                .all(|part| matches!(part, Part::FunctionResponse(_)))
    }

    /// Function calls carried by this turn, in order.
    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(|part| match part {
            Part::FunctionCall(call) => Some(call),
            _ => None,
        })
    }

    /// Concatenation of all text parts.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }
}

// ============================================================================
// Tool Call Requests
// ============================================================================

/// A model-issued request to invoke a tool, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub args: Value,
    #[serde(default)]
    pub is_client_initiated: bool,
}

impl ToolCallRequest {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            args,
            is_client_initiated: false,
        }
    }
}

// ============================================================================
// Authentication Mode
// ============================================================================

/// Model a session starts on when none is configured.
pub const DEFAULT_MODEL: &str = "gpt-4o";
/// Model offered when rate limiting persists on the configured one.
pub const DEFAULT_FALLBACK_MODEL: &str = "gpt-4o-mini";

/// How the content-generation client authenticated.
///
/// Only the outcome matters here: model fallback is offered to personal
/// OAuth accounts alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    OauthPersonal,
    ApiKey,
    CloudProject,
    #[default]
    OpenAiCompatible,
}

impl AuthType {
    /// Parse a user-supplied auth mode (case-insensitive).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "oauth-personal" | "oauth" | "login-with-google" => Some(Self::OauthPersonal),
            "api-key" | "gemini-api-key" => Some(Self::ApiKey),
            "cloud-project" | "vertex-ai" => Some(Self::CloudProject),
            "openai-compatible" | "openai" => Some(Self::OpenAiCompatible),
            _ => None,
        }
    }
}
