//! Orchestration core for Parley.
//!
//! - [`ChatSession`] owns conversation history, serializes sends, retries with
//!   model fallback and folds model output back into history.
//! - [`ToolScheduler`] drives one turn's tool calls through confirmation and
//!   execution and reports their function responses.
//! - [`Config`] is the runtime collaborator both read from.
//!
//! Backends are reached only through [`parley_providers::ContentGenerator`].

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

pub mod chat;
mod config;
mod function_response;
pub mod scheduler;
pub mod telemetry;
pub mod tools;

use parley_providers::convert::synthetic_call_id;
pub use parley_providers::{self, ContentGenerator, ProviderError, RetryConfig};
pub use parley_types::{
    AuthType, Content, GenerateContentResponse, GenerationConfig, Part, Role, ToolCallRequest,
};

pub use chat::{ChatError, ChatSession, ChatStream, SendMessageParams};
pub use config::{
    Config, ConsentFut, DEFAULT_FALLBACK_MODEL, DEFAULT_MODEL, FallbackConsent,
};
pub use function_response::{convert_to_function_response, error_response_part};
pub use scheduler::{ToolCall, ToolCallResponse, ToolCallState, ToolCallStatus, ToolScheduler};
pub use telemetry::{NoopTelemetry, Telemetry, TracingTelemetry};
pub use tools::{
    AutoApprove, ConfirmationDetails, ConfirmationHandler, ConfirmationKind, ConfirmationOutcome,
    Tool, ToolContent, ToolError, ToolFut, ToolRegistry, ToolResult,
};

/// Build the next user turn from a finished tool batch: every call's
/// response parts, in request order.
#[must_use]
pub fn function_response_turn(calls: &[ToolCall]) -> Vec<Part> {
    calls
        .iter()
        .filter_map(ToolCall::response)
        .flat_map(|response| response.response_parts.iter().cloned())
        .collect()
}

/// Tool-call requests issued by a model turn, in order.
///
/// Translated calls always carry an id; any that arrive without one get the
/// same synthetic id the translator would have assigned.
#[must_use]
pub fn tool_call_requests(response: &GenerateContentResponse) -> Vec<ToolCallRequest> {
    response
        .function_calls()
        .into_iter()
        .enumerate()
        .map(|(index, call)| {
            let call_id = call
                .id
                .unwrap_or_else(|| synthetic_call_id(&call.name, index as u32));
            ToolCallRequest::new(call_id, call.name, call.args)
        })
        .collect()
}
