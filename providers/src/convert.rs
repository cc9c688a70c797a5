//! Translation between the provider-agnostic content model and the
//! OpenAI-compatible Chat Completions wire format.
//!
//! Everything here is pure. The only stateful piece of the translation, the
//! reassembly of streamed tool-call arguments, lives in [`crate::accumulator`].

use serde_json::Value;
use thiserror::Error;

use parley_types::{
    Candidate, Content, FinishReason, FunctionCall, GenerateContentRequest,
    GenerateContentResponse, Part, Role, Tool, UsageMetadata,
};

use crate::wire::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChatFunctionCall,
    ChatFunctionDefinition, ChatMessage, ChatTool, ChatToolCall, ChatUsage, StreamOptions,
};

/// Function name used when a call arrives without one.
const UNKNOWN_FUNCTION: &str = "unknown_function";

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("malformed arguments for tool call {index} ({name}): {source}")]
    MalformedToolArguments {
        index: u32,
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Requests
// ============================================================================

/// Build a Chat Completions request for `request`.
#[must_use]
pub fn to_chat_completion_request(
    request: &GenerateContentRequest,
    stream: bool,
) -> ChatCompletionRequest {
    let config = &request.config;
    let tools = to_chat_tools(&config.tools);
    let tool_choice = tools.as_ref().map(|_| "auto".to_string());
    let stop = (!config.stop_sequences.is_empty()).then(|| config.stop_sequences.clone());

    ChatCompletionRequest {
        model: request.model.clone(),
        messages: to_chat_messages(&request.contents, config.system_instruction.as_deref()),
        tools,
        tool_choice,
        temperature: config.temperature,
        top_p: config.top_p,
        max_tokens: config.max_output_tokens,
        stop,
        stream,
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
    }
}

/// Map conversation turns to chat messages.
///
/// A turn carrying function calls becomes one assistant message holding every
/// call (plus the turn's text, if any). Function responses become `tool`
/// messages keyed by call id. Remaining text becomes a plain message.
#[must_use]
pub fn to_chat_messages(contents: &[Content], system_instruction: Option<&str>) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(contents.len() + 1);

    if let Some(system) = system_instruction.filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::System {
            content: system.to_string(),
        });
    }

    for content in contents {
        let text: String = content.parts.iter().filter_map(Part::as_text).collect();

        let tool_calls: Vec<ChatToolCall> = content
            .function_calls()
            .map(|call| ChatToolCall {
                id: call.id.clone().unwrap_or_default(),
                kind: "function".to_string(),
                function: ChatFunctionCall {
                    name: if call.name.is_empty() {
                        UNKNOWN_FUNCTION.to_string()
                    } else {
                        call.name.clone()
                    },
                    arguments: call.args.to_string(),
                },
            })
            .collect();

        let tool_results: Vec<ChatMessage> = content
            .parts
            .iter()
            .filter_map(|part| match part {
                Part::FunctionResponse(response) => Some(ChatMessage::Tool {
                    tool_call_id: response.id.clone().unwrap_or_default(),
                    name: Some(response.name.clone()),
                    content: match &response.response {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    },
                }),
                _ => None,
            })
            .collect();

        if !tool_calls.is_empty() {
            messages.push(ChatMessage::Assistant {
                content: (!text.is_empty()).then(|| text.clone()),
                tool_calls,
            });
            continue;
        }

        let had_results = !tool_results.is_empty();
        messages.extend(tool_results);

        if text.is_empty() {
            continue;
        }
        // Text next to tool results must follow them; the backend expects the
        // tool messages right after the assistant turn that requested them.
        if had_results && content.role == Role::Model {
            tracing::debug!("Dropping model text attached to function responses");
            continue;
        }
        messages.push(match content.role {
            Role::User => ChatMessage::User { content: text },
            Role::Model => ChatMessage::Assistant {
                content: Some(text),
                tool_calls: Vec::new(),
            },
        });
    }

    messages
}

/// Map function declarations to the backend tool schema.
///
/// Returns `None` when nothing is declared, so the request omits `tools`.
#[must_use]
pub fn to_chat_tools(tools: &[Tool]) -> Option<Vec<ChatTool>> {
    let mapped: Vec<ChatTool> = tools
        .iter()
        .flat_map(|tool| tool.function_declarations.iter())
        .map(|decl| ChatTool {
            kind: "function",
            function: ChatFunctionDefinition {
                name: decl.name.clone(),
                description: decl.description.clone(),
                parameters: decl.parameters.clone(),
            },
        })
        .collect();

    if mapped.is_empty() { None } else { Some(mapped) }
}

// ============================================================================
// Responses
// ============================================================================

/// Map a backend finish reason. Total over strings; `None` stays `None`.
#[must_use]
pub fn map_finish_reason(reason: Option<&str>) -> Option<FinishReason> {
    let reason = reason?;
    Some(match reason.to_ascii_lowercase().as_str() {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::MaxTokens,
        "content_filter" => FinishReason::Safety,
        "tool_calls" => FinishReason::ToolCall,
        _ => FinishReason::Other,
    })
}

#[must_use]
pub const fn map_usage(usage: ChatUsage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: usage.prompt_tokens,
        candidates_token_count: usage.completion_tokens,
        total_token_count: usage.total_tokens,
    }
}

/// Parse accumulated tool-call argument text.
///
/// Blank arguments mean "no arguments" and parse as an empty object.
pub fn parse_tool_arguments(index: u32, name: &str, raw: &str) -> Result<Value, TranslateError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw).map_err(|source| TranslateError::MalformedToolArguments {
        index,
        name: name.to_string(),
        source,
    })
}

/// Id given to a tool call the backend sent without one.
///
/// Assigned when the call is first translated so history, scheduling and the
/// follow-up `tool` message all agree on it.
#[must_use]
pub fn synthetic_call_id(name: &str, index: u32) -> String {
    format!("{name}-{index}")
}

/// Map a whole (non-streaming) completion.
pub fn from_chat_completion(
    completion: ChatCompletion,
) -> Result<GenerateContentResponse, TranslateError> {
    let mut candidates = Vec::with_capacity(completion.choices.len());

    for choice in completion.choices {
        let mut parts = Vec::new();
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            parts.push(Part::Text(text));
        }
        for (index, call) in choice.message.tool_calls.into_iter().enumerate() {
            let args = parse_tool_arguments(
                index as u32,
                &call.function.name,
                &call.function.arguments,
            )?;
            let id = if call.id.is_empty() {
                synthetic_call_id(&call.function.name, index as u32)
            } else {
                call.id
            };
            parts.push(Part::FunctionCall(FunctionCall::new(
                Some(id),
                call.function.name,
                args,
            )));
        }

        candidates.push(Candidate {
            index: choice.index,
            content: Some(Content::new(Role::Model, parts)),
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
        });
    }

    Ok(GenerateContentResponse {
        candidates,
        usage_metadata: completion.usage.map(map_usage),
        automatic_function_calling_history: Vec::new(),
    })
}

/// Map the text portion of one streamed chunk.
///
/// Tool-call deltas are ignored here; they only carry argument fragments and
/// are reassembled by [`crate::accumulator::StreamToolCallAccumulator`].
#[must_use]
pub fn from_stream_chunk(chunk: &ChatCompletionChunk) -> GenerateContentResponse {
    let candidates = chunk
        .choices
        .iter()
        .map(|choice| {
            let parts = choice
                .delta
                .as_ref()
                .and_then(|delta| delta.content.as_ref())
                .filter(|text| !text.is_empty())
                .map(|text| vec![Part::Text(text.clone())])
                .unwrap_or_default();
            Candidate {
                index: choice.index,
                content: Some(Content::new(Role::Model, parts)),
                finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
            }
        })
        .collect();

    GenerateContentResponse {
        candidates,
        usage_metadata: chunk.usage.map(map_usage),
        automatic_function_calling_history: Vec::new(),
    }
}

/// Rough token estimate: one token per four characters of text.
#[must_use]
pub fn estimate_tokens(contents: &[Content]) -> u32 {
    let text = contents
        .iter()
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(Part::as_text)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("\n");
    text.chars().count().div_ceil(4) as u32
}
