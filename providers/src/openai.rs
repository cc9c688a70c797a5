//! OpenAI-compatible Chat Completions client.
//!
//! Works against any server exposing `POST {base_url}/chat/completions`
//! (OpenAI, local gateways, vLLM, Ollama). The request model is taken from
//! each request, so a model switched by fallback applies to the next call.

use std::time::Duration;

use serde_json::Value;

use parley_types::{
    Candidate, Content, CountTokensRequest, CountTokensResponse, EmbedContentRequest,
    EmbedContentResponse, FinishReason, GenerateContentRequest, GenerateContentResponse, Part,
    Role, UsageMetadata,
};

use crate::accumulator::StreamToolCallAccumulator;
use crate::convert::{
    estimate_tokens, from_chat_completion, from_stream_chunk, map_finish_reason, map_usage,
    to_chat_completion_request,
};
use crate::wire::{ChatCompletion, ChatCompletionChunk, ChatCompletionRequest};
use crate::{
    ContentGenerator, ContentStream, DEFAULT_STREAM_IDLE_TIMEOUT_SECS, OPENAI_API_BASE_URL,
    ProviderError, ProviderFut, SseParseAction, SseParser, base_client_builder, check_status,
    emit_or_continue, spawn_sse_stream,
};

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    /// Base URL without the `/chat/completions` suffix.
    pub base_url: String,
    pub api_key: Option<String>,
    pub stream_idle_timeout: Duration,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: OPENAI_API_BASE_URL.to_string(),
            api_key: None,
            stream_idle_timeout: Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
        }
    }
}

impl OpenAiSettings {
    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

pub struct OpenAiContentGenerator {
    client: reqwest::Client,
    settings: OpenAiSettings,
}

impl OpenAiContentGenerator {
    pub fn new(settings: OpenAiSettings) -> Result<Self, ProviderError> {
        let client = base_client_builder().build()?;
        Ok(Self::with_client(client, settings))
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client, settings: OpenAiSettings) -> Self {
        Self { client, settings }
    }

    #[must_use]
    pub fn settings(&self) -> &OpenAiSettings {
        &self.settings
    }

    async fn post(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response, ProviderError> {
        let mut request = self
            .client
            .post(self.settings.completions_url())
            .header("content-type", "application/json")
            .json(body);
        if let Some(key) = self.settings.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        tracing::debug!(
            model = %body.model,
            messages = body.messages.len(),
            tools = body.tools.as_ref().map_or(0, Vec::len),
            stream = body.stream,
            "Sending chat completion request"
        );
        let response = request.send().await?;
        check_status(response).await
    }
}

impl ContentGenerator for OpenAiContentGenerator {
    fn generate_content(
        &self,
        request: GenerateContentRequest,
    ) -> ProviderFut<'_, GenerateContentResponse> {
        Box::pin(async move {
            let body = to_chat_completion_request(&request, false);
            let response = self.post(&body).await?;
            let bytes = response.bytes().await?;
            let completion: ChatCompletion = serde_json::from_slice(&bytes)?;
            Ok(from_chat_completion(completion)?)
        })
    }

    fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
    ) -> ProviderFut<'_, ContentStream> {
        Box::pin(async move {
            let body = to_chat_completion_request(&request, true);
            let response = self.post(&body).await?;
            Ok(spawn_sse_stream(
                response,
                ChatCompletionStreamParser::default(),
                self.settings.stream_idle_timeout,
            ))
        })
    }

    fn count_tokens(&self, request: CountTokensRequest) -> ProviderFut<'_, CountTokensResponse> {
        Box::pin(async move {
            Ok(CountTokensResponse {
                total_tokens: estimate_tokens(&request.contents),
            })
        })
    }

    fn embed_content(
        &self,
        _request: EmbedContentRequest,
    ) -> ProviderFut<'_, EmbedContentResponse> {
        Box::pin(async { Err(ProviderError::Unsupported("embedContent")) })
    }
}

// ============================================================================
// Stream mapping
// ============================================================================

/// Maps Chat Completions chunks to response chunks for one stream.
///
/// Text deltas pass straight through. Tool-call deltas are held in a
/// [`StreamToolCallAccumulator`] until the `tool_calls` finish reason, then
/// released as a single chunk of `functionCall` parts.
#[derive(Debug, Default)]
pub(crate) struct ChatCompletionStreamParser {
    tool_calls: StreamToolCallAccumulator,
}

fn terminal_chunk(
    parts: Vec<Part>,
    finish_reason: Option<FinishReason>,
    usage: Option<UsageMetadata>,
) -> GenerateContentResponse {
    GenerateContentResponse {
        candidates: vec![Candidate {
            index: 0,
            content: Some(Content::new(Role::Model, parts)),
            finish_reason,
        }],
        usage_metadata: usage,
        automatic_function_calling_history: Vec::new(),
    }
}

impl SseParser for ChatCompletionStreamParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let chunk: ChatCompletionChunk = match serde_json::from_value(json.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(%e, provider = self.provider_name(), "Failed to parse SSE event");
                return SseParseAction::Continue;
            }
        };
        let usage = chunk.usage.map(map_usage);

        let Some(choice) = chunk.choices.first() else {
            // Usage-only trailer sent when `include_usage` is requested.
            return match usage {
                Some(usage) => SseParseAction::Emit(vec![GenerateContentResponse {
                    usage_metadata: Some(usage),
                    ..Default::default()
                }]),
                None => SseParseAction::Continue,
            };
        };

        let mut out = Vec::new();
        let has_text = choice
            .delta
            .as_ref()
            .and_then(|d| d.content.as_deref())
            .is_some_and(|t| !t.is_empty());

        if let Some(delta) = &choice.delta {
            for tool_delta in &delta.tool_calls {
                self.tool_calls.push(tool_delta);
            }
        }

        let finish_reason = choice.finish_reason.as_deref();
        if finish_reason == Some("tool_calls") {
            if has_text {
                let mut text_chunk = from_stream_chunk(&chunk);
                for candidate in &mut text_chunk.candidates {
                    candidate.finish_reason = None;
                }
                out.push(text_chunk);
            }
            let accumulated = std::mem::take(&mut self.tool_calls);
            tracing::debug!(calls = accumulated.len(), "Finalizing streamed tool calls");
            match accumulated.finish() {
                Ok(parts) => {
                    out.push(terminal_chunk(parts, Some(FinishReason::ToolCall), usage));
                }
                Err(e) => return SseParseAction::Error(e.into()),
            }
        } else if has_text {
            out.push(from_stream_chunk(&chunk));
        } else if finish_reason.is_some() {
            out.push(terminal_chunk(
                Vec::new(),
                map_finish_reason(finish_reason),
                usage,
            ));
        }

        emit_or_continue(out)
    }

    fn finish(&mut self) -> SseParseAction {
        if !self.tool_calls.is_empty() {
            tracing::warn!(
                calls = self.tool_calls.len(),
                "Stream ended without a tool_calls finish reason; dropping partial calls"
            );
        }
        SseParseAction::Done(Vec::new())
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}
