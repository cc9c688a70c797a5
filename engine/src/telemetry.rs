//! Telemetry port injected into the chat session and the tool scheduler.

use std::time::Duration;

use parley_types::UsageMetadata;

use crate::scheduler::ToolCallStatus;
use crate::tools::ConfirmationOutcome;

#[derive(Debug, Clone)]
pub struct ApiRequestEvent<'a> {
    pub session_id: &'a str,
    pub model: &'a str,
    /// Joined text of the outgoing user turn.
    pub request_text: &'a str,
}

#[derive(Debug, Clone)]
pub struct ApiResponseEvent<'a> {
    pub session_id: &'a str,
    pub model: &'a str,
    pub duration: Duration,
    pub usage: Option<&'a UsageMetadata>,
    pub response_text: &'a str,
}

#[derive(Debug, Clone)]
pub struct ApiErrorEvent<'a> {
    pub session_id: &'a str,
    pub model: &'a str,
    pub duration: Duration,
    pub error: &'a str,
}

#[derive(Debug, Clone)]
pub struct ToolCallEvent<'a> {
    pub call_id: &'a str,
    pub name: &'a str,
    pub status: ToolCallStatus,
    pub duration: Duration,
    pub outcome: Option<ConfirmationOutcome>,
    pub error: Option<&'a str>,
}

pub trait Telemetry: Send + Sync {
    fn api_request(&self, event: &ApiRequestEvent<'_>);
    fn api_response(&self, event: &ApiResponseEvent<'_>);
    fn api_error(&self, event: &ApiErrorEvent<'_>);
    fn tool_call(&self, event: &ToolCallEvent<'_>);
}

/// Forwards events to `tracing`. Prompt and response text are only logged
/// when `log_prompts` is set.
#[derive(Debug, Clone, Copy)]
pub struct TracingTelemetry {
    enabled: bool,
    log_prompts: bool,
}

impl TracingTelemetry {
    #[must_use]
    pub const fn new(enabled: bool, log_prompts: bool) -> Self {
        Self {
            enabled,
            log_prompts,
        }
    }

    #[must_use]
    pub fn from_config(config: &crate::Config) -> Self {
        Self::new(config.usage_statistics_enabled(), config.log_prompts())
    }
}

impl Telemetry for TracingTelemetry {
    fn api_request(&self, event: &ApiRequestEvent<'_>) {
        if !self.enabled {
            return;
        }
        if self.log_prompts {
            tracing::info!(
                session_id = event.session_id,
                model = event.model,
                request_text = event.request_text,
                "API request"
            );
        } else {
            tracing::info!(
                session_id = event.session_id,
                model = event.model,
                request_chars = event.request_text.len(),
                "API request"
            );
        }
    }

    fn api_response(&self, event: &ApiResponseEvent<'_>) {
        if !self.enabled {
            return;
        }
        let (prompt_tokens, output_tokens, total_tokens) = event.usage.map_or((0, 0, 0), |u| {
            (
                u.prompt_token_count,
                u.candidates_token_count,
                u.total_token_count,
            )
        });
        if self.log_prompts {
            tracing::info!(
                session_id = event.session_id,
                model = event.model,
                duration_ms = event.duration.as_millis(),
                prompt_tokens,
                output_tokens,
                total_tokens,
                response_text = event.response_text,
                "API response"
            );
        } else {
            tracing::info!(
                session_id = event.session_id,
                model = event.model,
                duration_ms = event.duration.as_millis(),
                prompt_tokens,
                output_tokens,
                total_tokens,
                "API response"
            );
        }
    }

    fn api_error(&self, event: &ApiErrorEvent<'_>) {
        if !self.enabled {
            return;
        }
        tracing::warn!(
            session_id = event.session_id,
            model = event.model,
            duration_ms = event.duration.as_millis(),
            error = event.error,
            "API error"
        );
    }

    fn tool_call(&self, event: &ToolCallEvent<'_>) {
        if !self.enabled {
            return;
        }
        tracing::info!(
            call_id = event.call_id,
            tool = event.name,
            status = ?event.status,
            duration_ms = event.duration.as_millis(),
            outcome = ?event.outcome,
            error = event.error,
            "Tool call finished"
        );
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn api_request(&self, _event: &ApiRequestEvent<'_>) {}
    fn api_response(&self, _event: &ApiResponseEvent<'_>) {}
    fn api_error(&self, _event: &ApiErrorEvent<'_>) {}
    fn tool_call(&self, _event: &ToolCallEvent<'_>) {}
}
