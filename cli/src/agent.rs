//! Prompt-to-answer loop: stream a model turn, run the tools it asks for,
//! feed their responses back, repeat.

use std::io::{self, Write};

use anyhow::Result;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use parley_engine::{
    ChatError, ChatSession, Part, SendMessageParams, ToolCall, ToolCallRequest, ToolCallStatus,
    ToolScheduler, function_response_turn, tool_call_requests,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model answered without requesting tools.
    Finished,
    Cancelled,
    /// `max_turns` model turns ran and the model still wanted tools.
    TurnLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub turns: u32,
    pub tool_calls: usize,
    pub stop: StopReason,
}

pub struct Agent {
    session: ChatSession,
    scheduler: ToolScheduler,
    max_turns: u32,
}

impl Agent {
    pub fn new(session: ChatSession, scheduler: ToolScheduler, max_turns: u32) -> Self {
        Self {
            session,
            scheduler,
            max_turns: max_turns.max(1),
        }
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    /// Run one prompt to completion, writing model text and tool summaries
    /// to `out` as they arrive.
    pub async fn run<W: Write>(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
        out: &mut W,
    ) -> Result<RunSummary> {
        let mut parts = vec![Part::text(prompt)];
        let mut summary = RunSummary {
            turns: 0,
            tool_calls: 0,
            stop: StopReason::Finished,
        };

        loop {
            if summary.turns >= self.max_turns {
                tracing::warn!(max_turns = self.max_turns, "Turn limit reached");
                summary.stop = StopReason::TurnLimit;
                break;
            }
            summary.turns += 1;

            let params = SendMessageParams::new(parts).with_cancel(cancel.clone());
            let requests = match self.stream_turn(params, out).await {
                Ok(requests) => requests,
                Err(ChatError::Cancelled) => {
                    summary.stop = StopReason::Cancelled;
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            writeln!(out)?;

            if requests.is_empty() {
                break;
            }
            summary.tool_calls += requests.len();
            tracing::debug!(turn = summary.turns, calls = requests.len(), "Model requested tools");

            let calls = self.scheduler.schedule(requests, cancel).await;
            report_calls(&calls, out)?;
            if cancel.is_cancelled() {
                summary.stop = StopReason::Cancelled;
                break;
            }
            parts = function_response_turn(&calls);
        }

        out.flush()?;
        Ok(summary)
    }

    /// Drain one streamed model turn. The stream is dropped before returning
    /// so the session's send lock is free for the follow-up turn.
    async fn stream_turn<W: Write>(
        &self,
        params: SendMessageParams,
        out: &mut W,
    ) -> Result<Vec<ToolCallRequest>, ChatError> {
        let mut stream = self.session.send_message_stream(params).await?;
        let mut requests = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let text = chunk.text();
            if !text.is_empty() {
                let _ = write!(out, "{text}");
                let _ = out.flush();
            }
            requests.extend(tool_call_requests(&chunk));
        }
        Ok(requests)
    }
}

fn report_calls<W: Write>(calls: &[ToolCall], out: &mut W) -> io::Result<()> {
    for call in calls {
        let detail = call
            .response()
            .and_then(|r| r.error.as_deref().or(r.result_display.as_deref()))
            .unwrap_or_default();
        let marker = match call.status() {
            ToolCallStatus::Success => "ok",
            ToolCallStatus::Cancelled => "cancelled",
            _ => "error",
        };
        writeln!(out, "[{} {marker}] {detail}", call.request.name)?;
    }
    Ok(())
}
