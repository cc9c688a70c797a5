//! Tool-call scheduler.
//!
//! A batch of requests from one model turn is driven through
//! validating → (awaiting approval) → scheduled → executing → terminal.
//! Each call runs as its own future; the batch resolves once every call is
//! terminal. Failures never escape: they become `error` calls whose message is
//! reported back to the model.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parley_types::{Part, ToolCallRequest};
use tokio_util::sync::CancellationToken;

use crate::function_response::{convert_to_function_response, error_response_part};
use crate::telemetry::{NoopTelemetry, Telemetry, ToolCallEvent};
use crate::tools::{
    ConfirmationDetails, ConfirmationHandler, ConfirmationOutcome, Tool, ToolRegistry, ToolResult,
};

const REASON_REJECTED: &str = "User did not allow tool call";
const REASON_CANCELLED: &str = "User cancelled tool execution.";

/// Receives a snapshot of the whole batch after every transition.
pub type UpdateHandler = Arc<dyn Fn(&[ToolCall]) + Send + Sync>;

/// Receives the terminal batch, in request order, exactly once.
pub type CompleteHandler = Arc<dyn Fn(&[ToolCall]) + Send + Sync>;

// ============================================================================
// Call state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolCallStatus {
    Validating,
    AwaitingApproval,
    Scheduled,
    Executing,
    Success,
    Error,
    Cancelled,
}

impl ToolCallStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

/// What a terminal call reports back to the model and the user.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResponse {
    pub call_id: String,
    pub response_parts: Vec<Part>,
    pub result_display: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ToolCallState {
    Validating,
    AwaitingApproval { details: ConfirmationDetails },
    Scheduled,
    Executing,
    Success { response: ToolCallResponse },
    Error { response: ToolCallResponse },
    Cancelled { response: ToolCallResponse },
}

impl ToolCallState {
    #[must_use]
    pub const fn status(&self) -> ToolCallStatus {
        match self {
            Self::Validating => ToolCallStatus::Validating,
            Self::AwaitingApproval { .. } => ToolCallStatus::AwaitingApproval,
            Self::Scheduled => ToolCallStatus::Scheduled,
            Self::Executing => ToolCallStatus::Executing,
            Self::Success { .. } => ToolCallStatus::Success,
            Self::Error { .. } => ToolCallStatus::Error,
            Self::Cancelled { .. } => ToolCallStatus::Cancelled,
        }
    }
}

/// One request's live state within a batch.
#[derive(Clone)]
pub struct ToolCall {
    pub request: ToolCallRequest,
    /// Resolved handle; `None` when the registry has no such tool.
    pub tool: Option<Arc<dyn Tool>>,
    pub state: ToolCallState,
    pub outcome: Option<ConfirmationOutcome>,
    /// Wall time from validation to the terminal state.
    pub duration: Option<Duration>,
}

impl ToolCall {
    fn new(request: ToolCallRequest, tool: Option<Arc<dyn Tool>>) -> Self {
        Self {
            request,
            tool,
            state: ToolCallState::Validating,
            outcome: None,
            duration: None,
        }
    }

    #[must_use]
    pub const fn status(&self) -> ToolCallStatus {
        self.state.status()
    }

    /// The terminal response, once the call has one.
    #[must_use]
    pub fn response(&self) -> Option<&ToolCallResponse> {
        match &self.state {
            ToolCallState::Success { response }
            | ToolCallState::Error { response }
            | ToolCallState::Cancelled { response } => Some(response),
            _ => None,
        }
    }

    #[must_use]
    pub fn confirmation_details(&self) -> Option<&ConfirmationDetails> {
        match &self.state {
            ToolCallState::AwaitingApproval { details } => Some(details),
            _ => None,
        }
    }
}

impl fmt::Debug for ToolCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCall")
            .field("request", &self.request)
            .field("tool", &self.tool.as_ref().map(|tool| tool.name().to_string()))
            .field("state", &self.state)
            .field("outcome", &self.outcome)
            .field("duration", &self.duration)
            .finish()
    }
}

// ============================================================================
// Batch table
// ============================================================================

/// The live call table of one `schedule` invocation.
struct Batch<'a> {
    calls: Mutex<Vec<ToolCall>>,
    on_update: Option<&'a UpdateHandler>,
}

impl<'a> Batch<'a> {
    fn new(calls: Vec<ToolCall>, on_update: Option<&'a UpdateHandler>) -> Self {
        Self {
            calls: Mutex::new(calls),
            on_update,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ToolCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call(&self, index: usize) -> ToolCall {
        self.lock()[index].clone()
    }

    /// Apply `change` and notify with a snapshot. The lock is released
    /// before the handler runs.
    fn update(&self, index: usize, change: impl FnOnce(&mut ToolCall)) {
        let snapshot = {
            let mut calls = self.lock();
            change(&mut calls[index]);
            self.on_update.map(|_| calls.clone())
        };
        if let (Some(handler), Some(snapshot)) = (self.on_update, snapshot) {
            handler(&snapshot);
        }
    }

    fn notify(&self) {
        if let Some(handler) = self.on_update {
            let snapshot = self.lock().clone();
            handler(&snapshot);
        }
    }

    fn into_calls(self) -> Vec<ToolCall> {
        self.calls.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Finish {
    Success(ToolResult),
    Error(String),
    Cancelled(&'static str),
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    confirmer: Arc<dyn ConfirmationHandler>,
    on_update: Option<UpdateHandler>,
    on_complete: Option<CompleteHandler>,
    telemetry: Arc<dyn Telemetry>,
}

impl ToolScheduler {
    pub fn new(registry: Arc<ToolRegistry>, confirmer: Arc<dyn ConfirmationHandler>) -> Self {
        Self {
            registry,
            confirmer,
            on_update: None,
            on_complete: None,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    #[must_use]
    pub fn on_update(mut self, handler: impl Fn(&[ToolCall]) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn on_complete(mut self, handler: impl Fn(&[ToolCall]) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Drive every request to a terminal state and return the batch in
    /// request order. `cancel` is shared by the whole batch.
    pub async fn schedule(
        &self,
        requests: Vec<ToolCallRequest>,
        cancel: &CancellationToken,
    ) -> Vec<ToolCall> {
        let calls: Vec<ToolCall> = requests
            .into_iter()
            .map(|request| {
                let tool = self.registry.get_tool(&request.name);
                ToolCall::new(request, tool)
            })
            .collect();
        let count = calls.len();
        tracing::debug!(count, "Scheduling tool batch");

        let batch = Batch::new(calls, self.on_update.as_ref());
        if count > 0 {
            batch.notify();
        }
        join_all((0..count).map(|index| self.run_call(&batch, index, cancel))).await;

        let completed = batch.into_calls();
        if let Some(handler) = &self.on_complete {
            handler(&completed);
        }
        completed
    }

    async fn run_call(&self, batch: &Batch<'_>, index: usize, cancel: &CancellationToken) {
        let started = Instant::now();
        let call = batch.call(index);
        let mut outcome = None;
        let finish = self.drive(batch, index, &call, cancel, &mut outcome).await;
        self.finish(batch, index, &call.request, finish, outcome, started.elapsed());
    }

    async fn drive(
        &self,
        batch: &Batch<'_>,
        index: usize,
        call: &ToolCall,
        cancel: &CancellationToken,
        outcome: &mut Option<ConfirmationOutcome>,
    ) -> Finish {
        let request = &call.request;
        let Some(tool) = call.tool.as_ref() else {
            return Finish::Error(format!("Tool \"{}\" not found in registry.", request.name));
        };
        if cancel.is_cancelled() {
            return Finish::Cancelled(REASON_CANCELLED);
        }

        let details = tokio::select! {
            biased;
            () = cancel.cancelled() => return Finish::Cancelled(REASON_CANCELLED),
            result = tool.should_confirm_execute(&request.args, cancel) => match result {
                Ok(details) => details,
                Err(e) => return Finish::Error(e.to_string()),
            },
        };

        if let Some(details) = details {
            batch.update(index, |call| {
                call.state = ToolCallState::AwaitingApproval {
                    details: details.clone(),
                };
            });
            let decision = tokio::select! {
                biased;
                () = cancel.cancelled() => return Finish::Cancelled(REASON_CANCELLED),
                decision = self.confirmer.confirm(request, &details) => decision,
            };
            *outcome = Some(decision);
            if let Some(on_confirm) = &details.on_confirm {
                on_confirm(decision);
            }
            if !decision.is_approved() {
                return Finish::Cancelled(REASON_REJECTED);
            }
        }

        let decision = *outcome;
        batch.update(index, |call| {
            call.state = ToolCallState::Scheduled;
            call.outcome = decision;
        });
        if cancel.is_cancelled() {
            return Finish::Cancelled(REASON_CANCELLED);
        }

        batch.update(index, |call| call.state = ToolCallState::Executing);
        tracing::debug!(call_id = %request.call_id, tool = %request.name, "Executing tool");
        let result = tool.execute(&request.args, cancel.clone()).await;
        if cancel.is_cancelled() {
            return Finish::Cancelled(REASON_CANCELLED);
        }
        match result {
            Ok(result) => Finish::Success(result),
            Err(e) => Finish::Error(e.to_string()),
        }
    }

    fn finish(
        &self,
        batch: &Batch<'_>,
        index: usize,
        request: &ToolCallRequest,
        finish: Finish,
        outcome: Option<ConfirmationOutcome>,
        duration: Duration,
    ) {
        let call_id = request.call_id.clone();
        let state = match finish {
            Finish::Success(result) => ToolCallState::Success {
                response: ToolCallResponse {
                    response_parts: convert_to_function_response(
                        &request.call_id,
                        &request.name,
                        &result.llm_content,
                    ),
                    result_display: result.display,
                    error: None,
                    call_id,
                },
            },
            Finish::Error(message) => {
                tracing::warn!(call_id = %request.call_id, tool = %request.name, error = %message, "Tool call failed");
                ToolCallState::Error {
                    response: ToolCallResponse {
                        response_parts: vec![error_response_part(
                            &request.call_id,
                            &request.name,
                            &message,
                        )],
                        result_display: Some(message.clone()),
                        error: Some(message),
                        call_id,
                    },
                }
            }
            Finish::Cancelled(reason) => ToolCallState::Cancelled {
                response: ToolCallResponse {
                    response_parts: vec![error_response_part(
                        &request.call_id,
                        &request.name,
                        &format!("[Operation Cancelled] Reason: {reason}"),
                    )],
                    result_display: Some(reason.to_string()),
                    error: None,
                    call_id,
                },
            },
        };

        let status = state.status();
        let error = match &state {
            ToolCallState::Error { response } => response.error.clone(),
            _ => None,
        };
        self.telemetry.tool_call(&ToolCallEvent {
            call_id: &request.call_id,
            name: &request.name,
            status,
            duration,
            outcome,
            error: error.as_deref(),
        });

        batch.update(index, |call| {
            call.state = state;
            call.outcome = outcome;
            call.duration = Some(duration);
        });
    }
}

impl fmt::Debug for ToolScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolScheduler")
            .field("registry", &self.registry)
            .field("on_update", &self.on_update.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish_non_exhaustive()
    }
}
