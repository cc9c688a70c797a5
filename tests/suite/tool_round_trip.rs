//! Model-requested tool calls scheduled, executed and answered over the wire.

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use parley_engine::{
    AutoApprove, ChatSession, Config, ConfirmationDetails, ConfirmationHandler, ConfirmationKind,
    ConfirmationOutcome, GenerationConfig, SendMessageParams, Tool, ToolCallRequest,
    ToolCallStatus, ToolFut, ToolRegistry, ToolResult, ToolScheduler, function_response_turn,
    tool_call_requests, tools::ConfirmFut, tools::parse_args,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

use crate::common::{
    COMPLETIONS_PATH, request_bodies, session_with, sse_response, start_openai_mock,
    tool_call_events,
};

#[derive(Deserialize)]
struct EchoArgs {
    text: String,
}

/// Echoes `text`; asks for approval when `guarded`.
struct Echo {
    guarded: bool,
}

impl Tool for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input back."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    fn should_confirm_execute<'a>(
        &'a self,
        args: &'a Value,
        _cancel: &'a CancellationToken,
    ) -> ToolFut<'a, Option<ConfirmationDetails>> {
        Box::pin(async move {
            Ok(self.guarded.then(|| {
                ConfirmationDetails::new(ConfirmationKind::Exec, "Echo", args.to_string())
            }))
        })
    }

    fn execute<'a>(&'a self, args: &'a Value, _cancel: CancellationToken) -> ToolFut<'a, ToolResult> {
        Box::pin(async move {
            let args: EchoArgs = parse_args(args)?;
            Ok(ToolResult::new(args.text))
        })
    }
}

/// Refuses everything and remembers what it was asked.
#[derive(Default)]
struct Refuse {
    asked: Mutex<Vec<String>>,
}

impl ConfirmationHandler for Refuse {
    fn confirm<'a>(
        &'a self,
        request: &'a ToolCallRequest,
        _details: &'a ConfirmationDetails,
    ) -> ConfirmFut<'a> {
        self.asked.lock().unwrap().push(request.call_id.clone());
        Box::pin(async { ConfirmationOutcome::Cancel })
    }
}

fn registry(guarded: bool) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(Echo { guarded })).unwrap();
    Arc::new(registry)
}

fn chat(server: &MockServer, registry: &ToolRegistry) -> ChatSession {
    session_with(
        server,
        Config::new("gpt-4o"),
        GenerationConfig {
            tools: registry.tool_groups(),
            ..Default::default()
        },
    )
}

async fn mount_turns(server: &MockServer, calls: &[(&str, &str, &str)]) {
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(sse_response(&tool_call_events(calls)))
        .up_to_n_times(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(sse_response(&[
            json!({"choices": [{"index": 0, "delta": {"content": "Done."}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        ]))
        .mount(server)
        .await;
}

/// Drain a streamed turn, returning the tool calls it requested.
async fn stream_turn(chat: &ChatSession, params: SendMessageParams) -> Vec<ToolCallRequest> {
    let mut stream = chat.send_message_stream(params).await.unwrap();
    let mut requests = Vec::new();
    while let Some(chunk) = stream.next().await {
        requests.extend(tool_call_requests(&chunk.unwrap()));
    }
    requests
}

#[tokio::test]
async fn results_and_lookup_failures_go_back_as_tool_messages() {
    let server = start_openai_mock().await;
    mount_turns(
        &server,
        &[
            ("call_a", "echo", r#"{"text":"one"}"#),
            ("call_b", "missing", "{}"),
        ],
    )
    .await;
    let registry = registry(false);
    let chat = chat(&server, &registry);
    let scheduler = ToolScheduler::new(registry, Arc::new(AutoApprove));
    let cancel = CancellationToken::new();

    let requests = stream_turn(&chat, SendMessageParams::text("go")).await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].args, json!({"text": "one"}));

    let calls = scheduler.schedule(requests, &cancel).await;
    assert_eq!(calls[0].status(), ToolCallStatus::Success);
    assert_eq!(calls[1].status(), ToolCallStatus::Error);

    let follow_up = stream_turn(&chat, SendMessageParams::new(function_response_turn(&calls))).await;
    assert!(follow_up.is_empty());

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies[0]["tools"][0]["function"]["name"], "echo");
    assert_eq!(
        bodies[1]["messages"],
        json!([
            {"role": "user", "content": "go"},
            {"role": "assistant", "content": null, "tool_calls": [
                {"id": "call_a", "type": "function",
                 "function": {"name": "echo", "arguments": "{\"text\":\"one\"}"}},
                {"id": "call_b", "type": "function",
                 "function": {"name": "missing", "arguments": "{}"}}
            ]},
            {"role": "tool", "tool_call_id": "call_a", "name": "echo",
             "content": "{\"output\":\"one\"}"},
            {"role": "tool", "tool_call_id": "call_b", "name": "missing",
             "content": "{\"error\":\"Tool \\\"missing\\\" not found in registry.\"}"}
        ])
    );

    // user, model(calls), user(responses), model(text)
    let history = chat.get_history(true);
    assert_eq!(history.len(), 4);
    assert_eq!(history[3].text(), "Done.");
}

#[tokio::test]
async fn refused_calls_report_cancellation_to_the_model() {
    let server = start_openai_mock().await;
    mount_turns(&server, &[("call_x", "echo", r#"{"text":"rm -rf"}"#)]).await;
    let registry = registry(true);
    let chat = chat(&server, &registry);
    let refuse = Arc::new(Refuse::default());
    let completed = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&completed);
    let scheduler = ToolScheduler::new(registry, refuse.clone()).on_complete(move |calls| {
        seen.lock()
            .unwrap()
            .extend(calls.iter().map(|call| call.status()));
    });
    let cancel = CancellationToken::new();

    let requests = stream_turn(&chat, SendMessageParams::text("clean up")).await;
    let calls = scheduler.schedule(requests, &cancel).await;

    assert_eq!(*refuse.asked.lock().unwrap(), ["call_x"]);
    assert_eq!(*completed.lock().unwrap(), [ToolCallStatus::Cancelled]);
    assert_eq!(calls[0].outcome, Some(ConfirmationOutcome::Cancel));

    stream_turn(&chat, SendMessageParams::new(function_response_turn(&calls))).await;
    let bodies = request_bodies(&server).await;
    let tool_message = &bodies[1]["messages"][2];
    assert_eq!(tool_message["role"], "tool");
    assert_eq!(
        tool_message["content"],
        "{\"error\":\"[Operation Cancelled] Reason: User did not allow tool call\"}"
    );
}
