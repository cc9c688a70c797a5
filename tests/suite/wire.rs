//! Chat Completions translation through the public provider API.

use futures_util::StreamExt;
use parley_providers::convert::{from_chat_completion, to_chat_completion_request};
use parley_providers::wire::{ChatCompletion, ToolCallDelta};
use parley_providers::{ContentGenerator, ProviderError, StreamToolCallAccumulator};
use parley_types::{
    Content, FinishReason, FunctionCall, FunctionDeclaration, FunctionResponse,
    GenerateContentRequest, GenerationConfig, Part, Role, Tool,
};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::Mock;

use crate::common::{COMPLETIONS_PATH, generator, sse_response, start_openai_mock};

fn delta(value: Value) -> ToolCallDelta {
    serde_json::from_value(value).unwrap()
}

#[test]
fn conversation_with_tools_maps_to_one_request() {
    let request = GenerateContentRequest {
        model: "gpt-4o".into(),
        contents: vec![
            Content::user_text("List files"),
            Content::new(
                Role::Model,
                vec![
                    Part::text("Looking."),
                    Part::FunctionCall(FunctionCall::new(Some("c1".into()), "ls", json!({"dir": "."}))),
                    Part::FunctionCall(FunctionCall::new(Some("c2".into()), "ls", json!({"dir": "src"}))),
                ],
            ),
            Content::new(
                Role::User,
                vec![
                    Part::FunctionResponse(FunctionResponse {
                        id: Some("c1".into()),
                        name: "ls".into(),
                        response: json!({"output": "Cargo.toml"}),
                    }),
                    Part::FunctionResponse(FunctionResponse {
                        id: Some("c2".into()),
                        name: "ls".into(),
                        response: json!("lib.rs"),
                    }),
                ],
            ),
        ],
        config: GenerationConfig {
            system_instruction: Some("You are terse.".into()),
            max_output_tokens: Some(64),
            stop_sequences: vec!["END".into()],
            tools: vec![Tool {
                function_declarations: vec![FunctionDeclaration::new(
                    "ls",
                    "List a directory",
                    json!({"type": "object"}),
                )],
            }],
            ..Default::default()
        },
    };

    let body = serde_json::to_value(to_chat_completion_request(&request, true)).unwrap();

    assert_eq!(body["tool_choice"], "auto");
    assert_eq!(body["max_tokens"], 64);
    assert_eq!(body["stop"], json!(["END"]));
    assert_eq!(body["tools"][0]["type"], "function");
    assert_eq!(body["tools"][0]["function"]["name"], "ls");

    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[2]["content"], "Looking.");
    assert_eq!(messages[2]["tool_calls"].as_array().unwrap().len(), 2);
    assert_eq!(messages[2]["tool_calls"][1]["function"]["arguments"], "{\"dir\":\"src\"}");
    assert_eq!(messages[3]["content"], "{\"output\":\"Cargo.toml\"}");
    // String responses are sent as-is.
    assert_eq!(messages[4]["content"], "lib.rs");
}

#[test]
fn interleaved_fragments_reassemble_by_index() {
    let mut acc = StreamToolCallAccumulator::new();
    acc.push(&delta(json!({"index": 1, "id": "b", "function": {"name": "second", "arguments": "{\"y\""}})));
    acc.push(&delta(json!({"index": 0, "id": "a", "function": {"name": "first", "arguments": ""}})));
    acc.push(&delta(json!({"index": 1, "function": {"arguments": ":2}"}})));
    acc.push(&delta(json!({"function": {"arguments": "ignored"}})));
    assert_eq!(acc.len(), 2);

    let parts = acc.finish().unwrap();
    assert_eq!(
        parts,
        vec![
            Part::FunctionCall(FunctionCall::new(Some("a".into()), "first", json!({}))),
            Part::FunctionCall(FunctionCall::new(Some("b".into()), "second", json!({"y": 2}))),
        ]
    );
}

#[test]
fn whole_completion_maps_text_calls_and_usage() {
    let completion: ChatCompletion = serde_json::from_value(json!({
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": "Checking.",
                "tool_calls": [{"id": "call_9", "type": "function",
                                "function": {"name": "weather", "arguments": "{\"city\":\"Oslo\"}"}}]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 7, "completion_tokens": 5, "total_tokens": 12}
    }))
    .unwrap();

    let response = from_chat_completion(completion).unwrap();

    assert_eq!(response.text(), "Checking.");
    assert_eq!(response.finish_reason(), Some(FinishReason::ToolCall));
    assert_eq!(response.function_calls()[0].args, json!({"city": "Oslo"}));
    assert_eq!(response.usage_metadata.unwrap().total_token_count, 12);
}

#[tokio::test]
async fn malformed_streamed_arguments_fail_the_stream() {
    let server = start_openai_mock().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(sse_response(&[
            json!({"choices": [{"index": 0, "delta": {"content": "Trying."}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "c", "function": {"name": "f", "arguments": "{\"a\":"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        ]))
        .mount(&server)
        .await;

    let request = GenerateContentRequest {
        model: "gpt-4o".into(),
        contents: vec![Content::user_text("hi")],
        config: GenerationConfig::default(),
    };
    let items: Vec<_> = generator(&server)
        .generate_content_stream(request)
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(items[0].as_ref().unwrap().text(), "Trying.");
    let err = items.last().unwrap().as_ref().unwrap_err();
    assert!(matches!(err, ProviderError::Translate(_)));
    assert!(err.to_string().contains("malformed arguments for tool call 0 (f)"));
}
