//! Shared test utilities and fixtures
//!
//! A wiremock server standing in for an OpenAI-compatible backend, plus
//! session builders wired the way the binary wires them.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_engine::{ChatSession, Config, GenerationConfig, RetryConfig};
use parley_providers::{OpenAiContentGenerator, OpenAiSettings};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Start a mock server that simulates the Chat Completions API
pub async fn start_openai_mock() -> MockServer {
    MockServer::start().await
}

pub fn generator(server: &MockServer) -> OpenAiContentGenerator {
    OpenAiContentGenerator::new(OpenAiSettings {
        base_url: format!("{}/v1", server.uri()),
        api_key: Some("sk-test".into()),
        stream_idle_timeout: Duration::from_secs(5),
    })
    .expect("client builds")
}

/// Short backoff so retry tests finish quickly.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_factor: 0.0,
        persistent_429_threshold: 2,
    }
}

pub fn session(server: &MockServer, config: Config) -> ChatSession {
    session_with(server, config, GenerationConfig::default())
}

pub fn session_with(
    server: &MockServer,
    config: Config,
    generation_config: GenerationConfig,
) -> ChatSession {
    ChatSession::new(
        Arc::new(config),
        Arc::new(generator(server)),
        generation_config,
        Vec::new(),
    )
    .with_retry_config(fast_retry())
}

/// Encode events as an SSE body terminated by `[DONE]`.
pub fn sse(events: &[Value]) -> String {
    let mut body = String::new();
    for event in events {
        body.push_str(&format!("data: {event}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

pub fn sse_response(events: &[Value]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(sse(events))
}

pub fn completion(text: &str) -> Value {
    json!({
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
    })
}

/// Mount a non-streaming completion answering every request.
pub async fn mount_chat_response(server: &MockServer, text: &str) {
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(text)))
        .mount(server)
        .await;
}

/// Mount a streamed reply delivering `chunks` as text deltas.
pub async fn mount_streaming_response(server: &MockServer, chunks: &[&str]) {
    let mut events: Vec<Value> = chunks
        .iter()
        .map(|chunk| json!({"choices": [{"index": 0, "delta": {"content": chunk}}]}))
        .collect();
    events.push(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}));
    events.push(json!({
        "choices": [],
        "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
    }));

    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(sse_response(&events))
        .mount(server)
        .await;
}

/// Streamed tool calls, each `(id, name, arguments)` split into two fragments.
pub fn tool_call_events(calls: &[(&str, &str, &str)]) -> Vec<Value> {
    let mut events = Vec::new();
    for (index, (id, name, arguments)) in calls.iter().enumerate() {
        let split = arguments.len() / 2;
        events.push(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": index, "id": id, "type": "function",
             "function": {"name": name, "arguments": &arguments[..split]}}
        ]}}]}));
        events.push(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": index, "function": {"arguments": &arguments[split..]}}
        ]}}]}));
    }
    events.push(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}));
    events
}

/// JSON bodies of every request the server received, in order.
pub async fn request_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).expect("JSON request body"))
        .collect()
}
