//! Session behavior against a mocked Chat Completions backend.

use futures_util::StreamExt;
use parley_engine::{AuthType, ChatError, Config, Role, SendMessageParams};
use parley_types::GenerationConfig;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{
    COMPLETIONS_PATH, completion, mount_chat_response, mount_streaming_response,
    request_bodies, session, session_with, start_openai_mock,
};

#[tokio::test]
async fn send_message_records_exchange_and_resends_history() {
    let server = start_openai_mock().await;
    mount_chat_response(&server, "Hi there!").await;
    let chat = session(&server, Config::new("gpt-4o"));

    let response = chat
        .send_message(SendMessageParams::text("Hello"))
        .await
        .unwrap();
    assert_eq!(response.text(), "Hi there!");

    chat.send_message(SendMessageParams::text("Again"))
        .await
        .unwrap();

    let history = chat.get_history(false);
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].text(), "Hi there!");

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["model"], "gpt-4o");
    assert!(bodies[0].get("stream").is_none());
    assert_eq!(
        bodies[1]["messages"],
        json!([
            {"role": "user", "content": "Hello"},
            {"role": "assistant", "content": "Hi there!"},
            {"role": "user", "content": "Again"}
        ])
    );
}

#[tokio::test]
async fn system_instruction_leads_the_request() {
    let server = start_openai_mock().await;
    mount_chat_response(&server, "ok").await;
    let chat = session_with(
        &server,
        Config::new("gpt-4o"),
        GenerationConfig {
            system_instruction: Some("Be brief.".into()),
            temperature: Some(0.2),
            ..Default::default()
        },
    );

    chat.send_message(SendMessageParams::text("hi")).await.unwrap();

    let body = &request_bodies(&server).await[0];
    assert_eq!(body["messages"][0], json!({"role": "system", "content": "Be brief."}));
    assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    assert!(body.get("tools").is_none());
}

#[tokio::test]
async fn client_error_is_not_retried_and_history_is_untouched() {
    let server = start_openai_mock().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
        .expect(1)
        .mount(&server)
        .await;
    let chat = session(&server, Config::new("gpt-4o"));

    let err = chat
        .send_message(SendMessageParams::text("Hello"))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "API error 400 Bad Request: bad input");
    assert!(chat.get_history(false).is_empty());
}

#[tokio::test]
async fn client_error_mentioning_status_numbers_keeps_the_model() {
    let server = start_openai_mock().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string("context length 14290 tokens exceeds limit of 512"),
        )
        .expect(1)
        .mount(&server)
        .await;
    let config = Config::new("gpt-4o")
        .with_fallback_model("gpt-4o-mini")
        .with_auth_type(AuthType::OauthPersonal);
    let chat = session(&server, config);

    let err = chat
        .send_message(SendMessageParams::text("Hello"))
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("API error 400 Bad Request"));
    assert_eq!(chat.config().model(), "gpt-4o");
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = start_openai_mock().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_chat_response(&server, "recovered").await;
    let chat = session(&server, Config::new("gpt-4o"));

    let response = chat
        .send_message(SendMessageParams::text("Hello"))
        .await
        .unwrap();

    assert_eq!(response.text(), "recovered");
    assert_eq!(request_bodies(&server).await.len(), 3);
}

#[tokio::test]
async fn persistent_rate_limit_falls_back_for_personal_accounts() {
    let server = start_openai_mock().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("from the small model")))
        .mount(&server)
        .await;
    let config = Config::new("gpt-4o")
        .with_fallback_model("gpt-4o-mini")
        .with_auth_type(AuthType::OauthPersonal);
    let chat = session(&server, config);

    let response = chat
        .send_message(SendMessageParams::text("Hello"))
        .await
        .unwrap();

    assert_eq!(response.text(), "from the small model");
    assert_eq!(chat.config().model(), "gpt-4o-mini");
    let models: Vec<_> = request_bodies(&server)
        .await
        .iter()
        .map(|body| body["model"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(models, ["gpt-4o", "gpt-4o", "gpt-4o-mini"]);
}

#[tokio::test]
async fn stream_records_full_reply_once_drained() {
    let server = start_openai_mock().await;
    mount_streaming_response(&server, &["Hel", "lo, ", "world"]).await;
    let chat = session(&server, Config::new("gpt-4o"));

    let mut stream = chat
        .send_message_stream(SendMessageParams::text("Greet me"))
        .await
        .unwrap();
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        text.push_str(&chunk.unwrap().text());
    }
    drop(stream);

    assert_eq!(text, "Hello, world");
    let history = chat.get_history(true);
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].role, Role::Model);
    assert_eq!(history[1].text(), "Hello, world");

    let body = &request_bodies(&server).await[0];
    assert_eq!(body["stream"], true);
    assert_eq!(body["stream_options"]["include_usage"], true);
}

#[tokio::test]
async fn cancelled_send_never_reaches_the_backend() {
    let server = start_openai_mock().await;
    mount_chat_response(&server, "unused").await;
    let chat = session(&server, Config::new("gpt-4o"));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = chat
        .send_message(SendMessageParams::text("Hello").with_cancel(cancel))
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::Cancelled));
    assert!(request_bodies(&server).await.is_empty());
    assert!(chat.get_history(false).is_empty());
}
