//! Content-generation clients and the wire-protocol translator.
//!
//! # Architecture
//!
//! - [`ContentGenerator`] - the backend-agnostic client interface consumed by
//!   the session layer (`generate_content`, `generate_content_stream`,
//!   `count_tokens`, `embed_content`)
//! - [`openai`] - an OpenAI-compatible Chat Completions implementation
//! - [`convert`] - pure request/response translation
//! - [`accumulator`] - per-stream reassembly of fragmented tool-call arguments
//! - [`retry`] - backoff and model-fallback policy
//!
//! # Streaming
//!
//! Streams are lazy, finite and not restartable. Each item is an explicit
//! `Result`: a response chunk or the error that ended the stream. A clean end
//! of stream is `None`. Chunks are produced by a background task and delivered
//! over a bounded channel; dropping the stream stops the task.

pub mod accumulator;
pub mod convert;
pub mod openai;
pub mod retry;
pub mod wire;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc;

pub use parley_types;
use parley_types::{
    CountTokensRequest, CountTokensResponse, EmbedContentRequest, EmbedContentResponse,
    GenerateContentRequest, GenerateContentResponse,
};

pub use accumulator::StreamToolCallAccumulator;
pub use convert::TranslateError;
pub use openai::{OpenAiContentGenerator, OpenAiSettings};
pub use retry::{FallbackFut, FallbackHook, RetryConfig, RetryableError, retry_with_backoff};

/// Canonical OpenAI API base URL.
pub const OPENAI_API_BASE_URL: &str = "https://api.openai.com/v1";

const CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;

// Note: reqwest only exposes tcp_keepalive (idle time); interval/retries use platform defaults.
const TCP_KEEPALIVE_SECS: u64 = 60;

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Chunks buffered between the SSE reader task and the consumer.
const STREAM_CHANNEL_CAPACITY: usize = 32;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Non-success HTTP status.
    #[error("API error {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
}

impl RetryableError for ProviderError {
    fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(status.as_u16()),
            _ => None,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

// ============================================================================
// Client interface
// ============================================================================

/// Boxed future returned by [`ContentGenerator`] methods.
pub type ProviderFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Lazy sequence of response chunks.
pub type ContentStream =
    Pin<Box<dyn Stream<Item = Result<GenerateContentResponse, ProviderError>> + Send>>;

/// A backend able to generate model turns.
///
/// Implementations are interchangeable behind this trait; the session layer
/// never sees a wire format.
pub trait ContentGenerator: Send + Sync {
    fn generate_content(
        &self,
        request: GenerateContentRequest,
    ) -> ProviderFut<'_, GenerateContentResponse>;

    /// Starts a streamed generation. The future resolves once the backend has
    /// accepted the request; chunks then arrive through the stream.
    fn generate_content_stream(&self, request: GenerateContentRequest)
    -> ProviderFut<'_, ContentStream>;

    fn count_tokens(&self, request: CountTokensRequest) -> ProviderFut<'_, CountTokensResponse>;

    fn embed_content(&self, request: EmbedContentRequest)
    -> ProviderFut<'_, EmbedContentResponse>;
}

// ============================================================================
// HTTP client
// ============================================================================

pub(crate) fn base_client_builder() -> reqwest::ClientBuilder {
    use reqwest::header::{HeaderMap, HeaderValue};

    let mut default_headers = HeaderMap::new();
    default_headers.insert(
        "User-Agent",
        HeaderValue::from_static(concat!("parley/", env!("CARGO_PKG_VERSION"))),
    );

    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .default_headers(default_headers)
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Turn a non-success response into [`ProviderError::Api`].
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = retry::parse_retry_after(response.headers());
    let body = read_capped_error_body(response).await;
    Err(ProviderError::Api {
        status,
        body,
        retry_after,
    })
}

// ============================================================================
// SSE plumbing
// ============================================================================

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

type StreamItem = Result<GenerateContentResponse, ProviderError>;

#[derive(Debug)]
pub(crate) enum SseParseAction {
    /// Continue processing, no chunk to emit
    Continue,
    /// Emit these chunks and continue
    Emit(Vec<GenerateContentResponse>),
    /// Stream finished; emit these final chunks first
    Done(Vec<GenerateContentResponse>),
    Error(ProviderError),
}

/// Backend-specific mapping of decoded SSE payloads to response chunks.
pub(crate) trait SseParser: Send {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;

    /// Called on `[DONE]`; may flush buffered state.
    fn finish(&mut self) -> SseParseAction {
        SseParseAction::Done(Vec::new())
    }

    fn provider_name(&self) -> &'static str;
}

pub(crate) fn emit_or_continue(chunks: Vec<GenerateContentResponse>) -> SseParseAction {
    if chunks.is_empty() {
        SseParseAction::Continue
    } else {
        SseParseAction::Emit(chunks)
    }
}

async fn send_item(tx: &mpsc::Sender<StreamItem>, item: StreamItem) -> bool {
    tx.send(item).await.is_ok()
}

/// Forward every chunk; false once the consumer is gone.
async fn send_all(tx: &mpsc::Sender<StreamItem>, chunks: Vec<GenerateContentResponse>) -> bool {
    for chunk in chunks {
        if !send_item(tx, Ok(chunk)).await {
            return false;
        }
    }
    true
}

/// Process an SSE stream using a backend-specific parser.
///
/// This handles the common SSE processing logic:
/// - Timeout handling for idle streams
/// - Buffer management with size limits
/// - UTF-8 validation
/// - Event boundary detection
/// - `[DONE]` marker handling
/// - Parse error tracking with threshold
async fn process_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<StreamItem>,
    idle_timeout: Duration,
) {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut parse_errors = 0usize;

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            let _ = send_item(tx, Err(ProviderError::Stream("stream idle timeout".into()))).await;
            return;
        };

        let Some(chunk) = next else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = send_item(tx, Err(ProviderError::Transport(e))).await;
                return;
            }
        };
        buffer.extend_from_slice(&chunk);

        // Security: prevent unbounded buffer growth
        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            let _ = send_item(
                tx,
                Err(ProviderError::Stream(
                    "SSE buffer exceeded maximum size (4 MiB)".into(),
                )),
            )
            .await;
            return;
        }

        while let Some(event) = drain_next_sse_event(&mut buffer) {
            if event.is_empty() {
                continue;
            }

            let Ok(event) = std::str::from_utf8(&event) else {
                let _ = send_item(
                    tx,
                    Err(ProviderError::Stream(
                        "received invalid UTF-8 from SSE stream".into(),
                    )),
                )
                .await;
                return;
            };

            let Some(data) = extract_sse_data(event) else {
                continue;
            };

            let action = if data == "[DONE]" {
                parser.finish()
            } else {
                match serde_json::from_str::<serde_json::Value>(&data) {
                    Ok(json) => {
                        parse_errors = 0;
                        parser.parse(&json)
                    }
                    Err(e) => {
                        parse_errors = parse_errors.saturating_add(1);
                        tracing::warn!(
                            %e,
                            payload_bytes = data.len(),
                            provider = parser.provider_name(),
                            "Invalid SSE JSON payload"
                        );
                        if parse_errors >= MAX_SSE_PARSE_ERRORS {
                            SseParseAction::Error(ProviderError::Decode(e))
                        } else {
                            SseParseAction::Continue
                        }
                    }
                }
            };

            match action {
                SseParseAction::Continue => {}
                SseParseAction::Emit(chunks) => {
                    if !send_all(tx, chunks).await {
                        return;
                    }
                }
                SseParseAction::Done(chunks) => {
                    let _ = send_all(tx, chunks).await;
                    return;
                }
                SseParseAction::Error(error) => {
                    let _ = send_item(tx, Err(error)).await;
                    return;
                }
            }
        }
    }

    // Premature EOF: connection closed without completion signal
    let _ = send_item(
        tx,
        Err(ProviderError::Stream(
            "connection closed before stream completed".into(),
        )),
    )
    .await;
}

/// Spawn the SSE reader and expose its output as a [`ContentStream`].
pub(crate) fn spawn_sse_stream<P>(
    response: reqwest::Response,
    mut parser: P,
    idle_timeout: Duration,
) -> ContentStream
where
    P: SseParser + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        process_sse_stream(response, &mut parser, &tx, idle_timeout).await;
    });
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}
