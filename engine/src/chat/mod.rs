//! Chat session: conversation history, serialized sends, retry with model
//! fallback and history consolidation.
//!
//! History is a single authoritative list. The curated view used to build
//! requests is derived from it on demand by [`extract_curated_history`].

mod history;
mod stream;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use parley_providers::{
    ContentGenerator, FallbackHook, ProviderError, RetryConfig, retry_with_backoff,
};
use parley_types::{
    Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, InvalidRoleError,
    Part, Role,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as SendLock;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::telemetry::{ApiErrorEvent, ApiRequestEvent, ApiResponseEvent, NoopTelemetry, Telemetry};

pub use history::{dedup_afc_history, extract_curated_history, record_history};
pub use stream::ChatStream;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Backend failure after retries, unchanged.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    InvalidRole(#[from] InvalidRoleError),
    #[error("invalid history: {0}")]
    InvalidHistory(String),
}

/// One outgoing user turn.
#[derive(Debug, Clone, Default)]
pub struct SendMessageParams {
    pub parts: Vec<Part>,
    /// Overlay merged over the session's generation config for this call.
    pub config: Option<GenerationConfig>,
    pub cancel: CancellationToken,
}

impl SendMessageParams {
    #[must_use]
    pub fn new(parts: Vec<Part>) -> Self {
        Self {
            parts,
            ..Self::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![Part::text(text)])
    }

    #[must_use]
    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Parse serialized history, rejecting any role other than `user`/`model`.
pub fn parse_history(value: &Value) -> Result<Vec<Content>, ChatError> {
    let entries = value
        .as_array()
        .ok_or_else(|| ChatError::InvalidHistory("expected an array of turns".to_string()))?;
    entries
        .iter()
        .map(|entry| {
            let role = entry.get("role").and_then(Value::as_str).unwrap_or_default();
            let role = Role::parse(role)?;
            let parts = match entry.get("parts") {
                Some(parts) => serde_json::from_value::<Vec<Part>>(parts.clone())
                    .map_err(|e| ChatError::InvalidHistory(e.to_string()))?,
                None => Vec::new(),
            };
            Ok(Content::new(role, parts))
        })
        .collect()
}

pub struct ChatSession {
    config: Arc<Config>,
    generator: Arc<dyn ContentGenerator>,
    generation_config: GenerationConfig,
    history: Arc<Mutex<Vec<Content>>>,
    send_lock: Arc<SendLock<()>>,
    retry: RetryConfig,
    telemetry: Arc<dyn Telemetry>,
}

impl ChatSession {
    pub fn new(
        config: Arc<Config>,
        generator: Arc<dyn ContentGenerator>,
        generation_config: GenerationConfig,
        history: Vec<Content>,
    ) -> Self {
        Self {
            config,
            generator,
            generation_config,
            history: Arc::new(Mutex::new(history)),
            send_lock: Arc::new(SendLock::new(())),
            retry: RetryConfig::default(),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Seed a session from serialized history.
    pub fn from_json_history(
        config: Arc<Config>,
        generator: Arc<dyn ContentGenerator>,
        generation_config: GenerationConfig,
        history: &Value,
    ) -> Result<Self, ChatError> {
        let history = parse_history(history)?;
        Ok(Self::new(config, generator, generation_config, history))
    }

    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }

    pub fn set_generation_config(&mut self, generation_config: GenerationConfig) {
        self.generation_config = generation_config;
    }

    // ------------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------------

    fn lock_history(&self) -> MutexGuard<'_, Vec<Content>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the history; `curated` selects the view used for requests.
    #[must_use]
    pub fn get_history(&self, curated: bool) -> Vec<Content> {
        let history = self.lock_history();
        if curated {
            extract_curated_history(&history)
        } else {
            history.clone()
        }
    }

    pub fn clear_history(&self) {
        self.lock_history().clear();
    }

    pub fn add_history(&self, content: Content) {
        self.lock_history().push(content);
    }

    pub fn set_history(&self, history: Vec<Content>) {
        *self.lock_history() = history;
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    fn request_config(&self, overlay: Option<&GenerationConfig>) -> GenerationConfig {
        overlay.map_or_else(
            || self.generation_config.clone(),
            |overlay| self.generation_config.merged_with(overlay),
        )
    }

    fn emit_request(&self, user_input: &Content) {
        self.telemetry.api_request(&ApiRequestEvent {
            session_id: self.config.session_id(),
            model: &self.config.model(),
            request_text: &user_input.text(),
        });
    }

    fn emit_error(&self, started: Instant, error: &ChatError) {
        self.telemetry.api_error(&ApiErrorEvent {
            session_id: self.config.session_id(),
            model: &self.config.model(),
            duration: started.elapsed(),
            error: &error.to_string(),
        });
    }

    /// Send one user turn and wait for the whole model turn.
    ///
    /// Sends are serialized per session; a cancelled token also abandons the
    /// wait for an earlier send. On failure the exchange is not recorded.
    pub async fn send_message(
        &self,
        params: SendMessageParams,
    ) -> Result<GenerateContentResponse, ChatError> {
        let _guard = tokio::select! {
            biased;
            () = params.cancel.cancelled() => return Err(ChatError::Cancelled),
            guard = self.send_lock.lock() => guard,
        };

        let user_input = Content::new(Role::User, params.parts);
        let mut contents = self.get_history(true);
        let curated_len = contents.len();
        contents.push(user_input.clone());
        let generation_config = self.request_config(params.config.as_ref());

        self.emit_request(&user_input);
        let started = Instant::now();

        let attempt = || {
            let request = GenerateContentRequest {
                model: self.config.model(),
                contents: contents.clone(),
                config: generation_config.clone(),
            };
            let generator = Arc::clone(&self.generator);
            async move { generator.generate_content(request).await }
        };
        let fallback: &dyn FallbackHook = self.config.as_ref();
        let result = tokio::select! {
            biased;
            () = params.cancel.cancelled() => Err(ChatError::Cancelled),
            result = retry_with_backoff(attempt, &self.retry, self.config.auth_type(), Some(fallback)) => {
                result.map_err(ChatError::from)
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                self.emit_error(started, &error);
                return Err(error);
            }
        };

        self.telemetry.api_response(&ApiResponseEvent {
            session_id: self.config.session_id(),
            model: &self.config.model(),
            duration: started.elapsed(),
            usage: response.usage_metadata.as_ref(),
            response_text: &response.text(),
        });

        let afc = dedup_afc_history(&response.automatic_function_calling_history, curated_len);
        let output: Vec<Content> = response.first_content().cloned().into_iter().collect();
        record_history(&mut self.lock_history(), user_input, output, &afc);

        Ok(response)
    }

    /// Send one user turn and stream the model's reply.
    ///
    /// Establishing the stream is retried like [`Self::send_message`]. The
    /// returned stream keeps this session's send lock until it ends, and
    /// records the exchange only if drained to the end.
    pub async fn send_message_stream(
        &self,
        params: SendMessageParams,
    ) -> Result<ChatStream, ChatError> {
        let guard = tokio::select! {
            biased;
            () = params.cancel.cancelled() => return Err(ChatError::Cancelled),
            guard = Arc::clone(&self.send_lock).lock_owned() => guard,
        };

        let user_input = Content::new(Role::User, params.parts);
        let mut contents = self.get_history(true);
        contents.push(user_input.clone());
        let generation_config = self.request_config(params.config.as_ref());

        self.emit_request(&user_input);
        let started = Instant::now();

        let attempt = || {
            let request = GenerateContentRequest {
                model: self.config.model(),
                contents: contents.clone(),
                config: generation_config.clone(),
            };
            let generator = Arc::clone(&self.generator);
            async move { generator.generate_content_stream(request).await }
        };
        let fallback: &dyn FallbackHook = self.config.as_ref();
        let result = tokio::select! {
            biased;
            () = params.cancel.cancelled() => Err(ChatError::Cancelled),
            result = retry_with_backoff(attempt, &self.retry, self.config.auth_type(), Some(fallback)) => {
                result.map_err(ChatError::from)
            }
        };

        let inner = match result {
            Ok(inner) => inner,
            Err(error) => {
                self.emit_error(started, &error);
                return Err(error);
            }
        };

        let exchange = stream::Exchange {
            _guard: guard,
            history: Arc::clone(&self.history),
            user_input,
            telemetry: Arc::clone(&self.telemetry),
            session_id: self.config.session_id().to_string(),
            model: self.config.model(),
            started,
            output: Vec::new(),
            usage: None,
            response_text: String::new(),
        };
        Ok(ChatStream::new(
            inner,
            params.cancel.cancelled_owned(),
            exchange,
        ))
    }
}

impl fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatSession")
            .field("config", &self.config)
            .field("generation_config", &self.generation_config)
            .field("history_len", &self.lock_history().len())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
