//! The stream returned by [`ChatSession::send_message_stream`].
//!
//! [`ChatSession::send_message_stream`]: super::ChatSession::send_message_stream

use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::Stream;
use parley_providers::ContentStream;
use parley_types::{Content, GenerateContentResponse, UsageMetadata};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::WaitForCancellationFutureOwned;

use super::ChatError;
use super::history::record_history;
use crate::telemetry::{ApiErrorEvent, ApiResponseEvent, Telemetry};

/// Response chunks of one streamed exchange.
///
/// Every chunk is forwarded, thoughts and invalid chunks included. History is
/// updated only once the backend stream ends; an error, a cancellation or
/// dropping the stream early leaves history untouched. The session's send
/// lock is held until one of those happens.
pub struct ChatStream {
    inner: ContentStream,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    exchange: Option<Exchange>,
}

/// Bookkeeping for an exchange that has not finished yet.
pub(super) struct Exchange {
    pub(super) _guard: OwnedMutexGuard<()>,
    pub(super) history: Arc<Mutex<Vec<Content>>>,
    pub(super) user_input: Content,
    pub(super) telemetry: Arc<dyn Telemetry>,
    pub(super) session_id: String,
    pub(super) model: String,
    pub(super) started: Instant,
    pub(super) output: Vec<Content>,
    pub(super) usage: Option<UsageMetadata>,
    pub(super) response_text: String,
}

impl Exchange {
    fn observe(&mut self, chunk: &GenerateContentResponse) {
        if chunk.usage_metadata.is_some() {
            self.usage = chunk.usage_metadata;
        }
        if !chunk.is_valid() {
            return;
        }
        let Some(content) = chunk.first_content() else {
            return;
        };
        if content.is_thought_content() {
            return;
        }
        self.response_text.push_str(&content.text());
        self.output.push(content.clone());
    }

    fn complete(mut self) {
        let output = mem::take(&mut self.output);
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            record_history(&mut history, self.user_input, output, &[]);
        }
        self.telemetry.api_response(&ApiResponseEvent {
            session_id: &self.session_id,
            model: &self.model,
            duration: self.started.elapsed(),
            usage: self.usage.as_ref(),
            response_text: &self.response_text,
        });
    }

    fn fail(self, error: &str) {
        self.telemetry.api_error(&ApiErrorEvent {
            session_id: &self.session_id,
            model: &self.model,
            duration: self.started.elapsed(),
            error,
        });
    }
}

impl ChatStream {
    pub(super) fn new(
        inner: ContentStream,
        cancelled: WaitForCancellationFutureOwned,
        exchange: Exchange,
    ) -> Self {
        Self {
            inner,
            cancelled: Box::pin(cancelled),
            exchange: Some(exchange),
        }
    }
}

impl Stream for ChatStream {
    type Item = Result<GenerateContentResponse, ChatError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(exchange) = this.exchange.as_mut() else {
            return Poll::Ready(None);
        };

        if this.cancelled.as_mut().poll(cx).is_ready() {
            tracing::debug!("Stream cancelled before completion");
            if let Some(exchange) = this.exchange.take() {
                exchange.fail("cancelled");
            }
            return Poll::Ready(Some(Err(ChatError::Cancelled)));
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                exchange.observe(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                if let Some(exchange) = this.exchange.take() {
                    exchange.fail(&error.to_string());
                }
                Poll::Ready(Some(Err(error.into())))
            }
            Poll::Ready(None) => {
                if let Some(exchange) = this.exchange.take() {
                    exchange.complete();
                }
                Poll::Ready(None)
            }
        }
    }
}
