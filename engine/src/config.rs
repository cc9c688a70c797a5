//! Runtime session configuration shared by the chat session and scheduler.
//!
//! Everything here is read-only after construction except the active model,
//! which the fallback path may switch when rate limiting persists.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use parley_providers::{FallbackFut, FallbackHook};
pub use parley_types::{DEFAULT_FALLBACK_MODEL, DEFAULT_MODEL};
use parley_types::AuthType;

/// Boxed future resolving to the user's consent decision.
pub type ConsentFut<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Asks the user whether to switch from `current` to `fallback`.
pub trait FallbackConsent: Send + Sync {
    fn approve<'a>(&'a self, current: &'a str, fallback: &'a str) -> ConsentFut<'a>;
}

pub struct Config {
    session_id: String,
    model: RwLock<String>,
    fallback_model: String,
    auth_type: AuthType,
    usage_statistics_enabled: bool,
    log_prompts: bool,
    debug_mode: bool,
    fallback_consent: Option<Arc<dyn FallbackConsent>>,
}

impl Config {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            model: RwLock::new(model.into()),
            fallback_model: DEFAULT_FALLBACK_MODEL.to_string(),
            auth_type: AuthType::default(),
            usage_statistics_enabled: true,
            log_prompts: false,
            debug_mode: false,
            fallback_consent: None,
        }
    }

    #[must_use]
    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = model.into();
        self
    }

    #[must_use]
    pub fn with_auth_type(mut self, auth_type: AuthType) -> Self {
        self.auth_type = auth_type;
        self
    }

    #[must_use]
    pub fn with_usage_statistics(mut self, enabled: bool) -> Self {
        self.usage_statistics_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_log_prompts(mut self, enabled: bool) -> Self {
        self.log_prompts = enabled;
        self
    }

    #[must_use]
    pub fn with_debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }

    #[must_use]
    pub fn with_fallback_consent(mut self, consent: Arc<dyn FallbackConsent>) -> Self {
        self.fallback_consent = Some(consent);
        self
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The model used for the next request.
    #[must_use]
    pub fn model(&self) -> String {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_model(&self, model: impl Into<String>) {
        let model = model.into();
        tracing::info!(%model, "Active model changed");
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = model;
    }

    #[must_use]
    pub fn fallback_model(&self) -> &str {
        &self.fallback_model
    }

    #[must_use]
    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    #[must_use]
    pub fn usage_statistics_enabled(&self) -> bool {
        self.usage_statistics_enabled
    }

    #[must_use]
    pub fn log_prompts(&self) -> bool {
        self.log_prompts
    }

    #[must_use]
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("session_id", &self.session_id)
            .field("model", &self.model())
            .field("fallback_model", &self.fallback_model)
            .field("auth_type", &self.auth_type)
            .field("usage_statistics_enabled", &self.usage_statistics_enabled)
            .field("log_prompts", &self.log_prompts)
            .field("debug_mode", &self.debug_mode)
            .field("fallback_consent", &self.fallback_consent.is_some())
            .finish()
    }
}

/// Only personal OAuth sessions fall back, and only once they are off the
/// fallback model already. A consent handler, when installed, may veto.
impl FallbackHook for Config {
    fn on_persistent_429(&self, auth_type: AuthType) -> FallbackFut<'_> {
        Box::pin(async move {
            if auth_type != AuthType::OauthPersonal {
                return None;
            }
            let current = self.model();
            let fallback = self.fallback_model.clone();
            if current == fallback {
                return None;
            }
            if let Some(consent) = &self.fallback_consent
                && !consent.approve(&current, &fallback).await
            {
                tracing::debug!(%current, "Fallback declined");
                return None;
            }
            self.set_model(fallback.clone());
            Some(fallback)
        })
    }
}
