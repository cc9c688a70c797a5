//! Settings file model for Parley (`~/.parley/config.toml`).
//!
//! Every section is optional. Values resolve in order: environment override,
//! file, built-in default. String values may reference environment variables
//! as `${NAME}`.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_types::AuthType;
pub use parley_types::{DEFAULT_FALLBACK_MODEL, DEFAULT_MODEL};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_MAX_TURNS: u32 = 25;

pub const MODEL_ENV: &str = "PARLEY_MODEL";
pub const BASE_URL_ENV: &str = "OPENAI_BASE_URL";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfig {
    pub app: Option<AppConfig>,
    pub openai: Option<OpenAiConfig>,
    pub retry: Option<RetrySection>,
    pub telemetry: Option<TelemetrySection>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    pub model: Option<String>,
    /// Cheaper model used after persistent rate limiting.
    pub fallback_model: Option<String>,
    /// `oauth-personal`, `api-key`, `cloud-project` or `openai-compatible`.
    pub auth_type: Option<String>,
    /// Model turns per prompt before the agent loop gives up.
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Default, Deserialize)]
pub struct OpenAiConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub stream_idle_timeout_secs: Option<u64>,
}

// Manual Debug impl to prevent leaking API keys in logs.
impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &if self.api_key.is_some() { "[REDACTED]" } else { "None" },
            )
            .field("stream_idle_timeout_secs", &self.stream_idle_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    /// Consecutive 429s before the fallback hook is consulted.
    pub persistent_429_threshold: Option<u32>,
}

impl RetrySection {
    #[must_use]
    pub fn initial_delay(&self) -> Option<Duration> {
        self.initial_delay_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TelemetrySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Include prompt and response text in telemetry events.
    #[serde(default)]
    pub log_prompts: bool,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            enabled: true,
            log_prompts: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Replace `${NAME}` with the variable's value (empty when unset).
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if var.is_empty() {
            out.push_str("${}");
        } else {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl ParleyConfig {
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    // ------------------------------------------------------------------------
    // Resolved values
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn model(&self) -> String {
        non_empty_env(MODEL_ENV)
            .or_else(|| self.app.as_ref().and_then(|app| app.model.clone()))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    #[must_use]
    pub fn fallback_model(&self) -> String {
        self.app
            .as_ref()
            .and_then(|app| app.fallback_model.clone())
            .unwrap_or_else(|| DEFAULT_FALLBACK_MODEL.to_string())
    }

    /// Unknown values fall back to the default with a warning.
    #[must_use]
    pub fn auth_type(&self) -> AuthType {
        let Some(raw) = self.app.as_ref().and_then(|app| app.auth_type.as_deref()) else {
            return AuthType::default();
        };
        AuthType::parse(raw).unwrap_or_else(|| {
            tracing::warn!(auth_type = raw, "Unknown auth_type; using default");
            AuthType::default()
        })
    }

    #[must_use]
    pub fn max_turns(&self) -> u32 {
        self.app
            .as_ref()
            .and_then(|app| app.max_turns)
            .unwrap_or(DEFAULT_MAX_TURNS)
            .max(1)
    }

    #[must_use]
    pub fn debug(&self) -> bool {
        self.app.as_ref().is_some_and(|app| app.debug)
    }

    #[must_use]
    pub fn base_url(&self) -> Option<String> {
        non_empty_env(BASE_URL_ENV).or_else(|| {
            self.openai
                .as_ref()
                .and_then(|openai| openai.base_url.as_deref())
                .map(expand_env_vars)
        })
    }

    /// File value (with `${VAR}` expansion) first, then `OPENAI_API_KEY`.
    #[must_use]
    pub fn api_key(&self) -> Option<String> {
        self.openai
            .as_ref()
            .and_then(|openai| openai.api_key.as_deref())
            .map(expand_env_vars)
            .filter(|key| !key.trim().is_empty())
            .or_else(|| non_empty_env(API_KEY_ENV))
    }

    #[must_use]
    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        self.openai
            .as_ref()
            .and_then(|openai| openai.stream_idle_timeout_secs)
            .map(Duration::from_secs)
    }

    #[must_use]
    pub fn telemetry(&self) -> TelemetrySection {
        self.telemetry.unwrap_or_default()
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".parley").join("config.toml"))
}
