//! Retry policy with exponential backoff and model fallback.
//!
//! # Retry Policy
//!
//! - Max attempts: 5 (including the first)
//! - Initial delay: 5s, doubling per attempt
//! - Max delay: 30s
//! - Jitter: down-jitter up to 30% (multiplier in [0.7, 1.0])
//! - A server-provided `Retry-After` wins over computed backoff
//!
//! # Retryable Conditions
//!
//! An error is retried when its HTTP status is `429` or any `5xx`. The status
//! comes from [`RetryableError::status`]; errors that carry none are matched
//! on a leading `API error <status>` in their message. Response bodies are
//! never scanned.
//!
//! # Fallback
//!
//! After [`RetryConfig::persistent_429_threshold`] consecutive 429 failures the
//! [`FallbackHook`] is consulted with the session's auth mode. If it names a
//! model, the attempt budget and backoff are reset and the loop continues; the
//! next attempt builds its request from the switched model.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;

use parley_types::AuthType;
use regex::Regex;
use reqwest::header::HeaderMap;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, counting the first.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor for down-jitter (0.3 = up to 30% reduction).
    pub jitter_factor: f64,
    /// Consecutive 429s before the fallback hook is consulted.
    pub persistent_429_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(5000),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.3,
            persistent_429_threshold: 2,
        }
    }
}

/// Errors the retry loop can classify.
pub trait RetryableError: Display {
    /// HTTP status of the failed call, when there was one.
    fn status(&self) -> Option<u16> {
        None
    }

    /// Server-requested delay, when the backend sent one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Boxed future returned by [`FallbackHook::on_persistent_429`].
pub type FallbackFut<'a> = Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;

/// Decides whether to switch models once rate limiting persists.
pub trait FallbackHook: Send + Sync {
    /// Returns the model switched to, or `None` to keep retrying as-is.
    fn on_persistent_429(&self, auth_type: AuthType) -> FallbackFut<'_>;
}

/// Parse `Retry-After` or `Retry-After-Ms` headers.
///
/// Returns `Some(duration)` if a valid value is found and `0 < duration < 60s`.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(val) = headers.get("retry-after-ms")
        && let Ok(s) = val.to_str()
        && let Ok(ms) = s.parse::<f64>()
    {
        let duration = Duration::from_secs_f64(ms / 1000.0);
        if duration > Duration::ZERO && duration < Duration::from_secs(60) {
            return Some(duration);
        }
    }

    if let Some(val) = headers.get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        let duration = Duration::from_secs(secs);
        if duration > Duration::ZERO && duration < Duration::from_secs(60) {
            return Some(duration);
        }
    }

    None
}

fn api_status_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^API error (\d{3})\b").expect("valid API status regex"))
}

/// Status named by a leading `API error <status>` in `message`.
#[must_use]
pub fn status_from_message(message: &str) -> Option<u16> {
    api_status_pattern()
        .captures(message)
        .and_then(|caps| caps[1].parse().ok())
}

#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// True when the message reports a 429 status.
#[must_use]
pub fn is_rate_limited(message: &str) -> bool {
    status_from_message(message) == Some(429)
}

/// True when the message reports a 429 or 5xx status.
#[must_use]
pub fn should_retry(message: &str) -> bool {
    status_from_message(message).is_some_and(is_retryable_status)
}

/// Calculate retry delay with exponential backoff and jitter.
///
/// `backoff_step` is 0 before the first retry, 1 before the second, etc.
#[must_use]
pub fn calculate_retry_delay(
    backoff_step: u32,
    config: &RetryConfig,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(delay) = retry_after {
        return delay;
    }

    // Exponential backoff: initial_delay * 2^backoff_step
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(backoff_step as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Down-jitter: multiply by random factor in [1 - jitter_factor, 1.0]
    let jitter = 1.0 - rand::random::<f64>() * config.jitter_factor;
    Duration::from_secs_f64(capped * jitter)
}

/// Run `operation` until it succeeds, fails permanently, or the attempt budget
/// runs out. The last error is returned unchanged.
///
/// `operation` is invoked afresh for every attempt so it can pick up a model
/// switched by the fallback hook.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    auth_type: AuthType,
    fallback: Option<&dyn FallbackHook>,
) -> Result<T, E>
where
    E: RetryableError,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut consecutive_429 = 0u32;

    loop {
        attempt += 1;
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let message = error.to_string();
        let status = error.status().or_else(|| status_from_message(&message));
        if !status.is_some_and(is_retryable_status) || attempt >= max_attempts {
            if attempt > 1 {
                tracing::warn!(attempt, error = %message, "Giving up after retries");
            }
            return Err(error);
        }

        if status == Some(429) {
            consecutive_429 += 1;
            if consecutive_429 >= config.persistent_429_threshold
                && let Some(hook) = fallback
            {
                consecutive_429 = 0;
                if let Some(model) = hook.on_persistent_429(auth_type).await {
                    tracing::info!(%model, "Switched model after persistent rate limiting");
                    attempt = 0;
                    continue;
                }
            }
        } else {
            consecutive_429 = 0;
        }

        let delay = calculate_retry_delay(attempt - 1, config, error.retry_after());
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis(),
            error = %message,
            "Retrying after transient error"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(String);

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl RetryableError for TestError {}

    fn err(message: &str) -> TestError {
        TestError(message.to_string())
    }

    /// Fast retry config for tests (no delays).
    fn fast_retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
            persistent_429_threshold: 2,
        }
    }

    struct RecordingHook {
        calls: Mutex<Vec<AuthType>>,
        switch_to: Option<String>,
    }

    impl RecordingHook {
        fn new(switch_to: Option<&str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                switch_to: switch_to.map(str::to_string),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl FallbackHook for RecordingHook {
        fn on_persistent_429(&self, auth_type: AuthType) -> FallbackFut<'_> {
            self.calls.lock().unwrap().push(auth_type);
            let model = self.switch_to.clone();
            Box::pin(async move { model })
        }
    }

    /// Error carrying its status out of band, like `ProviderError::Api`.
    #[derive(Debug)]
    struct StatusError {
        status: u16,
        body: &'static str,
    }

    impl Display for StatusError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "API error {}: {}", self.status, self.body)
        }
    }

    impl RetryableError for StatusError {
        fn status(&self) -> Option<u16> {
            Some(self.status)
        }
    }

    #[test]
    fn classifies_retryable_messages() {
        assert!(should_retry("API error 429 Too Many Requests: slow down"));
        assert!(should_retry("API error 503 Service Unavailable: "));
        assert!(!should_retry("API error 400 Bad Request: nope"));
        assert!(!should_retry("API error 404 Not Found: 15000 tokens"));
        assert!(!should_retry("upstream returned 500"));
    }

    #[test]
    fn status_numbers_in_the_body_are_ignored() {
        assert!(!should_retry("API error 400 Bad Request: max_tokens must be <= 512"));
        assert!(!should_retry(
            "API error 400 Bad Request: context length 14290 tokens exceeds limit"
        ));
        assert!(!is_rate_limited(
            "API error 400 Bad Request: context length 14290 tokens exceeds limit"
        ));
        assert!(!is_rate_limited("API error 500 Internal Server Error: 429 upstream"));
    }

    #[tokio::test]
    async fn client_error_with_status_like_body_is_not_retried() {
        for body in [
            "max_tokens must be <= 512",
            "context length 14290 tokens exceeds limit",
        ] {
            let attempts = AtomicU32::new(0);
            let hook = RecordingHook::new(Some("flash"));
            let result: Result<(), _> = retry_with_backoff(
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async move { Err(StatusError { status: 400, body }) }
                },
                &fast_retry_config(),
                AuthType::OauthPersonal,
                Some(&hook),
            )
            .await;

            assert_eq!(
                result.unwrap_err().to_string(),
                format!("API error 400: {body}")
            );
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
            assert_eq!(hook.call_count(), 0);
        }
    }

    #[tokio::test]
    async fn out_of_band_status_wins_over_message() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(StatusError { status: 502, body: "gateway" })
                    } else {
                        Ok(())
                    }
                }
            },
            &fast_retry_config(),
            AuthType::ApiKey,
            None,
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parse_retry_after_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after-ms", HeaderValue::from_static("1500"));
        assert_eq!(
            parse_retry_after(&headers),
            Some(Duration::from_millis(1500))
        );

        headers.clear();
        headers.insert("retry-after", HeaderValue::from_static("5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(5)));

        headers.clear();
        headers.insert("retry-after", HeaderValue::from_static("120"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_calculate_retry_delay_bounds() {
        let config = RetryConfig::default();

        // First retry: base = 5s, jitter in [0.7, 1.0]
        for _ in 0..100 {
            let delay = calculate_retry_delay(0, &config, None);
            assert!(delay >= Duration::from_millis(3500));
            assert!(delay <= Duration::from_millis(5000));
        }

        // Far along the curve the cap applies.
        let delay = calculate_retry_delay(10, &config, None);
        assert!(delay <= Duration::from_secs(30));

        assert_eq!(
            calculate_retry_delay(0, &config, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }

    #[tokio::test]
    async fn succeeds_after_two_rate_limits() {
        let attempts = AtomicU32::new(0);
        let hook = RecordingHook::new(None);

        let result = retry_with_backoff(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(err("API error 429 Too Many Requests: quota"))
                    } else {
                        Ok("done")
                    }
                }
            },
            &fast_retry_config(),
            AuthType::OauthPersonal,
            Some(&hook),
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(hook.call_count(), 1);
        assert_eq!(hook.calls.lock().unwrap()[0], AuthType::OauthPersonal);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(err("API error 401 Unauthorized: bad key")) }
            },
            &fast_retry_config(),
            AuthType::ApiKey,
            None,
        )
        .await;

        assert_eq!(
            result.unwrap_err().to_string(),
            "API error 401 Unauthorized: bad key"
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 3,
            ..fast_retry_config()
        };
        let result: Result<(), _> = retry_with_backoff(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err(err(&format!("API error 502 Bad Gateway: try {n}"))) }
            },
            &config,
            AuthType::ApiKey,
            None,
        )
        .await;

        assert_eq!(
            result.unwrap_err().to_string(),
            "API error 502 Bad Gateway: try 2"
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fallback_resets_attempt_budget() {
        let attempts = AtomicU32::new(0);
        let hook = RecordingHook::new(Some("flash"));
        let config = RetryConfig {
            max_attempts: 2,
            ..fast_retry_config()
        };

        // Two 429s would exhaust a budget of two, but the switch resets it.
        let result = retry_with_backoff(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(err("API error 429 Too Many Requests: quota"))
                    } else {
                        Ok(n)
                    }
                }
            },
            &config,
            AuthType::OauthPersonal,
            Some(&hook),
        )
        .await;

        // Budget of 2 ends at the second 429 before the hook can run.
        assert!(result.is_err());
        assert_eq!(hook.call_count(), 0);

        let attempts = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 3,
            ..fast_retry_config()
        };
        let result = retry_with_backoff(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 4 {
                        Err(err("API error 429 Too Many Requests: quota"))
                    } else {
                        Ok(n)
                    }
                }
            },
            &config,
            AuthType::OauthPersonal,
            Some(&hook),
        )
        .await;

        // 429 at attempts 1,2 -> switch (reset); 429 at 1,2 -> switch again; success.
        assert_eq!(result.unwrap(), 4);
        assert_eq!(hook.call_count(), 2);
    }

    #[tokio::test]
    async fn server_errors_reset_rate_limit_streak() {
        let attempts = AtomicU32::new(0);
        let hook = RecordingHook::new(None);

        let result = retry_with_backoff(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 | 2 => Err(err("API error 429 Too Many Requests: quota")),
                        1 => Err(err("API error 500 Internal Server Error: boom")),
                        _ => Ok(()),
                    }
                }
            },
            &fast_retry_config(),
            AuthType::OauthPersonal,
            Some(&hook),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(hook.call_count(), 0);
    }
}
