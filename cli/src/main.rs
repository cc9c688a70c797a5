//! Parley CLI - one-shot agent runs against an OpenAI-compatible backend.
//!
//! ```text
//! main() -> ParleyConfig -> ChatSession + ToolScheduler -> Agent::run(prompt)
//!                                                             |
//!                                                             v
//!                                     stream turn -> run tools -> send responses
//! ```
//!
//! The prompt comes from the command line, or stdin when no arguments are
//! given. Ctrl-C cancels the in-flight turn and any running tools.

mod agent;
mod clock;
mod confirm;

use std::{
    env,
    fs::{self, File, OpenOptions},
    io::{self, IsTerminal, Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use parley_config::ParleyConfig;
use parley_engine::{
    ChatSession, Config, ConfirmationHandler, GenerationConfig, RetryConfig, ToolRegistry,
    ToolScheduler, TracingTelemetry,
};
use parley_providers::{OpenAiContentGenerator, OpenAiSettings};

use crate::agent::{Agent, StopReason};
use crate::clock::CurrentTimeTool;
use crate::confirm::PromptConfirmation;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    let (log_file, init_warnings) = open_parley_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Model output owns stdout; without a log file, stay quiet rather than
    // interleave logs with it.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_parley_log_file() -> (Option<(PathBuf, File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in parley_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn parley_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.parley/logs/parley.log
    if let Some(config_path) = ParleyConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("parley.log"));
    }

    // Fallback: ./.parley/logs/parley.log
    candidates.push(PathBuf::from(".parley").join("logs").join("parley.log"));

    candidates
}

fn read_prompt() -> Result<String> {
    let args: Vec<String> = env::args().skip(1).collect();
    if !args.is_empty() {
        return Ok(args.join(" "));
    }
    if io::stdin().is_terminal() {
        bail!("usage: parley <prompt>  (or pipe the prompt on stdin)");
    }
    let mut prompt = String::new();
    io::stdin()
        .read_to_string(&mut prompt)
        .context("failed to read prompt from stdin")?;
    Ok(prompt)
}

fn retry_config(file: &ParleyConfig) -> RetryConfig {
    let mut retry = RetryConfig::default();
    if let Some(section) = &file.retry {
        if let Some(max_attempts) = section.max_attempts {
            retry.max_attempts = max_attempts.max(1);
        }
        if let Some(delay) = section.initial_delay() {
            retry.initial_delay = delay;
        }
        if let Some(delay) = section.max_delay() {
            retry.max_delay = delay;
        }
        if let Some(threshold) = section.persistent_429_threshold {
            retry.persistent_429_threshold = threshold;
        }
    }
    retry
}

fn build_agent(file: &ParleyConfig) -> Result<Agent> {
    let telemetry_section = file.telemetry();
    let config = Arc::new(
        Config::new(file.model())
            .with_fallback_model(file.fallback_model())
            .with_auth_type(file.auth_type())
            .with_usage_statistics(telemetry_section.enabled)
            .with_log_prompts(telemetry_section.log_prompts)
            .with_debug_mode(file.debug()),
    );

    let mut settings = OpenAiSettings {
        api_key: file.api_key(),
        ..Default::default()
    };
    if let Some(base_url) = file.base_url() {
        settings.base_url = base_url;
    }
    if let Some(timeout) = file.stream_idle_timeout() {
        settings.stream_idle_timeout = timeout;
    }
    let generator = OpenAiContentGenerator::new(settings)?;

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(CurrentTimeTool))?;
    let registry = Arc::new(registry);

    let telemetry = Arc::new(TracingTelemetry::from_config(&config));
    let generation_config = GenerationConfig {
        tools: registry.tool_groups(),
        ..Default::default()
    };
    let session = ChatSession::new(
        Arc::clone(&config),
        Arc::new(generator),
        generation_config,
        Vec::new(),
    )
    .with_retry_config(retry_config(file))
    .with_telemetry(telemetry.clone());

    let confirmer: Arc<dyn ConfirmationHandler> = Arc::new(PromptConfirmation::stdin());
    let scheduler = ToolScheduler::new(registry, confirmer).with_telemetry(telemetry);

    tracing::info!(
        session_id = config.session_id(),
        model = %config.model(),
        "Session started"
    );
    Ok(Agent::new(session, scheduler, file.max_turns()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let file = match ParleyConfig::load() {
        Ok(file) => file.unwrap_or_default(),
        Err(e) => {
            eprintln!("warning: {e}; using defaults");
            ParleyConfig::default()
        }
    };

    let prompt = read_prompt()?;
    if prompt.trim().is_empty() {
        bail!("prompt is empty");
    }

    let agent = build_agent(&file)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted");
            on_signal.cancel();
        }
    });

    let mut stdout = io::stdout().lock();
    let summary = agent.run(prompt.trim(), &cancel, &mut stdout).await?;
    stdout.flush()?;

    tracing::info!(
        turns = summary.turns,
        tool_calls = summary.tool_calls,
        stop = ?summary.stop,
        "Run finished"
    );
    match summary.stop {
        StopReason::Finished => Ok(()),
        StopReason::Cancelled => bail!("cancelled"),
        StopReason::TurnLimit => bail!("stopped after {} turns", summary.turns),
    }
}
