//! Terminal confirmation prompt.

use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex as AsyncMutex;

use parley_engine::{
    ConfirmationDetails, ConfirmationHandler, ConfirmationOutcome, ToolCallRequest,
    tools::ConfirmFut,
};

/// Map a typed answer to an outcome. Anything unrecognised is a refusal.
pub fn parse_answer(answer: &str) -> ConfirmationOutcome {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ConfirmationOutcome::ProceedOnce,
        "a" | "always" => ConfirmationOutcome::ProceedAlwaysTool,
        _ => ConfirmationOutcome::Cancel,
    }
}

/// Asks on stderr and reads the answer from `input`. Tools approved with
/// "always" are not asked about again for the rest of the process.
pub struct PromptConfirmation<R> {
    input: AsyncMutex<Lines<R>>,
    always: Mutex<HashSet<String>>,
}

impl PromptConfirmation<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin> PromptConfirmation<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: AsyncMutex::new(input.lines()),
            always: Mutex::new(HashSet::new()),
        }
    }

    fn always_allowed(&self, tool: &str) -> bool {
        self.always
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(tool)
    }

    async fn ask(&self, request: &ToolCallRequest, details: &ConfirmationDetails) -> ConfirmationOutcome {
        if self.always_allowed(&request.name) {
            return ConfirmationOutcome::ProceedAlwaysTool;
        }

        let mut input = self.input.lock().await;
        {
            let mut err = io::stderr().lock();
            let _ = writeln!(err, "\n{}", details.title);
            let _ = writeln!(err, "  {}", details.description);
            let _ = write!(err, "Allow {}? [y]es / [a]lways / [N]o: ", request.name);
            let _ = err.flush();
        }

        let outcome = match input.next_line().await {
            Ok(Some(line)) => parse_answer(&line),
            Ok(None) => ConfirmationOutcome::Cancel,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read confirmation answer");
                ConfirmationOutcome::Cancel
            }
        };
        if outcome == ConfirmationOutcome::ProceedAlwaysTool {
            self.always
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(request.name.clone());
        }
        outcome
    }
}

impl<R: AsyncBufRead + Unpin + Send> ConfirmationHandler for PromptConfirmation<R> {
    fn confirm<'a>(
        &'a self,
        request: &'a ToolCallRequest,
        details: &'a ConfirmationDetails,
    ) -> ConfirmFut<'a> {
        Box::pin(self.ask(request, details))
    }
}
