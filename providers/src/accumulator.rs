//! Reassembly of tool calls streamed as argument fragments.
//!
//! Chat Completions streams deliver a tool call's JSON arguments in pieces,
//! spread over many chunks and keyed by a backend-assigned index. The
//! accumulator collects them for the lifetime of one stream and parses the
//! result only once the backend signals the `tool_calls` finish reason.

use std::collections::BTreeMap;

use parley_types::{FunctionCall, Part};

use crate::convert::{TranslateError, parse_tool_arguments, synthetic_call_id};
use crate::wire::ToolCallDelta;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Per-stream tool-call state, keyed by delta index.
#[derive(Debug, Default)]
pub struct StreamToolCallAccumulator {
    calls: BTreeMap<u32, PendingToolCall>,
}

impl StreamToolCallAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one delta into the accumulated state.
    ///
    /// The first delta seen for an index creates the entry and captures its
    /// id and name. Later deltas only append argument text. Deltas without an
    /// index cannot be attributed and are skipped.
    pub fn push(&mut self, delta: &ToolCallDelta) {
        let Some(index) = delta.index else {
            tracing::debug!("Skipping tool call delta without index");
            return;
        };
        let fragment = delta
            .function
            .as_ref()
            .and_then(|f| f.arguments.as_deref())
            .unwrap_or_default();

        match self.calls.get_mut(&index) {
            Some(call) => call.arguments.push_str(fragment),
            None => {
                let name = delta
                    .function
                    .as_ref()
                    .and_then(|f| f.name.clone())
                    .unwrap_or_default();
                self.calls.insert(
                    index,
                    PendingToolCall {
                        id: delta.id.clone().unwrap_or_default(),
                        name,
                        arguments: fragment.to_string(),
                    },
                );
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Parse every accumulated call, in index order, into `functionCall` parts.
    ///
    /// Consumes the accumulator. Any argument string that is not valid JSON
    /// fails the whole batch. Calls streamed without an id get a synthetic one.
    pub fn finish(self) -> Result<Vec<Part>, TranslateError> {
        self.calls
            .into_iter()
            .map(|(index, call)| {
                let args = parse_tool_arguments(index, &call.name, &call.arguments)?;
                let id = if call.id.is_empty() {
                    synthetic_call_id(&call.name, index)
                } else {
                    call.id
                };
                Ok(Part::FunctionCall(FunctionCall::new(Some(id), call.name, args)))
            })
            .collect()
    }
}
