//! `current_time`: the one built-in tool, so the agent loop has something to call.

use chrono::{Local, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use parley_engine::tools::parse_args;
use parley_engine::{Tool, ToolFut, ToolResult};

#[derive(Debug, Default, Deserialize)]
struct ClockArgs {
    #[serde(default)]
    utc: bool,
}

#[derive(Debug, Default)]
pub struct CurrentTimeTool;

impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Returns the current date and time in RFC 3339 format."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "utc": {
                    "type": "boolean",
                    "description": "Report UTC instead of local time."
                }
            }
        })
    }

    fn execute<'a>(&'a self, args: &'a Value, _cancel: CancellationToken) -> ToolFut<'a, ToolResult> {
        Box::pin(async move {
            let args: ClockArgs = if args.is_null() {
                ClockArgs::default()
            } else {
                parse_args(args)?
            };
            let now = if args.utc {
                Utc::now().to_rfc3339()
            } else {
                Local::now().to_rfc3339()
            };
            Ok(ToolResult::new(now.clone()).with_display(now))
        })
    }
}
