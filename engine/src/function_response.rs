//! Conversion of tool output into `functionResponse` parts.

use parley_types::{FunctionResponse, Part};
use serde_json::{Value, json};

use crate::tools::ToolContent;

const GENERIC_SUCCESS: &str = "Tool execution succeeded.";

fn response_part(call_id: &str, name: &str, response: Value) -> Part {
    Part::FunctionResponse(FunctionResponse {
        id: Some(call_id.to_string()),
        name: name.to_string(),
        response,
    })
}

fn output_part(call_id: &str, name: &str, output: &str) -> Part {
    response_part(call_id, name, json!({ "output": output }))
}

/// A `functionResponse` carrying `{"error": message}`.
#[must_use]
pub fn error_response_part(call_id: &str, name: &str, message: &str) -> Part {
    response_part(call_id, name, json!({ "error": message }))
}

/// Map a tool's raw output to the parts sent back to the model.
///
/// | Output | Parts |
/// |--------|-------|
/// | string | `{output: <string>}` |
/// | one text part | `{output: <text>}` |
/// | one binary part | placeholder response, then the original part |
/// | empty list | `{output: "Tool execution succeeded."}` |
/// | anything else | generic response, then every original part |
///
/// A one-element list is treated as that single part.
#[must_use]
pub fn convert_to_function_response(call_id: &str, name: &str, content: &ToolContent) -> Vec<Part> {
    match content {
        ToolContent::Text(text) => vec![output_part(call_id, name, text)],
        ToolContent::Part(part) => convert_single(call_id, name, part),
        ToolContent::Parts(parts) => match parts.as_slice() {
            [] => vec![output_part(call_id, name, GENERIC_SUCCESS)],
            [part] => convert_single(call_id, name, part),
            _ => {
                let mut out = Vec::with_capacity(parts.len() + 1);
                out.push(output_part(call_id, name, GENERIC_SUCCESS));
                out.extend(parts.iter().cloned());
                out
            }
        },
    }
}

fn convert_single(call_id: &str, name: &str, part: &Part) -> Vec<Part> {
    if let Part::Text(text) = part {
        return vec![output_part(call_id, name, text)];
    }
    if let Some(mime_type) = part.mime_type() {
        let placeholder = format!("Binary content of type {mime_type} was processed.");
        return vec![output_part(call_id, name, &placeholder), part.clone()];
    }
    vec![output_part(call_id, name, GENERIC_SUCCESS), part.clone()]
}
