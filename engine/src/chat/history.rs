//! Pure history derivations: the curated view and the per-exchange
//! consolidation rule. Nothing here touches the session lock.

use parley_types::{Content, Part, Role};

/// Comprehensive history minus every invalid model run and the user turn that
/// prompted it.
///
/// User turns are always kept. A run of consecutive model turns is kept only
/// when every turn in it is valid; otherwise the run is dropped and the
/// preceding user turn is removed with it.
#[must_use]
pub fn extract_curated_history(history: &[Content]) -> Vec<Content> {
    let mut curated: Vec<Content> = Vec::with_capacity(history.len());
    let mut i = 0;
    while i < history.len() {
        if history[i].role == Role::User {
            curated.push(history[i].clone());
            i += 1;
            continue;
        }

        let start = i;
        while i < history.len() && history[i].role == Role::Model {
            i += 1;
        }
        let run = &history[start..i];
        if run.iter().all(Content::is_valid) {
            curated.extend_from_slice(run);
        } else {
            curated.pop();
        }
    }
    curated
}

/// The part of a backend's automatic function-calling history that is new
/// relative to the curated history sent with the request.
///
/// The backend echoes the full request back, so the first `curated_len` turns
/// are already in history. A shorter echo contributes nothing.
#[must_use]
pub fn dedup_afc_history(full: &[Content], curated_len: usize) -> Vec<Content> {
    full.get(curated_len..).unwrap_or(&[]).to_vec()
}

/// Append one completed exchange to `history`.
///
/// * Thought turns are dropped; output made only of thoughts adds no model turn.
/// * Empty output for a non-function-response input adds an empty model turn.
/// * A non-empty automatic function-calling history replaces the user turn.
/// * Adjacent model text turns are merged into one.
pub fn record_history(
    history: &mut Vec<Content>,
    user_input: Content,
    model_output: Vec<Content>,
    afc_history: &[Content],
) {
    let had_output = !model_output.is_empty();
    let mut output: Vec<Content> = model_output
        .into_iter()
        .filter(|content| !content.is_thought_content())
        .collect();

    if output.is_empty() && !had_output && !user_input.is_function_response() {
        output.push(Content::new(Role::Model, Vec::new()));
    }

    if afc_history.is_empty() {
        history.push(user_input);
    } else {
        history.extend(extract_curated_history(afc_history));
    }

    history.extend(consolidate_text_turns(output));
}

fn consolidate_text_turns(output: Vec<Content>) -> Vec<Content> {
    let mut consolidated: Vec<Content> = Vec::with_capacity(output.len());
    for content in output {
        if content.is_text_content()
            && let Some(last) = consolidated.last_mut()
            && last.is_text_content()
        {
            let mut parts = content.parts.into_iter();
            if let (Some(Part::Text(extra)), Some(Part::Text(text))) =
                (parts.next(), last.parts.first_mut())
            {
                text.push_str(&extra);
            }
            last.parts.extend(parts);
            continue;
        }
        consolidated.push(content);
    }
    consolidated
}
