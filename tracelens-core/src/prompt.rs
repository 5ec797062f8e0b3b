//! Prompt builder — turns a raw chain record into the analysis prompt
//!
//! Parses the captured detail-response text, orders the steps by time, and
//! renders a fixed-shape report fragment per step, wrapped in the
//! instructional preamble the model receives. An empty or absent step array
//! is a sentinel outcome, not an error, so the caller can short-circuit
//! without contacting the model.

use serde_json::Value;
use thiserror::Error;

use crate::models::ChainStep;

/// Result of prompt composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The finished prompt text.
    Prompt(String),
    /// The record parsed, but holds no usable step array. No analysis should
    /// be attempted.
    EmptyChain,
}

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("chain record is not valid JSON: {0}")]
    InvalidRecord(#[from] serde_json::Error),

    #[error("chain step {index} is not a step object: {source}")]
    MalformedStep {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Build the analysis prompt for one captured chain record.
///
/// `categories` narrows the model's focus; when non-empty, each category is
/// named (quoted, comma-joined) in the preamble.
pub fn build_prompt(raw_record: &str, categories: &[String]) -> Result<PromptOutcome, FormatError> {
    let record: Value = serde_json::from_str(raw_record)?;

    let items = match record.get("data").and_then(Value::as_array) {
        Some(items) if !items.is_empty() => items,
        _ => return Ok(PromptOutcome::EmptyChain),
    };

    let mut steps = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let step: ChainStep = serde_json::from_value(item.clone())
            .map_err(|source| FormatError::MalformedStep { index, source })?;
        steps.push(step);
    }

    // Stable: equal and unsortable keys keep their original relative order.
    steps.sort_by_key(ChainStep::ordering_key);

    let mut blocks = String::new();
    for (index, step) in steps.iter().enumerate() {
        blocks.push_str(&render_step(index + 1, step));
    }

    let focus = if categories.is_empty() {
        String::new()
    } else {
        let quoted: Vec<String> = categories.iter().map(|c| format!("\"{}\"", c)).collect();
        format!(
            ", focusing on the parts related to {}",
            quoted.join(", ")
        )
    };

    let prompt = format!(
        "Based on the following call-chain trace logs{focus}, analyze and summarize in this format:\n\
        \n\
        ### Analysis Report\n\
        \n\
        **1. Core Conclusion**\n\
        - State whether the request succeeded or failed overall\n\
        - On failure, point out the root cause and where it happened\n\
        - On success, summarize how the business goal was met\n\
        \n\
        **2. Call Chain Analysis**\n\
        - Walk the steps in order: what each one did, how long it took, and its role\n\
        - Show the key error messages or fields for the critical steps\n\
        \n\
        ### Log Data\n\
        {blocks}\n\
        Please begin the analysis:"
    );

    Ok(PromptOutcome::Prompt(prompt))
}

fn render_step(number: usize, step: &ChainStep) -> String {
    let service = step.app_name.as_deref().unwrap_or("unknown service");
    let operation = step.operation.as_deref().unwrap_or("unknown operation");
    let app_id = step.app_id.as_deref().unwrap_or("N/A");
    let log_type = step.log_type.as_deref().unwrap_or("unknown");
    let time = step.display_time().unwrap_or("N/A");
    let duration = match step.intervals {
        Some(ms) => format!("{}ms", ms),
        None => "N/A".to_string(),
    };
    let outcome = if is_successful(step) {
        "Success"
    } else {
        "Failure/unknown"
    };

    format!(
        "\n\
        **[Step {number}]: {service} - {operation}**\n\
        \n\
        * **Service:** {service} ({app_id})\n\
        * **Log type:** {log_type}\n\
        * **Request time:** {time}\n\
        * **Duration:** {duration}\n\
        * **Outcome:** {outcome}\n\
        \n\
        **Request body:**\n\
        ```json\n\
        {request}\n\
        ```\n\
        \n\
        **Response body:**\n\
        ```json\n\
        {response}\n\
        ```\n\
        ---",
        request = pretty_or_raw(step.request.as_deref()),
        response = pretty_or_raw(step.response.as_deref()),
    )
}

/// Re-serialize an embedded JSON payload with indentation; fall back to the
/// raw text when it does not parse. Absent payloads render as "none".
fn pretty_or_raw(payload: Option<&str>) -> String {
    let Some(payload) = payload else {
        return "none".to_string();
    };
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| payload.to_string()),
        Err(_) => payload.to_string(),
    }
}

/// Heuristic multi-protocol success detector. A step is successful when:
/// - its numeric `result` field is 0, or
/// - its response body parses as JSON and `ResponseStatus.Ack` is
///   `"Success"`, or
/// - the response carries a zero code (`Code` or `code`) together with an
///   explicit success flag (`IsSuccessful` / `isSuccessful` true, or `msg`
///   equal to `"Success"`).
///
/// Anything else — including an unparsable response body — is
/// failure/unknown.
pub fn is_successful(step: &ChainStep) -> bool {
    if step.result == Some(0.0) {
        return true;
    }

    let Some(response) = step.response.as_deref() else {
        return false;
    };
    let Ok(body) = serde_json::from_str::<Value>(response) else {
        return false;
    };

    if body
        .pointer("/ResponseStatus/Ack")
        .and_then(Value::as_str)
        == Some("Success")
    {
        return true;
    }

    let code_is_zero = body.get("Code").and_then(Value::as_i64) == Some(0)
        || body.get("code").and_then(Value::as_i64) == Some(0);
    let flagged_success = body.get("IsSuccessful").and_then(Value::as_bool) == Some(true)
        || body.get("isSuccessful").and_then(Value::as_bool) == Some(true)
        || body.get("msg").and_then(Value::as_str) == Some("Success");

    code_is_zero && flagged_success
}

// ============================================================================
// TESTS
// ============================================================================
