//! Parsing of backend stdout lines.
//!
//! | `type`        | Maps to                         |
//! |---------------|---------------------------------|
//! | `partial`     | [`BackendLine::Partial`]        |
//! | `assistant`   | [`BackendLine::Partial`]        |
//! | `permission`  | [`BackendLine::Permission`]     |
//! | `result`      | [`BackendLine::Result`]         |
//! | `error`       | [`BackendLine::Error`]          |
//! | *(other)*     | skipped; logged at `DEBUG`      |
//!
//! Lines that are not JSON objects are plain assistant output and are
//! forwarded as partial text with their newline restored.

use serde::Deserialize;
use tracing::debug;

use crate::{AppError, Result};

/// One recognised line of backend output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendLine {
    /// Fragment of the in-progress answer.
    Partial(String),
    /// The backend needs a human decision.
    Permission(String),
    /// Final answer of the turn.
    Result {
        /// Answer text.
        result: String,
        /// Conversation id to resume on the next turn.
        backend_session_id: Option<String>,
    },
    /// The backend reported a failure.
    Error(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Parse a single line of backend stdout.
///
/// Returns `Ok(None)` for blank lines and unknown JSON `type`s.
///
/// # Errors
///
/// Returns `AppError::Backend("missing required field: …")` when a known
/// `type` lacks its payload field.
pub fn parse_line(line: &str) -> Result<Option<BackendLine>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') {
        return Ok(Some(BackendLine::Partial(format!("{line}\n"))));
    }

    let Ok(envelope) = serde_json::from_str::<Envelope>(trimmed) else {
        return Ok(Some(BackendLine::Partial(format!("{line}\n"))));
    };

    let field = |name: &str| -> Option<String> {
        envelope
            .rest
            .get(name)
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
    };

    match envelope.kind.as_str() {
        "partial" => field("text")
            .map(|text| Some(BackendLine::Partial(text)))
            .ok_or_else(|| missing("partial", "text")),
        "assistant" => Ok(parse_assistant(&envelope.rest)),
        "permission" => field("prompt")
            .map(|prompt| Some(BackendLine::Permission(prompt)))
            .ok_or_else(|| missing("permission", "prompt")),
        "result" => {
            let result = field("result").ok_or_else(|| missing("result", "result"))?;
            let backend_session_id = field("backend_session_id").or_else(|| field("session_id"));
            Ok(Some(BackendLine::Result {
                result,
                backend_session_id,
            }))
        }
        "error" => Ok(Some(BackendLine::Error(
            field("message").unwrap_or_else(|| "backend reported an error".into()),
        ))),
        other => {
            debug!(kind = other, "backend reader: skipping unknown line type");
            Ok(None)
        }
    }
}

fn parse_assistant(rest: &serde_json::Map<String, serde_json::Value>) -> Option<BackendLine> {
    let message: AssistantMessage = rest
        .get("message")
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())?;
    let text: String = message
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text)
        .collect();
    (!text.is_empty()).then_some(BackendLine::Partial(text))
}

fn missing(kind: &str, field: &str) -> AppError {
    AppError::Backend(format!("missing required field: {kind}.{field}"))
}
