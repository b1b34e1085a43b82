//! Normalisation of upstream codex event notifications.
//!
//! Event payloads vary across codex versions: type names change shape
//! (`response.output_text.delta` vs `output_text_delta`), delta text moves
//! between `delta`, `text`, `part.text` and `parts[]`, and failures arrive
//! either as dedicated `*_failed` events or as `error` members on otherwise
//! ordinary messages. This module reduces all of that to a small tagged
//! vocabulary the stream lifecycle can pattern-match on.

use serde_json::Value;

/// One normalised occurrence extracted from an event notification. A single
/// notification can produce several, in the order text-delta, error, terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    TextDelta(String),
    Error(String),
    Terminal,
}

const KNOWN_DELTA_TYPES: &[&str] = &[
    "content_delta",
    "output_text_delta",
    "assistant_content_delta",
    "final_content_delta",
    "reasoning_content_delta",
    "agent_reasoning_delta",
    "text_delta",
    "response_output_text_delta",
    "response_reasoning_text_delta",
];

/// Lower-cases and collapses runs of `.`, `-` and whitespace into single
/// underscores, so `"response.output_text.delta"`, `"Response-Output_Text-Delta"`
/// and `"response output_text delta"` all canonicalise identically.
pub fn canonical_type(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_underscore = false;
    for ch in raw.chars() {
        let mapped = if ch == '.' || ch == '-' || ch == '_' || ch.is_whitespace() {
            '_'
        } else {
            ch.to_ascii_lowercase()
        };
        if mapped == '_' {
            if !last_was_underscore {
                out.push('_');
            }
            last_was_underscore = true;
        } else {
            out.push(mapped);
            last_was_underscore = false;
        }
    }
    out
}

pub fn is_delta_type(canonical: &str) -> bool {
    KNOWN_DELTA_TYPES.contains(&canonical)
        || (canonical.ends_with("_delta") && has_text_or_content_segment(canonical))
}

fn has_text_or_content_segment(canonical: &str) -> bool {
    canonical
        .split('_')
        .any(|segment| segment == "text" || segment == "content")
}

pub fn is_terminal_type(canonical: &str) -> bool {
    matches!(
        canonical,
        "response_completed" | "response_incomplete" | "response_failed"
    ) || (canonical.starts_with("response_")
        && (canonical.ends_with("_completed")
            || canonical.ends_with("_incomplete")
            || canonical.ends_with("_failed")))
}

fn implied_error_text(canonical: &str) -> Option<&'static str> {
    if !is_terminal_type(canonical) {
        return None;
    }
    if canonical.ends_with("_failed") || canonical == "response_failed" {
        Some("upstream response failed")
    } else if canonical.ends_with("_incomplete") || canonical == "response_incomplete" {
        Some("upstream response incomplete")
    } else {
        None
    }
}

/// Normalise the `params.msg` object of one event notification.
pub fn normalize(msg: &Value) -> Vec<NormalizedEvent> {
    let canonical = canonical_type(msg.get("type").and_then(Value::as_str).unwrap_or_default());
    let mut events = Vec::new();

    if is_delta_type(&canonical) {
        if let Some(text) = delta_text(msg) {
            events.push(NormalizedEvent::TextDelta(text));
        }
    }

    let has_error_member = msg
        .get("error")
        .map(|error| error.is_object() || error.is_string())
        .unwrap_or(false);
    let error_carrying = canonical.ends_with("_failed")
        || canonical.ends_with("_incomplete")
        || has_error_member;
    if error_carrying {
        if let Some(text) = error_text(msg, &canonical) {
            events.push(NormalizedEvent::Error(text));
        }
    }

    if is_terminal_type(&canonical) {
        events.push(NormalizedEvent::Terminal);
    }

    events
}

/// First non-empty of `msg.delta`, `msg.text`, `msg.part.text`, or the
/// concatenation of `msg.parts[].text`.
fn delta_text(msg: &Value) -> Option<String> {
    for direct in [msg.get("delta"), msg.get("text")] {
        if let Some(text) = direct.and_then(Value::as_str) {
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    if let Some(text) = msg
        .get("part")
        .and_then(|part| part.get("text"))
        .and_then(Value::as_str)
    {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(parts) = msg.get("parts").and_then(Value::as_array) {
        let joined: String = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        if !joined.is_empty() {
            return Some(joined);
        }
    }
    None
}

fn error_text(msg: &Value, canonical: &str) -> Option<String> {
    if let Some(text) = msg
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
    {
        return Some(text.to_string());
    }
    if let Some(text) = msg.get("error").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    if let Some(text) = msg.get("message").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    implied_error_text(canonical).map(str::to_string)
}
