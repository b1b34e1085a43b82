//! Line-delimited JSON-RPC framing for the codex subprocess stdio channel.

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;

const DIAGNOSTIC_MAX_CHARS: usize = 120;

/// A decoded frame from the child's stdout. Responses carry an `id`;
/// notifications carry a `method` and no `id`.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcFrame {
    Response {
        id: String,
        result: Option<Value>,
        error: Option<Value>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// Decode one stdout line. Blank lines and non-JSON lines yield `None`;
/// the latter are logged with a truncated excerpt and never abort the stream.
pub fn decode_line(line: &str) -> Option<RpcFrame> {
    let trimmed = line.trim_end_matches('\r').trim();
    if trimmed.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(
                error = %err,
                raw = %truncate(trimmed, DIAGNOSTIC_MAX_CHARS),
                "codex stdout: dropping non-JSON line"
            );
            return None;
        }
    };

    let object = value.as_object()?;
    match (object.get("id"), object.get("method")) {
        (Some(id), None) => Some(RpcFrame::Response {
            id: id_key(id),
            result: object.get("result").cloned(),
            error: object.get("error").cloned(),
        }),
        (None, Some(method)) => Some(RpcFrame::Notification {
            method: method.as_str().unwrap_or_default().to_string(),
            params: object.get("params").cloned().unwrap_or(Value::Null),
        }),
        _ => {
            // A message with both id and method is a child-initiated request;
            // the bridge never answers those.
            tracing::debug!(
                raw = %truncate(trimmed, DIAGNOSTIC_MAX_CHARS),
                "codex stdout: ignoring unexpected frame shape"
            );
            None
        }
    }
}

/// Serialise one payload as a single line and flush it to the child's stdin.
pub async fn write_frame(stdin: &mut ChildStdin, payload: &Value) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(payload).map_err(std::io::Error::other)?;
    bytes.push(b'\n');
    stdin.write_all(&bytes).await?;
    stdin.flush().await
}

/// Normalise a JSON-RPC id into a map key. String ids pass through; anything
/// else is keyed by its JSON rendering.
pub fn id_key(value: &Value) -> String {
    match value {
        Value::String(id) => id.clone(),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_a_response() {
        let frame = decode_line(r#"{"jsonrpc":"2.0","id":"rpc-1","result":{"ok":true}}"#);
        assert_eq!(
            frame,
            Some(RpcFrame::Response {
                id: "rpc-1".to_string(),
                result: Some(json!({"ok": true})),
                error: None,
            })
        );
    }

    #[test]
    fn decodes_a_notification() {
        let frame = decode_line(r#"{"jsonrpc":"2.0","method":"codex/event","params":{"msg":{}}}"#);
        let Some(RpcFrame::Notification { method, params }) = frame else {
            panic!("expected notification");
        };
        assert_eq!(method, "codex/event");
        assert_eq!(params, json!({"msg": {}}));
    }

    #[test]
    fn tolerates_crlf_and_blank_lines() {
        assert!(decode_line("\r").is_none());
        assert!(decode_line("  ").is_none());
        let frame = decode_line("{\"jsonrpc\":\"2.0\",\"id\":\"a\",\"result\":1}\r");
        assert!(matches!(frame, Some(RpcFrame::Response { .. })));
    }

    #[test]
    fn drops_non_json_without_failing() {
        assert!(decode_line("codex booting...").is_none());
        assert!(decode_line("{truncated").is_none());
    }

    #[test]
    fn ignores_child_initiated_requests() {
        let frame = decode_line(r#"{"jsonrpc":"2.0","id":"q-1","method":"elicit","params":{}}"#);
        assert!(frame.is_none());
    }

    #[test]
    fn non_string_ids_are_keyed_by_rendering() {
        assert_eq!(id_key(&json!(42)), "42");
        assert_eq!(id_key(&json!("req-9")), "req-9");
    }

    #[test]
    fn error_responses_carry_the_error_object() {
        let frame = decode_line(r#"{"jsonrpc":"2.0","id":"rpc-2","error":{"code":-32000,"message":"boom"}}"#);
        let Some(RpcFrame::Response { error, result, .. }) = frame else {
            panic!("expected response");
        };
        assert!(result.is_none());
        assert_eq!(error.unwrap()["message"], "boom");
    }
}
