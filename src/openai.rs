//! OpenAI-compatible wire shapes: chat completion requests, completion and
//! chunk frames, the model listing, and the deterministic embeddings stub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{json, Value};

pub const EMBEDDING_DIMS: usize = 64;

static COMPLETION_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

/// Chat message content is either a plain string or an array of typed parts.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageContent {
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingsRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input: EmbeddingsInput,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingsInput {
    One(String),
    Many(Vec<String>),
}

impl Default for EmbeddingsInput {
    fn default() -> Self {
        Self::One(String::new())
    }
}

impl EmbeddingsInput {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(text) => vec![text],
            Self::Many(texts) => texts,
        }
    }
}

/// Flattens a chat messages array into a single prompt string: system
/// messages first, then the conversation in order, each as `role: content`.
pub fn flatten_messages(messages: &[ChatMessage]) -> String {
    let mut sections = Vec::with_capacity(messages.len());
    for message in messages.iter().filter(|m| m.role == "system") {
        sections.push(format!("{}: {}", message.role, message.content.as_text()));
    }
    for message in messages.iter().filter(|m| m.role != "system") {
        sections.push(format!("{}: {}", message.role, message.content.as_text()));
    }
    sections.join("\n\n")
}

/// Best-effort text extraction from a `tools/call` result: concatenated
/// `content[].text` entries of type `text`, else a string result verbatim,
/// else the JSON rendering of the result.
pub fn tool_result_text(result: &Value) -> String {
    if let Some(content) = result.get("content").and_then(Value::as_array) {
        let text: String = content
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        if !text.is_empty() {
            return text;
        }
    }
    if let Some(text) = result.as_str() {
        return text.to_string();
    }
    result.to_string()
}

/// Fresh `chatcmpl-…` id, unique within the process.
pub fn completion_id() -> String {
    let seq = COMPLETION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("chatcmpl-{:x}{seq:04x}", epoch_millis())
}

pub fn completion_chunk(
    id: &str,
    created: u64,
    model: &str,
    role: Option<&str>,
    content: Option<&str>,
    finish_reason: Option<&str>,
) -> Value {
    let mut delta = serde_json::Map::new();
    if let Some(role) = role {
        delta.insert("role".to_string(), Value::String(role.to_string()));
    }
    if let Some(content) = content {
        delta.insert("content".to_string(), Value::String(content.to_string()));
    }
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": Value::Object(delta),
            "finish_reason": finish_reason,
        }],
    })
}

pub fn completion_response(id: &str, created: u64, model: &str, prompt: &str, content: &str) -> Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": approx_tokens(prompt),
            "completion_tokens": approx_tokens(content),
            "total_tokens": approx_tokens(prompt) + approx_tokens(content),
        },
    })
}

pub fn model_list(model_id: &str, created: u64) -> Value {
    json!({
        "object": "list",
        "data": [{
            "id": model_id,
            "object": "model",
            "created": created,
            "owned_by": "codex-openai-bridge",
        }],
    })
}

/// Deterministic embedding: FNV-1a over the text seeds an xorshift expansion
/// into a fixed-dimension unit-range vector. Same input, same vector.
pub fn embedding_vector(text: &str) -> Vec<f32> {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let mut state = hash | 1;
    let mut out = Vec::with_capacity(EMBEDDING_DIMS);
    for _ in 0..EMBEDDING_DIMS {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let unit = (state >> 11) as f64 / (1u64 << 53) as f64;
        out.push((unit * 2.0 - 1.0) as f32);
    }
    out
}

pub fn approx_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
