//! Per-request SSE stream state, the registry keyed by request id, and the
//! alias table that correlates upstream-chosen ids back to streams.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::openai;

pub fn sse_data(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

pub fn sse_comment(text: &str) -> Bytes {
    Bytes::from(format!(": {text}\n\n"))
}

pub fn sse_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Write handle for one SSE response body. Sends are non-blocking; a failed
/// send means the downstream socket is gone.
#[derive(Debug)]
pub struct StreamSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl StreamSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn write(&self, frame: Bytes) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// State of one in-flight streaming chat completion.
#[derive(Debug)]
pub struct ActiveStream {
    pub stream_id: String,
    pub created: u64,
    pub model: String,
    sink: StreamSink,
    pub closed: bool,
    pub done: bool,
    pub has_streamed_delta: bool,
    pub emitted_text: String,
    pub last_event_at: Instant,
    pub(crate) keepalive: Option<JoinHandle<()>>,
    pub(crate) hard_timeout: Option<JoinHandle<()>>,
}

impl ActiveStream {
    pub fn new(stream_id: String, created: u64, model: String, sink: StreamSink) -> Self {
        Self {
            stream_id,
            created,
            model,
            sink,
            closed: false,
            done: false,
            has_streamed_delta: false,
            emitted_text: String::new(),
            last_event_at: Instant::now(),
            keepalive: None,
            hard_timeout: None,
        }
    }

    fn write(&mut self, frame: Bytes) {
        if self.closed {
            return;
        }
        if !self.sink.write(frame) {
            self.closed = true;
        }
    }

    /// One `chat.completion.chunk` frame per substring of at most
    /// `chunk_chars` characters; no-op once done or closed.
    pub fn emit_content(&mut self, content: &str, chunk_chars: i64) {
        if self.done || self.closed || content.is_empty() {
            return;
        }
        for piece in split_chunks(content, chunk_chars) {
            let chunk = openai::completion_chunk(
                &self.stream_id,
                self.created,
                &self.model,
                None,
                Some(piece),
                None,
            );
            self.write(sse_data(&chunk));
        }
    }

    pub fn emit_keepalive(&mut self) {
        if self.done || self.closed {
            return;
        }
        self.write(sse_comment(&format!("keepalive {}", openai::epoch_millis())));
    }

    /// Finish frame and `[DONE]`. Called only from the completion path, after
    /// `done` is set, so it bypasses the `done` guard.
    pub(crate) fn emit_termination(&mut self, finish_reason: &str) {
        let chunk = openai::completion_chunk(
            &self.stream_id,
            self.created,
            &self.model,
            None,
            None,
            Some(finish_reason),
        );
        self.write(sse_data(&chunk));
        self.write(sse_done());
    }

    pub(crate) fn cancel_timers(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
        if let Some(handle) = self.hard_timeout.take() {
            handle.abort();
        }
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

fn split_chunks(content: &str, chunk_chars: i64) -> Vec<&str> {
    if chunk_chars <= 0 {
        return vec![content];
    }
    let limit = chunk_chars as usize;
    let mut pieces = Vec::new();
    let mut rest = content;
    while !rest.is_empty() {
        let end = rest
            .char_indices()
            .nth(limit)
            .map(|(index, _)| index)
            .unwrap_or(rest.len());
        pieces.push(&rest[..end]);
        rest = &rest[end..];
    }
    pieces
}

/// Active streams by request id, plus learned aliases pointing back at them.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: HashMap<String, ActiveStream>,
    aliases: HashMap<String, String>,
}

impl StreamRegistry {
    pub fn insert(&mut self, request_id: String, stream: ActiveStream) {
        self.streams.insert(request_id, stream);
    }

    /// Removes a stream and purges every alias pointing at it.
    pub fn remove(&mut self, request_id: &str) -> Option<ActiveStream> {
        let stream = self.streams.remove(request_id)?;
        self.aliases.retain(|_, target| target != request_id);
        Some(stream)
    }

    pub fn get_mut(&mut self, request_id: &str) -> Option<&mut ActiveStream> {
        self.streams.get_mut(request_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }

    /// First-write-wins: an alias already claimed by another stream is kept.
    pub fn record_alias(&mut self, alias: &str, request_id: &str) {
        if alias == request_id {
            return;
        }
        self.aliases
            .entry(alias.to_string())
            .or_insert_with(|| request_id.to_string());
    }

    /// Resolves an event to a stream: candidate fields first, then their
    /// alias targets, then the sole active stream if there is exactly one.
    /// The bool is true when the sole-stream fallback was used.
    pub fn resolve(&self, candidates: &[String]) -> Option<(String, bool)> {
        for candidate in candidates {
            if self.streams.contains_key(candidate) {
                return Some((candidate.clone(), false));
            }
        }
        for candidate in candidates {
            if let Some(target) = self.aliases.get(candidate) {
                if self.streams.contains_key(target) {
                    return Some((target.clone(), false));
                }
            }
        }
        if self.streams.len() == 1 {
            return self.streams.keys().next().map(|id| (id.clone(), true));
        }
        None
    }
}

/// Every string-valued id-like field of an event notification, in a stable
/// order: `_meta.requestId`, `_meta.id`, `id`, `requestId`, `responseId`,
/// `response_id`, first on `params` and then on `params.msg`.
pub fn candidate_ids(params: &Value) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let bases = [Some(params), params.get("msg")];
    for base in bases.into_iter().flatten() {
        let fields = [
            base.get("_meta").and_then(|meta| meta.get("requestId")),
            base.get("_meta").and_then(|meta| meta.get("id")),
            base.get("id"),
            base.get("requestId"),
            base.get("responseId"),
            base.get("response_id"),
        ];
        for field in fields.into_iter().flatten() {
            if let Some(id) = field.as_str() {
                if !id.is_empty() && !out.iter().any(|seen| seen == id) {
                    out.push(id.to_string());
                }
            }
        }
    }
    out
}
