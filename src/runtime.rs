//! The bridge runtime: child-process supervision, JSON-RPC request
//! correlation, and delivery of upstream events into active SSE streams.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, Mutex, Notify};

use crate::coalesce;
use crate::codec::{self, RpcFrame};
use crate::config::BridgeConfig;
use crate::events::{self, NormalizedEvent};
use crate::streams::{self, ActiveStream, StreamRegistry, StreamSink};

const MAX_RESTART_DELAY_MS: u64 = 8_000;

#[derive(Debug, Error, Clone)]
pub enum BridgeError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("codex is not running")]
    Unavailable,
    #[error("RPC timeout for {0}")]
    RpcTimeout(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    ChildExit(String),
}

/// Snapshot of child and bridge health, served by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct CodexStatus {
    pub pid: Option<u32>,
    pub restarts: u64,
    pub uptime_secs: u64,
    pub pending_rpcs: usize,
    pub active_streams: usize,
}

/// Arguments for terminating a stream; `finish_reason` defaults to `stop`.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub final_text: Option<String>,
    pub error_text: Option<String>,
    pub finish_reason: Option<String>,
}

struct PendingRpc {
    tx: oneshot::Sender<Result<Value, BridgeError>>,
}

/// The pending-RPC map and the stream registry share one mutex; every
/// mutation of either is a single critical section.
#[derive(Default)]
struct Tables {
    pending: HashMap<String, PendingRpc>,
    streams: StreamRegistry,
}

#[derive(Default)]
struct ChildState {
    pid: Option<u32>,
    restarts: u64,
    spawned_at: Option<Instant>,
}

pub struct BridgeRuntime {
    config: BridgeConfig,
    tables: Mutex<Tables>,
    stdin: Mutex<Option<ChildStdin>>,
    child_state: StdMutex<ChildState>,
    next_rpc_id: AtomicU64,
    next_request_id: AtomicU64,
    shutting_down: AtomicBool,
    shutdown_notify: Notify,
}

impl BridgeRuntime {
    /// Builds a runtime without a child process. Callers drive
    /// `handle_notification`/`complete_stream` directly; production code
    /// uses [`BridgeRuntime::start`].
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            tables: Mutex::new(Tables::default()),
            stdin: Mutex::new(None),
            child_state: StdMutex::new(ChildState::default()),
            next_rpc_id: AtomicU64::new(0),
            next_request_id: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    /// Builds the runtime and starts the child supervisor.
    pub fn start(config: BridgeConfig) -> Arc<Self> {
        let runtime = Self::new(config);
        runtime.clone().spawn_supervisor();
        runtime
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn next_request_id(&self) -> String {
        format!(
            "req-{}",
            self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
        )
    }

    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down codex bridge");
        self.shutdown_notify.notify_one();
    }

    pub async fn status(&self) -> CodexStatus {
        let (pid, restarts, uptime_secs) = {
            let state = self.child_state.lock().unwrap_or_else(|e| e.into_inner());
            (
                state.pid,
                state.restarts,
                state
                    .spawned_at
                    .map(|at| at.elapsed().as_secs())
                    .unwrap_or(0),
            )
        };
        let tables = self.tables.lock().await;
        CodexStatus {
            pid,
            restarts,
            uptime_secs,
            pending_rpcs: tables.pending.len(),
            active_streams: tables.streams.len(),
        }
    }

    fn spawn_supervisor(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                if self.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                let failure = match self.run_child_once().await {
                    Ok(message) => message,
                    Err(err) => format!("codex spawn error: {err}"),
                };
                if self.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!(failure = %failure, "codex child is gone; failing in-flight work");
                self.fail_all(&failure).await;
                let restarts = {
                    let mut state = self.child_state.lock().unwrap_or_else(|e| e.into_inner());
                    state.pid = None;
                    state.spawned_at = None;
                    state.restarts += 1;
                    state.restarts
                };
                let delay = (1_000 * restarts).min(MAX_RESTART_DELAY_MS);
                tracing::info!(restarts, delay_ms = delay, "scheduling codex respawn");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
        });
    }

    /// Spawns the child, drains its stdout through the codec until EOF or
    /// shutdown, and returns the exit description.
    async fn run_child_once(&self) -> Result<String, std::io::Error> {
        let mut command = Command::new(&self.config.codex_bin);
        command.arg("--disable").arg("rmcp_client");
        if !self.config.codex_profile.is_empty() {
            command.arg("--profile").arg(&self.config.codex_profile);
        }
        command
            .arg("mcp-server")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::info!(
            bin = %self.config.codex_bin,
            profile = %self.config.codex_profile,
            "spawning codex mcp-server"
        );
        let mut child = command.spawn()?;
        let pid = child.id();
        tracing::info!(pid = ?pid, "codex spawned");

        {
            let mut state = self.child_state.lock().unwrap_or_else(|e| e.into_inner());
            state.pid = pid;
            state.spawned_at = Some(Instant::now());
        }
        *self.stdin.lock().await = child.stdin.take();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(pid = ?pid, "codex stderr: {line}");
                }
            });
        }

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let drain = async {
                while let Ok(Some(line)) = lines.next_line().await {
                    match codec::decode_line(&line) {
                        Some(RpcFrame::Response { id, result, error }) => {
                            self.dispatch_response(id, result, error).await;
                        }
                        Some(RpcFrame::Notification { method, params }) => {
                            self.handle_notification(&method, &params).await;
                        }
                        None => {}
                    }
                }
            };
            tokio::select! {
                _ = drain => {}
                _ = self.shutdown_notify.notified() => {
                    let _ = child.start_kill();
                }
            }
        }

        *self.stdin.lock().await = None;
        let status = child.wait().await?;
        Ok(exit_description(&status))
    }

    /// Fails every pending RPC and completes every active stream with a
    /// bridge-error message. Invoked on child exit and spawn failure.
    async fn fail_all(&self, message: &str) {
        let mut tables = self.tables.lock().await;
        let pending = std::mem::take(&mut tables.pending);
        let failed = pending.len();
        for (_, entry) in pending {
            let _ = entry
                .tx
                .send(Err(BridgeError::ChildExit(message.to_string())));
        }
        let stream_ids = tables.streams.ids();
        let streams_failed = stream_ids.len();
        for request_id in stream_ids {
            self.complete_locked(
                &mut tables,
                &request_id,
                StreamOutcome {
                    error_text: Some(message.to_string()),
                    ..Default::default()
                },
            );
        }
        if failed > 0 || streams_failed > 0 {
            tracing::warn!(
                pending_failed = failed,
                streams_failed,
                "failed in-flight work after codex exit"
            );
        }
    }

    pub async fn rpc(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let id = format!("rpc-{}", self.next_rpc_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.rpc_with_id(method, params, &id).await
    }

    /// Same as [`BridgeRuntime::rpc`] with a caller-supplied id; streaming
    /// calls reuse the stream's request id so late responses still resolve.
    pub async fn rpc_with_id(
        &self,
        method: &str,
        params: Value,
        id: &str,
    ) -> Result<Value, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.tables
            .lock()
            .await
            .pending
            .insert(id.to_string(), PendingRpc { tx });

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.write_request(&request).await {
            self.tables.lock().await.pending.remove(id);
            return Err(err);
        }

        match tokio::time::timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.tables.lock().await.pending.remove(id);
                Err(BridgeError::ChildExit(
                    "codex exited before responding".to_string(),
                ))
            }
            Err(_) => {
                self.tables.lock().await.pending.remove(id);
                Err(BridgeError::RpcTimeout(method.to_string()))
            }
        }
    }

    /// The single upstream operation the bridge issues: a `tools/call` of the
    /// `codex` tool with the flattened prompt.
    pub async fn call_tool(
        &self,
        prompt: &str,
        correlation_id: Option<&str>,
    ) -> Result<Value, BridgeError> {
        let params = json!({ "name": "codex", "arguments": { "prompt": prompt } });
        match correlation_id {
            Some(id) => self.rpc_with_id("tools/call", params, id).await,
            None => self.rpc("tools/call", params).await,
        }
    }

    async fn write_request(&self, payload: &Value) -> Result<(), BridgeError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(BridgeError::Unavailable);
        };
        codec::write_frame(stdin, payload).await.map_err(|err| {
            tracing::error!(error = %err, "failed writing to codex stdin");
            BridgeError::Unavailable
        })
    }

    async fn dispatch_response(&self, id: String, result: Option<Value>, error: Option<Value>) {
        let entry = self.tables.lock().await.pending.remove(&id);
        let Some(entry) = entry else {
            tracing::debug!(id = %id, "late response with no pending request dropped");
            return;
        };
        let outcome = match error {
            Some(error) => Err(BridgeError::Upstream(error.to_string())),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = entry.tx.send(outcome);
    }

    /// Registers a stream and arms its keepalive and hard-timeout timers.
    pub async fn register_stream(
        self: &Arc<Self>,
        request_id: String,
        stream_id: String,
        created: u64,
        sink: StreamSink,
    ) {
        let mut stream = ActiveStream::new(
            stream_id,
            created,
            self.config.model_id.clone(),
            sink,
        );

        if !self.config.sse_keepalive.is_zero() {
            let runtime = self.clone();
            let id = request_id.clone();
            let period = self.config.sse_keepalive;
            stream.keepalive = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let mut tables = runtime.tables.lock().await;
                    match tables.streams.get_mut(&id) {
                        Some(stream) => stream.emit_keepalive(),
                        None => break,
                    }
                }
            }));
        }

        if !self.config.hard_request_timeout.is_zero() {
            let runtime = self.clone();
            let id = request_id.clone();
            let timeout = self.config.hard_request_timeout;
            stream.hard_timeout = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                runtime
                    .complete_stream(
                        &id,
                        StreamOutcome {
                            error_text: Some(format!(
                                "hard timeout after {}ms",
                                timeout.as_millis()
                            )),
                            ..Default::default()
                        },
                    )
                    .await;
            }));
        }

        self.tables.lock().await.streams.insert(request_id, stream);
    }

    /// Routes one upstream event notification to its stream and applies the
    /// normalised events. Unroutable events are dropped.
    pub async fn handle_notification(&self, method: &str, params: &Value) {
        let Some(msg) = params.get("msg") else {
            tracing::debug!(method, "notification without msg payload ignored");
            return;
        };
        let normalized = events::normalize(msg);
        let candidates = streams::candidate_ids(params);

        let mut tables = self.tables.lock().await;
        let Some((request_id, used_fallback)) = tables.streams.resolve(&candidates) else {
            tracing::debug!(
                method,
                candidates = ?candidates,
                "event did not resolve to any stream"
            );
            return;
        };
        if used_fallback {
            tracing::debug!(
                method,
                request_id = %request_id,
                "correlation fallback to sole active stream"
            );
        }
        for alias in &candidates {
            tables.streams.record_alias(alias, &request_id);
        }

        for event in normalized {
            match event {
                NormalizedEvent::TextDelta(text) => {
                    self.apply_delta_locked(&mut tables, &request_id, &text);
                }
                NormalizedEvent::Error(text) => {
                    self.complete_locked(
                        &mut tables,
                        &request_id,
                        StreamOutcome {
                            error_text: Some(text),
                            ..Default::default()
                        },
                    );
                    break;
                }
                NormalizedEvent::Terminal => {
                    self.complete_locked(&mut tables, &request_id, StreamOutcome::default());
                    break;
                }
            }
        }
    }

    fn apply_delta_locked(&self, tables: &mut Tables, request_id: &str, incoming: &str) {
        let Some(stream) = tables.streams.get_mut(request_id) else {
            return;
        };
        if stream.done || stream.closed {
            return;
        }
        let suffix = coalesce::incremental_suffix(&stream.emitted_text, incoming);
        if suffix.is_empty() {
            return;
        }
        stream.has_streamed_delta = true;
        let suffix = suffix.to_string();
        coalesce::push_emitted(&mut stream.emitted_text, &suffix);
        stream.emit_content(&suffix, self.config.stream_chunk_chars);
        stream.last_event_at = Instant::now();
    }

    /// The single terminating entry point for a stream. Idempotent: a stream
    /// already completed (or never registered) is a no-op.
    pub async fn complete_stream(&self, request_id: &str, outcome: StreamOutcome) {
        let mut tables = self.tables.lock().await;
        self.complete_locked(&mut tables, request_id, outcome);
    }

    fn complete_locked(&self, tables: &mut Tables, request_id: &str, outcome: StreamOutcome) {
        let Some(mut stream) = tables.streams.remove(request_id) else {
            return;
        };
        if let Some(error_text) = &outcome.error_text {
            stream.emit_content(
                &format!("\n[bridge error] {error_text}\n"),
                self.config.stream_chunk_chars,
            );
        }
        if let Some(final_text) = &outcome.final_text {
            if !stream.has_streamed_delta {
                stream.emit_content(final_text, self.config.stream_chunk_chars);
            }
        }
        stream.done = true;
        stream.cancel_timers();
        let finish_reason = outcome.finish_reason.as_deref().unwrap_or("stop");
        stream.emit_termination(finish_reason);
    }
}

fn exit_description(status: &std::process::ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("codex exited (signal {signal})");
        }
    }
    match status.code() {
        Some(code) => format!("codex exited (code {code})"),
        None => "codex exited".to_string(),
    }
}
