#![cfg(unix)]
//! End-to-end coverage through the HTTP surface against a scripted mock
//! codex child.

use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

const MOCK_CODEX: &str = r#"#!/bin/sh
printf 'mock codex booting\n'
printf 'not json\n'
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  if [ -z "$id" ]; then
    continue
  fi
  printf '{"jsonrpc":"2.0","method":"codex/event","params":{"_meta":{"requestId":"%s"},"msg":{"type":"output_text_delta","delta":"Hello "}}}\n' "$id"
  printf '{"jsonrpc":"2.0","method":"codex/event","params":{"_meta":{"requestId":"%s"},"msg":{"type":"response.output_text.delta","delta":"world"}}}\n' "$id"
  printf '{"jsonrpc":"2.0","method":"codex/event","params":{"_meta":{"requestId":"%s"},"msg":{"type":"response.completed"}}}\n' "$id"
  printf '{"jsonrpc":"2.0","id":"%s","result":{"content":[{"type":"text","text":"Hello world"}]}}\n' "$id"
done
"#;

struct BridgeHandle {
    child: Child,
    base_url: String,
    _workdir: tempfile::TempDir,
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_mock_codex(dir: &Path) -> io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("mock-codex");
    std::fs::write(&path, MOCK_CODEX)?;
    let mut perms = std::fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)?;
    Ok(path)
}

fn spawn_bridge(extra_args: &[&str]) -> io::Result<BridgeHandle> {
    let workdir = tempfile::tempdir()?;
    let mock_codex = write_mock_codex(workdir.path())?;
    let port = pick_port()?;
    let base_url = format!("http://127.0.0.1:{port}");

    let child = Command::new(env!("CARGO_BIN_EXE_codex-openai-bridge"))
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string())
        .arg("--model-id")
        .arg("codex-e2e")
        .arg("--codex-bin")
        .arg(&mock_codex)
        .args(extra_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    Ok(BridgeHandle {
        child,
        base_url,
        _workdir: workdir,
    })
}

fn pick_port() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

async fn wait_for_health(base_url: &str) -> io::Result<()> {
    let client = Client::new();
    let deadline = Instant::now() + Duration::from_secs(10);

    loop {
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "bridge did not become healthy",
            ));
        }
        if let Ok(response) = client.get(format!("{base_url}/health")).send().await {
            if response.status() == StatusCode::OK {
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn read_sse_to_end(response: reqwest::Response) -> String {
    let mut stream = response.bytes_stream();
    let mut body = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), stream.next()).await {
            Ok(Some(Ok(bytes))) => body.extend_from_slice(&bytes),
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => panic!("timed out reading sse body"),
        }
    }
    String::from_utf8_lossy(&body).to_string()
}

fn sse_data_values(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).expect("chunk json"))
        .collect()
}

#[tokio::test]
async fn health_reports_model_and_codex_status() {
    let bridge = spawn_bridge(&[]).expect("spawn bridge");
    wait_for_health(&bridge.base_url).await.expect("healthy");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let body: Value = Client::new()
        .get(format!("{}/health", bridge.base_url))
        .send()
        .await
        .expect("health request")
        .json()
        .await
        .expect("health json");
    assert_eq!(body["ok"], true);
    assert_eq!(body["model"], "codex-e2e");
    assert!(body["codex"]["pid"].is_number());
}

#[tokio::test]
async fn non_streaming_completion_round_trips() {
    let bridge = spawn_bridge(&[]).expect("spawn bridge");
    wait_for_health(&bridge.base_url).await.expect("healthy");

    let response = Client::new()
        .post(format!("{}/v1/chat/completions", bridge.base_url))
        .json(&json!({
            "model": "codex-e2e",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .expect("completion request");
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.expect("completion json");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello world");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn streaming_completion_emits_deltas_and_one_done() {
    let bridge = spawn_bridge(&[]).expect("spawn bridge");
    wait_for_health(&bridge.base_url).await.expect("healthy");

    let response = Client::new()
        .post(format!("{}/v1/chat/completions", bridge.base_url))
        .json(&json!({
            "model": "codex-e2e",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }))
        .send()
        .await
        .expect("streaming request");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = read_sse_to_end(response).await;
    assert!(body.contains(": connected "));
    assert_eq!(body.matches("data: [DONE]").count(), 1);
    assert!(body.trim_end().ends_with("data: [DONE]"));

    let chunks = sse_data_values(&body);
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert!(chunks
        .iter()
        .all(|chunk| chunk["object"] == "chat.completion.chunk"));

    let content: String = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "Hello world");

    let finishes: Vec<&str> = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["finish_reason"].as_str())
        .collect();
    assert_eq!(finishes, vec!["stop"]);
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let bridge = spawn_bridge(&[]).expect("spawn bridge");
    wait_for_health(&bridge.base_url).await.expect("healthy");

    let response = Client::new()
        .post(format!("{}/v1/chat/completions", bridge.base_url))
        .json(&json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .expect("completion request");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: Value = response.json().await.expect("error json");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn api_key_gates_everything_except_health() {
    let bridge = spawn_bridge(&["--api-key", "secret123"]).expect("spawn bridge");
    wait_for_health(&bridge.base_url).await.expect("healthy");

    let client = Client::new();

    let denied = client
        .get(format!("{}/v1/models", bridge.base_url))
        .send()
        .await
        .expect("models request");
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let with_header = client
        .get(format!("{}/v1/models", bridge.base_url))
        .header("x-api-key", "secret123")
        .send()
        .await
        .expect("models request");
    assert_eq!(with_header.status(), StatusCode::OK);

    let with_bearer = client
        .get(format!("{}/v1/models", bridge.base_url))
        .bearer_auth("secret123")
        .send()
        .await
        .expect("models request");
    assert_eq!(with_bearer.status(), StatusCode::OK);
    let body: Value = with_bearer.json().await.expect("models json");
    assert_eq!(body["data"][0]["id"], "codex-e2e");

    let health = client
        .get(format!("{}/health", bridge.base_url))
        .send()
        .await
        .expect("health request");
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn embeddings_stub_is_deterministic() {
    let bridge = spawn_bridge(&[]).expect("spawn bridge");
    wait_for_health(&bridge.base_url).await.expect("healthy");

    let client = Client::new();
    let mut vectors = Vec::new();
    for _ in 0..2 {
        let body: Value = client
            .post(format!("{}/v1/embeddings", bridge.base_url))
            .json(&json!({ "model": "codex-e2e", "input": "same text" }))
            .send()
            .await
            .expect("embeddings request")
            .json()
            .await
            .expect("embeddings json");
        assert_eq!(body["object"], "list");
        vectors.push(body["data"][0]["embedding"].clone());
    }
    assert_eq!(vectors[0], vectors[1]);
}
