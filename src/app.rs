//! HTTP surface: health, model listing, embeddings stub, and the OpenAI
//! chat-completions endpoint in both JSON and SSE form.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::openai::{self, ChatCompletionRequest, EmbeddingsRequest};
use crate::runtime::{BridgeError, BridgeRuntime, StreamOutcome};
use crate::streams::{self, StreamSink};

pub fn build_router(runtime: Arc<BridgeRuntime>) -> Router {
    let api = Router::new()
        .route("/v1/models", get(get_models))
        .route("/v1/embeddings", post(post_embeddings))
        .route("/v1/chat/completions", post(post_chat_completions))
        .route_layer(middleware::from_fn_with_state(runtime.clone(), require_auth));

    Router::new()
        .route("/health", get(get_health))
        .merge(api)
        .with_state(runtime)
}

/// Checks the configured API key on every route this layer covers; `/health`
/// is registered outside the layer and stays open.
async fn require_auth(
    State(runtime): State<Arc<BridgeRuntime>>,
    request: Request,
    next: Next,
) -> Response {
    let config = runtime.config();
    let Some(expected) = config.api_key.as_deref() else {
        return next.run(request).await;
    };

    let headers = request.headers();
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    let custom = HeaderName::try_from(config.api_key_header.as_str())
        .ok()
        .and_then(|name| headers.get(&name))
        .and_then(|value| value.to_str().ok())
        .map(str::trim);

    let authorized = if config.require_bearer {
        bearer == Some(expected)
    } else {
        bearer == Some(expected) || custom == Some(expected)
    };

    if authorized {
        next.run(request).await
    } else {
        error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "missing or invalid api key",
        )
    }
}

async fn get_health(State(runtime): State<Arc<BridgeRuntime>>) -> Json<Value> {
    let status = runtime.status().await;
    Json(json!({
        "ok": true,
        "model": runtime.config().model_id,
        "codex": status,
    }))
}

async fn get_models(State(runtime): State<Arc<BridgeRuntime>>) -> Json<Value> {
    Json(openai::model_list(
        &runtime.config().model_id,
        openai::epoch_secs(),
    ))
}

async fn post_embeddings(
    State(runtime): State<Arc<BridgeRuntime>>,
    Json(request): Json<EmbeddingsRequest>,
) -> Json<Value> {
    let model = request
        .model
        .unwrap_or_else(|| runtime.config().model_id.clone());
    let inputs = request.input.into_vec();
    let mut prompt_tokens = 0;
    let data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .map(|(index, text)| {
            prompt_tokens += openai::approx_tokens(text);
            json!({
                "object": "embedding",
                "index": index,
                "embedding": openai::embedding_vector(text),
            })
        })
        .collect();
    Json(json!({
        "object": "list",
        "data": data,
        "model": model,
        "usage": { "prompt_tokens": prompt_tokens, "total_tokens": prompt_tokens },
    }))
}

async fn post_chat_completions(
    State(runtime): State<Arc<BridgeRuntime>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    if request.model != runtime.config().model_id {
        let err = BridgeError::UnknownModel(request.model.clone());
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            &err.to_string(),
        );
    }

    let prompt = openai::flatten_messages(&request.messages);
    if request.stream {
        stream_chat(runtime, prompt).await
    } else {
        complete_chat(runtime, prompt).await
    }
}

async fn complete_chat(runtime: Arc<BridgeRuntime>, prompt: String) -> Response {
    match runtime.call_tool(&prompt, None).await {
        Ok(result) => {
            let content = openai::tool_result_text(&result);
            let body = openai::completion_response(
                &openai::completion_id(),
                openai::epoch_secs(),
                &runtime.config().model_id,
                &prompt,
                &content,
            );
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => {
            tracing::warn!(error = %err, "tools/call failed");
            error_response(StatusCode::BAD_GATEWAY, "server_error", &err.to_string())
        }
    }
}

async fn stream_chat(runtime: Arc<BridgeRuntime>, prompt: String) -> Response {
    let request_id = runtime.next_request_id();
    let stream_id = openai::completion_id();
    let model = runtime.config().model_id.clone();
    let created = openai::epoch_secs();
    let (sink, rx) = StreamSink::channel();

    sink.write(streams::sse_comment(&format!(
        "connected {}",
        openai::epoch_millis()
    )));
    sink.write(streams::sse_data(&openai::completion_chunk(
        &stream_id,
        created,
        &model,
        Some("assistant"),
        None,
        None,
    )));

    runtime
        .register_stream(request_id.clone(), stream_id, created, sink)
        .await;

    {
        let runtime = runtime.clone();
        let request_id = request_id.clone();
        tokio::spawn(async move {
            let outcome = match runtime.call_tool(&prompt, Some(&request_id)).await {
                Ok(result) => StreamOutcome {
                    final_text: Some(openai::tool_result_text(&result)),
                    ..Default::default()
                },
                Err(err) => StreamOutcome {
                    error_text: Some(err.to_string()),
                    ..Default::default()
                },
            };
            runtime.complete_stream(&request_id, outcome).await;
        });
    }

    let body = Body::from_stream(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "message": message, "type": kind } })),
    )
        .into_response()
}
