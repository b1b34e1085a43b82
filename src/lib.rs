use std::net::SocketAddr;
use std::sync::Arc;

pub mod app;
pub mod coalesce;
pub mod codec;
pub mod config;
pub mod events;
pub mod openai;
pub mod runtime;
pub mod streams;

pub use config::BridgeConfig;
pub use runtime::{BridgeError, BridgeRuntime, CodexStatus, StreamOutcome};
pub use streams::StreamSink;

pub async fn run_server(
    config: BridgeConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let runtime = BridgeRuntime::start(config);
    run_server_with_runtime(runtime).await
}

pub async fn run_server_with_runtime(
    runtime: Arc<BridgeRuntime>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!(
        "{}:{}",
        runtime.config().host,
        runtime.config().port
    )
    .parse()?;
    let app = app::build_router(runtime.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %addr,
        model = %runtime.config().model_id,
        "codex-openai-bridge listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(runtime))
        .await?;
    Ok(())
}

async fn shutdown_signal(runtime: Arc<BridgeRuntime>) {
    let _ = tokio::signal::ctrl_c().await;
    runtime.shutdown().await;
}
