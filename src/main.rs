use std::time::Duration;

use clap::Parser;
use codex_openai_bridge::{run_server, BridgeConfig};

#[derive(Debug, Parser)]
#[command(name = "codex-openai-bridge")]
#[command(about = "OpenAI-compatible Chat Completions bridge for codex mcp-server", version)]
struct Cli {
    /// Flags override the matching environment variables.
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    model_id: Option<String>,

    #[arg(long)]
    codex_bin: Option<String>,

    #[arg(long)]
    codex_profile: Option<String>,

    #[arg(long)]
    rpc_timeout_ms: Option<u64>,

    #[arg(long)]
    sse_keepalive_ms: Option<u64>,

    #[arg(long)]
    stream_chunk_chars: Option<i64>,

    #[arg(long)]
    hard_request_timeout_ms: Option<u64>,

    #[arg(long)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(error = %err, "codex-openai-bridge failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut config = BridgeConfig::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(model_id) = cli.model_id {
        config.model_id = model_id;
    }
    if let Some(codex_bin) = cli.codex_bin {
        config.codex_bin = codex_bin;
    }
    if let Some(codex_profile) = cli.codex_profile {
        config.codex_profile = codex_profile;
    }
    if let Some(ms) = cli.rpc_timeout_ms {
        config.rpc_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = cli.sse_keepalive_ms {
        config.sse_keepalive = Duration::from_millis(ms);
    }
    if let Some(chars) = cli.stream_chunk_chars {
        config.stream_chunk_chars = chars;
    }
    if let Some(ms) = cli.hard_request_timeout_ms {
        config.hard_request_timeout = Duration::from_millis(ms);
    }
    if let Some(api_key) = cli.api_key {
        config.api_key = Some(api_key).filter(|key| !key.is_empty());
    }

    run_server(config).await
}
