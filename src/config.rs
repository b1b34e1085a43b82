use std::time::Duration;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MODEL_ID: &str = "codex";
const DEFAULT_CODEX_BIN: &str = "codex";
const DEFAULT_CODEX_PROFILE: &str = "clean";
const DEFAULT_RPC_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_SSE_KEEPALIVE_MS: u64 = 15_000;
const DEFAULT_HARD_REQUEST_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_API_KEY_HEADER: &str = "x-api-key";

/// Startup configuration, resolved once from environment variables and CLI
/// flags, then threaded through constructors.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub model_id: String,
    pub codex_bin: String,
    pub codex_profile: String,
    pub rpc_timeout: Duration,
    pub sse_keepalive: Duration,
    /// Max characters per SSE content chunk; zero or negative disables splitting.
    pub stream_chunk_chars: i64,
    pub hard_request_timeout: Duration,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub require_bearer: bool,
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            host: lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or(lookup("PORT"), DEFAULT_PORT),
            model_id: lookup("MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            codex_bin: lookup("CODEX_BIN").unwrap_or_else(|| DEFAULT_CODEX_BIN.to_string()),
            codex_profile: lookup("CODEX_PROFILE")
                .unwrap_or_else(|| DEFAULT_CODEX_PROFILE.to_string()),
            rpc_timeout: Duration::from_millis(parse_or(
                lookup("RPC_TIMEOUT_MS"),
                DEFAULT_RPC_TIMEOUT_MS,
            )),
            sse_keepalive: Duration::from_millis(parse_or(
                lookup("SSE_KEEPALIVE_MS"),
                DEFAULT_SSE_KEEPALIVE_MS,
            )),
            stream_chunk_chars: parse_or(lookup("STREAM_CHUNK_CHARS"), 0),
            hard_request_timeout: Duration::from_millis(parse_or(
                lookup("HARD_REQUEST_TIMEOUT_MS"),
                DEFAULT_HARD_REQUEST_TIMEOUT_MS,
            )),
            api_key: lookup("API_KEY").filter(|key| !key.is_empty()),
            api_key_header: lookup("API_KEY_HEADER")
                .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string()),
            require_bearer: parse_bool(lookup("REQUIRE_BEARER")),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("TRUE") | Some("yes")
    )
}
