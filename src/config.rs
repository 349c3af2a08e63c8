use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "openclaw-relay")]
#[command(about = "Bridges Feishu webhooks/sockets to OpenClaw agent clients")]
pub struct Config {
    /// HTTP port for the webhook and health endpoints.
    #[arg(long, default_value_t = 5178)]
    pub api_port: u16,

    /// WebSocket port for platform-side connections.
    #[arg(long, default_value_t = 5189)]
    pub platform_ws_port: u16,

    /// WebSocket port for agent-side connections.
    #[arg(long, default_value_t = 5190)]
    pub agent_ws_port: u16,

    #[arg(long, env = "FEISHU_APP_ID", default_value = "")]
    pub app_id: String,

    #[arg(long, env = "FEISHU_APP_SECRET", default_value = "")]
    pub app_secret: String,

    /// Key Feishu uses to AES-encrypt webhook payloads. Empty disables
    /// decryption (plaintext envelopes only).
    #[arg(long, env = "FEISHU_ENCRYPT_KEY", default_value = "")]
    pub encrypt_key: String,

    /// Secret for signing and verifying relay credentials.
    #[arg(long, env = "RELAY_TOKEN_SECRET", default_value = "default-secret-change-me")]
    pub token_secret: String,

    #[arg(long, default_value = "https://open.feishu.cn")]
    pub feishu_base_url: String,

    /// Offline-queue drain tick in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub drain_interval_ms: u64,

    /// Retries after the first attempt for upstream API sends.
    #[arg(long, default_value_t = 2)]
    pub send_retries: u32,

    /// Backoff between upstream retries in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub retry_delay_ms: u64,

    /// Per-attempt upstream request timeout in seconds.
    #[arg(long, default_value_t = 10)]
    pub request_timeout_secs: u64,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}
