use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use openclaw_relay::config::Config;
use openclaw_relay::{
    webhook, ws_agent, ws_platform, CredentialSigner, FeishuApi, MemoryStore, RelayEngine,
    TokenCache,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(&config.log_level);

    let store = Arc::new(MemoryStore::new());
    let signer = CredentialSigner::new(&config.token_secret);
    let tokens = TokenCache::new(
        &config.feishu_base_url,
        &config.app_id,
        &config.app_secret,
        store.clone(),
        Duration::from_secs(config.request_timeout_secs),
    );
    let api = FeishuApi::new(
        &config.feishu_base_url,
        tokens,
        config.send_retries,
        Duration::from_millis(config.retry_delay_ms),
        Duration::from_secs(config.request_timeout_secs),
    );
    let engine = Arc::new(RelayEngine::new(store, signer, api));

    let drain_tasks =
        engine.spawn_drain_loops(Duration::from_millis(config.drain_interval_ms.max(1)));

    serve(
        config.api_port,
        webhook::router(
            engine.clone(),
            Some(config.encrypt_key.clone()).filter(|k| !k.is_empty()),
        ),
        "webhook API",
    )
    .await?;
    serve(
        config.platform_ws_port,
        ws_platform::router(engine.clone()),
        "platform WS",
    )
    .await?;
    serve(
        config.agent_ws_port,
        ws_agent::router(engine.clone()),
        "agent WS",
    )
    .await?;

    tracing::info!(
        target = "openclaw_relay",
        api_port = config.api_port,
        platform_ws_port = config.platform_ws_port,
        agent_ws_port = config.agent_ws_port,
        "relay up"
    );

    shutdown_signal().await;
    tracing::info!(target = "openclaw_relay", "shutting down");
    for task in drain_tasks {
        task.abort();
    }
    Ok(())
}

/// Bind a listener and serve a router on a background task.
async fn serve(port: u16, router: axum::Router, label: &'static str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind {label} on port {port}"))?;
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router).await {
            tracing::error!(target = "openclaw_relay", error = %error, "{label} server error");
        }
    });
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing(log_level: &str) {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
