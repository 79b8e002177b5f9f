//! Hive Gateway - WebSocket 服务器
//!
//! 每个 WebSocket 连接对应一个会话。
//!
//! 运行方式：
//! ```bash
//! cargo run --bin hive-gateway --features gateway
//! ```

use std::sync::Arc;

use anyhow::Context;
use hive::config::load_or_default;
use hive::gateway::{Hub, HubConfig, Runtime, SessionManager};
use hive::tools::{EchoTool, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cfg = load_or_default(None);
    let bind_addr = std::env::var("GATEWAY_BIND").unwrap_or_else(|_| cfg.gateway.bind_addr.clone());

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool).context("Failed to register tools")?;

    let runtime = Arc::new(Runtime::from_config(&cfg, registry));
    let hub = Hub::new(HubConfig { bind_addr }, Arc::new(SessionManager::new(runtime)));

    let addr = hub.start().await.map_err(anyhow::Error::msg)?;
    tracing::info!("Hive gateway on ws://{}", addr);
    tracing::info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down gateway...");
    hub.stop().await;

    Ok(())
}
